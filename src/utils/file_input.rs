//! Reading target lists from files or standard input

use anyhow::{Context, Result};
use std::fs;
use std::io::Read;
use std::path::Path;

/// Upper bound on a target list read into memory
const MAX_INPUT_BYTES: u64 = 256 * 1024 * 1024;

/// Read the raw target list from `path`, or from stdin when `path` is `-`
pub fn read_targets(path: &str) -> Result<String> {
    if path == "-" {
        let mut text = String::new();
        std::io::stdin()
            .take(MAX_INPUT_BYTES)
            .read_to_string(&mut text)
            .context("Failed to read targets from stdin")?;
        return Ok(text);
    }

    read_targets_file(Path::new(path))
}

/// Read a target file, refusing anything larger than the input cap
pub fn read_targets_file(path: &Path) -> Result<String> {
    let metadata = fs::metadata(path)
        .with_context(|| format!("Cannot access target file {}", path.display()))?;

    if metadata.len() > MAX_INPUT_BYTES {
        anyhow::bail!(
            "Target file {} is {} bytes, larger than the {} byte limit",
            path.display(),
            metadata.len(),
            MAX_INPUT_BYTES
        );
    }

    fs::read_to_string(path)
        .with_context(|| format!("Failed to read target file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_read_targets_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "10.0.0.0/30").unwrap();
        writeln!(file, "# comment").unwrap();

        let text = read_targets(file.path().to_str().unwrap()).unwrap();
        assert!(text.starts_with("10.0.0.0/30"));
    }

    #[test]
    fn test_missing_file_has_context() {
        let err = read_targets("/nonexistent/targets.txt").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/targets.txt"));
    }
}
