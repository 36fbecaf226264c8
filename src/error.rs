//! Error handling for the synsweep engine
//!
//! Input, privilege and state failures are surfaced to the caller through
//! [`ScanError`]. Network noise (spurious packets, stale replies, probe
//! timeouts) is absorbed by the session and never becomes an error.

use thiserror::Error;

/// Main error type for scanning operations
#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Permission denied: {0}")]
    PermissionError(String),

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Invalid port: {0}")]
    InvalidPort(i64),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Raw socket error: {0}")]
    RawSocketError(String),

    #[error("A scan is already running on this scanner")]
    AlreadyRunning,

    #[error("No scan is running on this scanner")]
    NotRunning,

    #[error("Transport has been closed")]
    TransportClosed,
}

impl ScanError {
    /// Map a socket-creation failure onto the privilege/resource taxonomy
    pub fn from_socket_error(e: std::io::Error, what: &str) -> Self {
        match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                ScanError::PermissionError(format!("Permission denied for {}", what))
            }
            _ if e.raw_os_error() == Some(libc::EPERM) => {
                ScanError::PermissionError(format!("Operation not permitted for {}", what))
            }
            _ => ScanError::RawSocketError(format!("{}: {}", what, e)),
        }
    }

    /// Whether this error came from missing privilege rather than bad input
    pub fn is_permission(&self) -> bool {
        matches!(self, ScanError::PermissionError(_))
    }
}

/// Convert common errors to ScanError
impl From<std::net::AddrParseError> for ScanError {
    fn from(e: std::net::AddrParseError) -> Self {
        ScanError::InvalidTarget(e.to_string())
    }
}

impl From<std::num::ParseIntError> for ScanError {
    fn from(e: std::num::ParseIntError) -> Self {
        ScanError::ParseError(e.to_string())
    }
}

impl From<ipnetwork::IpNetworkError> for ScanError {
    fn from(e: ipnetwork::IpNetworkError) -> Self {
        ScanError::InvalidTarget(e.to_string())
    }
}

impl From<toml::de::Error> for ScanError {
    fn from(e: toml::de::Error) -> Self {
        ScanError::ConfigError(format!("Failed to parse TOML: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_socket_error_mapping() {
        let denied = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        assert!(ScanError::from_socket_error(denied, "raw TCP socket").is_permission());

        let eperm = std::io::Error::from_raw_os_error(libc::EPERM);
        assert!(ScanError::from_socket_error(eperm, "raw TCP socket").is_permission());

        let other = std::io::Error::from_raw_os_error(libc::EMFILE);
        assert!(matches!(
            ScanError::from_socket_error(other, "raw TCP socket"),
            ScanError::RawSocketError(_)
        ));
    }

    #[test]
    fn test_parse_conversions() {
        let e: ScanError = "not-an-ip".parse::<std::net::IpAddr>().unwrap_err().into();
        assert!(matches!(e, ScanError::InvalidTarget(_)));

        let e: ScanError = "x".parse::<u8>().unwrap_err().into();
        assert!(matches!(e, ScanError::ParseError(_)));
    }
}
