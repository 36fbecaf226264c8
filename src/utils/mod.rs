//! Utility modules for the scanner

pub mod address_parser;
pub mod file_input;

use crate::scanner::ScanStats;

/// Logging utilities
pub struct Logger;

impl Logger {
    /// Initialize logger with specified level
    pub fn init(level: log::LevelFilter) {
        env_logger::Builder::from_default_env()
            .filter_level(level)
            .format_timestamp_secs()
            .init();
    }

    /// Map repeated `-v` flags onto a level filter
    pub fn level_for(verbosity: u8) -> log::LevelFilter {
        match verbosity {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Info,
            2 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        }
    }

    /// Log scan start
    pub fn log_scan_start(source: &str, addresses: u64, port: u16) {
        log::info!(
            "Starting SYN sweep of {} ({} addresses) on port {}",
            source,
            addresses,
            port
        );
    }

    /// Log scan completion
    pub fn log_scan_complete(stats: &ScanStats) {
        log::info!(
            "Sweep finished in {:.2}s - {} open, {:.0} pps, {:.1}% answered",
            stats.elapsed.as_secs_f64(),
            stats.open,
            stats.send_rate(),
            stats.response_rate()
        );
    }
}
