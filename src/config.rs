//! Configuration module for the synsweep engine

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::Path;
use std::time::Duration;

/// How long a probe stays eligible for a reply before it is dropped silently.
pub const OBSERVATION_WINDOW: Duration = Duration::from_millis(2_000);

/// First source port handed out to probes.
pub const DEFAULT_SOURCE_PORT_BASE: u16 = 32768;

/// Number of source ports probes are spread over (32768..61000).
pub const DEFAULT_SOURCE_PORT_SPAN: u16 = 28232;

/// Main configuration structure for scanning sessions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Rate limit in packets per second
    pub rate_limit: u64,

    /// Upper bound on probes awaiting a reply at any moment
    pub max_in_flight: usize,

    /// Observation window for each probe in milliseconds
    pub observation_window: u64,

    /// Report progress after this many dispatched addresses (the last
    /// address is always reported)
    pub progress_interval: u64,

    /// First source port used for probes
    pub source_port_base: u16,

    /// Number of source ports probes are spread over
    pub source_port_span: u16,

    /// Source address override for IPv4 probes
    pub source_ipv4: Option<Ipv4Addr>,

    /// Source address override for IPv6 probes
    pub source_ipv6: Option<Ipv6Addr>,

    /// Raw socket receive poll interval in milliseconds
    pub receive_poll: u64,

    /// After a cancel, how long in-flight probes may still be answered
    /// before they are abandoned, in milliseconds (capped by the window)
    pub cancel_grace: u64,

    /// Worker threads of the scanner runtime (auto when unset)
    pub worker_threads: Option<usize>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            rate_limit: 20_000,
            max_in_flight: 65_536,
            observation_window: OBSERVATION_WINDOW.as_millis() as u64,
            progress_interval: 256,
            source_port_base: DEFAULT_SOURCE_PORT_BASE,
            source_port_span: DEFAULT_SOURCE_PORT_SPAN,
            source_ipv4: None,
            source_ipv6: None,
            receive_poll: 50,
            cancel_grace: 250,
            worker_threads: None,
        }
    }
}

impl ScanConfig {
    /// Set the rate limit
    pub fn with_rate_limit(mut self, rate_limit: u64) -> Self {
        self.rate_limit = rate_limit;
        self
    }

    /// Set the sliding window size
    pub fn with_max_in_flight(mut self, max_in_flight: usize) -> Self {
        self.max_in_flight = max_in_flight;
        self
    }

    /// Set the observation window in milliseconds
    pub fn with_observation_window(mut self, millis: u64) -> Self {
        self.observation_window = millis;
        self
    }

    /// Set the progress reporting interval
    pub fn with_progress_interval(mut self, interval: u64) -> Self {
        self.progress_interval = interval;
        self
    }

    pub fn with_source_ipv4(mut self, addr: Ipv4Addr) -> Self {
        self.source_ipv4 = Some(addr);
        self
    }

    pub fn with_source_ipv6(mut self, addr: Ipv6Addr) -> Self {
        self.source_ipv6 = Some(addr);
        self
    }

    /// Set the post-cancel grace period in milliseconds (0 abandons at once)
    pub fn with_cancel_grace(mut self, millis: u64) -> Self {
        self.cancel_grace = millis;
        self
    }

    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Get the observation window as Duration
    pub fn observation_window_duration(&self) -> Duration {
        Duration::from_millis(self.observation_window)
    }

    /// Grace period after a cancel, never longer than the observation window
    pub fn cancel_grace_duration(&self) -> Duration {
        Duration::from_millis(self.cancel_grace.min(self.observation_window))
    }

    /// Get the receive poll interval as Duration
    pub fn receive_poll_duration(&self) -> Duration {
        Duration::from_millis(self.receive_poll)
    }

    /// Worker thread count for the scanner runtime
    pub fn runtime_threads(&self) -> usize {
        self.worker_threads
            .unwrap_or_else(|| num_cpus::get().clamp(2, 4))
    }

    /// Load configuration from TOML file
    pub fn from_toml_file<P: AsRef<Path>>(path: P) -> crate::Result<Self> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            crate::ScanError::ConfigError(format!(
                "Failed to read config file {}: {}",
                path.as_ref().display(),
                e
            ))
        })?;

        let config: ScanConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from default locations
    pub fn load_default_config() -> Self {
        // Try to load from ~/.synsweep.toml
        let home_dir = dirs::home_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let config_path = home_dir.join(".synsweep.toml");

        if config_path.exists() {
            match Self::from_toml_file(&config_path) {
                Ok(config) => {
                    log::info!("Loaded config from {}", config_path.display());
                    return config;
                }
                Err(e) => log::warn!("Ignoring {}: {}", config_path.display(), e),
            }
        }

        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        if self.rate_limit == 0 {
            return Err(crate::ScanError::ConfigError(
                "Rate limit must be greater than 0".to_string(),
            ));
        }

        if self.max_in_flight == 0 {
            return Err(crate::ScanError::ConfigError(
                "In-flight window must hold at least one probe".to_string(),
            ));
        }

        if self.observation_window == 0 {
            return Err(crate::ScanError::ConfigError(
                "Observation window must be greater than 0".to_string(),
            ));
        }

        if self.progress_interval == 0 {
            return Err(crate::ScanError::ConfigError(
                "Progress interval must be greater than 0".to_string(),
            ));
        }

        if self.source_port_span == 0
            || self.source_port_base.checked_add(self.source_port_span - 1).is_none()
        {
            return Err(crate::ScanError::ConfigError(format!(
                "Source port range {}+{} does not fit in 1..=65535",
                self.source_port_base, self.source_port_span
            )));
        }

        if self.source_port_base == 0 {
            return Err(crate::ScanError::ConfigError(
                "Source port base must be greater than 0".to_string(),
            ));
        }

        if self.receive_poll == 0 {
            return Err(crate::ScanError::ConfigError(
                "Receive poll interval must be greater than 0".to_string(),
            ));
        }

        if self.worker_threads == Some(0) {
            return Err(crate::ScanError::ConfigError(
                "Worker thread count must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}
