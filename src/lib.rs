//! synsweep - asynchronous, cancellable TCP SYN sweeps
//!
//! Probe one TCP port across large IPv4/IPv6 address lists with half-open
//! connection attempts. Responsive hosts and progress are reported through
//! callbacks while the sweep runs in the background.

pub mod config;
pub mod error;
pub mod ffi;
pub mod network;
pub mod scanner;
pub mod utils;

// Re-export commonly used types
pub use config::{ScanConfig, OBSERVATION_WINDOW};
pub use error::ScanError;
pub use network::{AddressFamily, PacketTransport, TransportFactory};
pub use scanner::{ScanCallbacks, ScanProgress, ScanResult, ScanState, ScanStats, Scanner};
pub use utils::address_parser::{AddressRangeParser, AddressSpace};

pub type Result<T> = std::result::Result<T, ScanError>;
