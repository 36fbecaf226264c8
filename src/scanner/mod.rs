//! Scanner module containing the SYN sweep engine

pub mod correlator;
pub mod engine;
pub mod session;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

pub use correlator::{Correlation, Probe, ProbeCorrelator, ProbeToken, RejectReason};
pub use engine::Scanner;
pub use session::{Completion, ScanSession, SessionHandle, SessionState};

/// Kind of event carried by a [`ScanResult`]
///
/// The discriminants are part of the C interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(i32)]
pub enum ScanState {
    /// A host answered the probe with SYN-ACK
    Success = 0,
    /// The scan was cancelled; always the last event
    Cancelled = 1,
    /// Every address was probed and resolved; always the last event
    Completed = 2,
}

impl ScanState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ScanState::Success)
    }
}

impl fmt::Display for ScanState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ScanState::Success => "open",
            ScanState::Cancelled => "cancelled",
            ScanState::Completed => "completed",
        };
        f.write_str(name)
    }
}

/// Result event delivered to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanResult {
    pub state: ScanState,
    pub port: u16,
    /// Responding host for `Success`, `None` for terminal events
    pub address: Option<IpAddr>,
}

impl ScanResult {
    pub fn success(port: u16, address: IpAddr) -> Self {
        Self {
            state: ScanState::Success,
            port,
            address: Some(address),
        }
    }

    pub fn terminal(state: ScanState, port: u16) -> Self {
        Self {
            state,
            port,
            address: None,
        }
    }
}

/// Progress through the address space
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanProgress {
    /// Addresses dispatched so far; never decreases
    pub current_count: u64,
    pub total_count: u64,
    /// Most recently dispatched address
    pub address: Option<IpAddr>,
}

impl ScanProgress {
    /// Whether every address has been dispatched
    pub fn is_done(&self) -> bool {
        self.current_count == self.total_count
    }

    pub fn fraction(&self) -> f64 {
        if self.total_count == 0 {
            return 1.0;
        }
        self.current_count as f64 / self.total_count as f64
    }
}

pub type ResultCallback = Arc<dyn Fn(ScanResult) + Send + Sync>;
pub type ProgressCallback = Arc<dyn Fn(ScanProgress) + Send + Sync>;

/// Callbacks a session reports through
///
/// Results and progress are delivered from the scanner's own threads, so
/// the closures must not block for long and must not drop the scanner.
#[derive(Clone)]
pub struct ScanCallbacks {
    pub on_result: ResultCallback,
    pub on_progress: ProgressCallback,
}

impl ScanCallbacks {
    pub fn new<R, P>(on_result: R, on_progress: P) -> Self
    where
        R: Fn(ScanResult) + Send + Sync + 'static,
        P: Fn(ScanProgress) + Send + Sync + 'static,
    {
        Self {
            on_result: Arc::new(on_result),
            on_progress: Arc::new(on_progress),
        }
    }

    /// Results only; progress is discarded
    pub fn results_only<R>(on_result: R) -> Self
    where
        R: Fn(ScanResult) + Send + Sync + 'static,
    {
        Self::new(on_result, |_| {})
    }
}

impl fmt::Debug for ScanCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScanCallbacks").finish_non_exhaustive()
    }
}

/// Scan statistics for one session
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanStats {
    /// SYN probes handed to the transport
    pub packets_sent: u64,

    /// Probes the transport refused to send
    pub send_failures: u64,

    /// Segments delivered by the receive loop
    pub packets_received: u64,

    /// Probes answered with SYN-ACK
    pub open: u64,

    /// Probes answered with RST
    pub closed: u64,

    /// Segments that were not replies to our probes
    pub unrelated: u64,

    /// Duplicate replies to already resolved probes
    pub duplicates: u64,

    /// Replies that arrived after the observation window
    pub stale: u64,

    /// Probes that never got an answer
    pub expired: u64,

    /// Probes still outstanding when the session was cancelled
    pub abandoned: u64,

    /// Wall time from start to the terminal event
    pub elapsed: Duration,
}

impl ScanStats {
    /// Achieved send rate in packets per second
    pub fn send_rate(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.packets_sent as f64 / secs
        } else {
            0.0
        }
    }

    /// Share of sent probes that got any answer, in percent
    pub fn response_rate(&self) -> f64 {
        if self.packets_sent > 0 {
            ((self.open + self.closed) as f64 / self.packets_sent as f64) * 100.0
        } else {
            0.0
        }
    }
}
