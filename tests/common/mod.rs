//! Shared helpers for integration tests: an in-memory network that answers
//! probes without raw sockets, and a recorder for scan callbacks.

#![allow(dead_code)]

use pnet::packet::tcp::TcpFlags;
use std::collections::{HashSet, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use synsweep::network::packet::TcpResponse;
use synsweep::scanner::Probe;
use synsweep::{
    AddressFamily, PacketTransport, ScanCallbacks, ScanConfig, ScanError, ScanProgress,
    ScanResult, ScanState, TransportFactory,
};

/// Configuration that keeps scans short
pub fn test_config() -> ScanConfig {
    ScanConfig::default()
        .with_rate_limit(100_000)
        .with_observation_window(200)
        .with_progress_interval(1)
}

pub fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
}

/// Behaviour of the simulated hosts
#[derive(Clone, Default)]
pub struct SimulatedNetwork {
    responders: Arc<HashSet<IpAddr>>,
    reset_closed: bool,
    duplicate_replies: bool,
    noise: bool,
    deny_opens: Arc<AtomicUsize>,
    opened: Arc<AtomicUsize>,
    sent: Arc<Mutex<Vec<Probe>>>,
}

impl SimulatedNetwork {
    /// Hosts in `responders` answer with SYN-ACK, everyone else stays silent
    pub fn new(responders: &[&str]) -> Self {
        Self {
            responders: Arc::new(responders.iter().map(|r| ip(r)).collect()),
            ..Default::default()
        }
    }

    /// Silent hosts answer with RST instead
    pub fn with_resets(mut self) -> Self {
        self.reset_closed = true;
        self
    }

    /// Every reply is delivered twice
    pub fn with_duplicates(mut self) -> Self {
        self.duplicate_replies = true;
        self
    }

    /// Unrelated TCP traffic arrives alongside every probe
    pub fn with_noise(mut self) -> Self {
        self.noise = true;
        self
    }

    /// The next `n` transport opens fail as if privilege were missing
    pub fn deny_next_opens(&self, n: usize) {
        self.deny_opens.store(n, Ordering::SeqCst);
    }

    pub fn factory(&self) -> Arc<dyn TransportFactory> {
        Arc::new(self.clone())
    }

    pub fn sent_probes(&self) -> Vec<Probe> {
        self.sent.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

impl TransportFactory for SimulatedNetwork {
    fn open(&self, _families: &[AddressFamily]) -> synsweep::Result<Arc<dyn PacketTransport>> {
        let denied = self
            .deny_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if denied {
            return Err(ScanError::PermissionError(
                "simulated missing CAP_NET_RAW".to_string(),
            ));
        }

        self.opened.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(SimulatedTransport {
            network: self.clone(),
            inbound: Mutex::new(VecDeque::new()),
            ready: Condvar::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

struct SimulatedTransport {
    network: SimulatedNetwork,
    inbound: Mutex<VecDeque<TcpResponse>>,
    ready: Condvar,
    closed: AtomicBool,
}

impl SimulatedTransport {
    fn reply(probe: &Probe, flags: u8) -> TcpResponse {
        TcpResponse {
            source_ip: probe.target,
            source_port: probe.port,
            dest_port: probe.token.source_port,
            flags,
            seq_num: 0x1000,
            ack_num: probe.token.sequence.wrapping_add(1),
        }
    }
}

impl PacketTransport for SimulatedTransport {
    fn send_syn(&self, probe: &Probe) -> synsweep::Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ScanError::TransportClosed);
        }
        self.network.sent.lock().unwrap().push(*probe);

        let mut inbound = self.inbound.lock().unwrap();
        if self.network.noise {
            let mut stray = Self::reply(probe, TcpFlags::SYN as u8 | TcpFlags::ACK as u8);
            stray.ack_num = stray.ack_num.wrapping_add(1000);
            inbound.push_back(stray);
        }

        let flags = if self.network.responders.contains(&probe.target) {
            Some(TcpFlags::SYN as u8 | TcpFlags::ACK as u8)
        } else if self.network.reset_closed {
            Some(TcpFlags::RST as u8 | TcpFlags::ACK as u8)
        } else {
            None
        };

        if let Some(flags) = flags {
            inbound.push_back(Self::reply(probe, flags));
            if self.network.duplicate_replies {
                inbound.push_back(Self::reply(probe, flags));
            }
        }
        drop(inbound);
        self.ready.notify_all();
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> synsweep::Result<Option<TcpResponse>> {
        let inbound = self.inbound.lock().unwrap();
        let (mut inbound, _) = self
            .ready
            .wait_timeout_while(inbound, timeout, |q| {
                q.is_empty() && !self.closed.load(Ordering::SeqCst)
            })
            .unwrap();
        if self.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        Ok(inbound.pop_front())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.ready.notify_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Result(ScanResult),
    Progress(ScanProgress),
}

/// Records every callback in arrival order
#[derive(Clone, Default)]
pub struct Recorder {
    events: Arc<Mutex<Vec<Event>>>,
    terminal: Arc<(Mutex<Option<ScanState>>, Condvar)>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn callbacks(&self) -> ScanCallbacks {
        let on_result = self.clone();
        let on_progress = self.clone();
        ScanCallbacks::new(
            move |result| {
                on_result.events.lock().unwrap().push(Event::Result(result));
                if result.state.is_terminal() {
                    let (lock, cvar) = &*on_result.terminal;
                    *lock.lock().unwrap() = Some(result.state);
                    cvar.notify_all();
                }
            },
            move |progress| {
                on_progress
                    .events
                    .lock()
                    .unwrap()
                    .push(Event::Progress(progress));
            },
        )
    }

    /// Wait for the terminal event, or give up after `timeout`
    pub fn wait_terminal(&self, timeout: Duration) -> Option<ScanState> {
        let (lock, cvar) = &*self.terminal;
        let deadline = Instant::now() + timeout;
        let mut state = lock.lock().unwrap();
        while state.is_none() {
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = cvar.wait_timeout(state, deadline - now).unwrap().0;
        }
        *state
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn event_count(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn results(&self) -> Vec<ScanResult> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Result(r) => Some(r),
                Event::Progress(_) => None,
            })
            .collect()
    }

    pub fn successes(&self) -> Vec<IpAddr> {
        self.results()
            .into_iter()
            .filter(|r| r.state == ScanState::Success)
            .filter_map(|r| r.address)
            .collect()
    }

    pub fn progress(&self) -> Vec<ScanProgress> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Progress(p) => Some(p),
                Event::Result(_) => None,
            })
            .collect()
    }

    /// Number of progress reports received so far
    pub fn progress_count(&self) -> usize {
        self.progress().len()
    }
}
