//! Matching inbound TCP segments to the probes that caused them
//!
//! Each probe carries a token derived from a keyed hash of the target
//! address, the scanned port and a per-session nonce. The token becomes the
//! probe's source port and initial sequence number, so a genuine reply can be
//! recognised from its header alone: it comes from the scanned port, goes to
//! the token's source port and acknowledges `sequence + 1`. The in-flight
//! table only adds duplicate suppression and age checks on top of that.

use crate::network::packet::TcpResponse;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::time::{Duration, Instant};

/// Correlation token carried in the probe's TCP header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProbeToken {
    pub source_port: u16,
    pub sequence: u32,
}

/// A SYN that has been (or is about to be) sent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Probe {
    pub target: IpAddr,
    pub port: u16,
    pub token: ProbeToken,
    pub sent_at: Instant,
}

/// Why an inbound segment was not attributed to a probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RejectReason {
    /// Token mismatch: traffic that is not a reply to one of our probes
    Unrelated,
    /// Token matches but the probe is no longer in flight (duplicate reply)
    Unknown,
    /// Reply arrived after the observation window
    Stale,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Correlation {
    /// SYN-ACK: the port is open
    Open(Probe),
    /// RST: the host answered but the port is closed
    Closed(Probe),
    Rejected(RejectReason),
}

pub struct ProbeCorrelator {
    port: u16,
    nonce: u64,
    window: Duration,
    source_port_base: u16,
    source_port_span: u32,
    in_flight: HashMap<IpAddr, Probe>,
}

impl ProbeCorrelator {
    pub fn new(port: u16, nonce: u64, window: Duration, source_ports: RangeInclusive<u16>) -> Self {
        let (start, end) = (*source_ports.start(), *source_ports.end());
        let (base, span) = if end >= start {
            (start, (end - start) as u32 + 1)
        } else {
            (start, 1)
        };

        Self {
            port,
            nonce,
            window,
            source_port_base: base,
            source_port_span: span,
            in_flight: HashMap::new(),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Deterministic token for a target
    pub fn token(&self, addr: &IpAddr) -> ProbeToken {
        let mut hasher = DefaultHasher::new();
        self.nonce.hash(&mut hasher);
        addr.hash(&mut hasher);
        self.port.hash(&mut hasher);
        let h = hasher.finish();

        let offset = ((h >> 32) % self.source_port_span as u64) as u16;
        ProbeToken {
            source_port: self.source_port_base.wrapping_add(offset),
            sequence: h as u32,
        }
    }

    /// Record a probe as in flight, replacing any earlier probe to the same target
    pub fn register(&mut self, addr: IpAddr, now: Instant) -> Probe {
        let probe = Probe {
            target: addr,
            port: self.port,
            token: self.token(&addr),
            sent_at: now,
        };
        self.in_flight.insert(addr, probe);
        probe
    }

    /// Attribute an inbound segment to a probe
    ///
    /// A match removes the probe, so a repeated reply resolves to
    /// `Rejected(Unknown)`.
    pub fn resolve(&mut self, response: &TcpResponse, now: Instant) -> Correlation {
        if response.source_port != self.port {
            return Correlation::Rejected(RejectReason::Unrelated);
        }

        let token = self.token(&response.source_ip);
        if response.dest_port != token.source_port {
            return Correlation::Rejected(RejectReason::Unrelated);
        }

        let acknowledges_probe = response.ack_num == token.sequence.wrapping_add(1);
        let open = if response.is_syn_ack() {
            if !acknowledges_probe {
                return Correlation::Rejected(RejectReason::Unrelated);
            }
            true
        } else if response.is_rst() {
            // A bare RST carries no acknowledgement to check
            if response.is_ack() && !acknowledges_probe {
                return Correlation::Rejected(RejectReason::Unrelated);
            }
            false
        } else {
            return Correlation::Rejected(RejectReason::Unrelated);
        };

        let probe = match self.in_flight.remove(&response.source_ip) {
            Some(probe) => probe,
            None => return Correlation::Rejected(RejectReason::Unknown),
        };

        if now.saturating_duration_since(probe.sent_at) > self.window {
            return Correlation::Rejected(RejectReason::Stale);
        }

        if open {
            Correlation::Open(probe)
        } else {
            Correlation::Closed(probe)
        }
    }

    /// Drop probes older than the observation window, returning how many expired
    pub fn evict_expired(&mut self, now: Instant) -> usize {
        let window = self.window;
        let before = self.in_flight.len();
        self.in_flight
            .retain(|_, probe| now.saturating_duration_since(probe.sent_at) <= window);
        before - self.in_flight.len()
    }

    /// Remove a probe without resolving it (e.g. after a failed send)
    pub fn forget(&mut self, addr: &IpAddr) -> Option<Probe> {
        self.in_flight.remove(addr)
    }

    /// Abandon every outstanding probe, returning how many there were
    pub fn clear(&mut self) -> usize {
        let count = self.in_flight.len();
        self.in_flight.clear();
        count
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }
}
