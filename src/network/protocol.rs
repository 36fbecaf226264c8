//! Pacing and host-side network utilities

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::{Duration, Instant};

/// Rate limiter for controlling packet sending rate
///
/// Token bucket refilled at `rate` tokens per second. The bucket holds at
/// most `max_tokens`, which bounds the burst after an idle period.
pub struct RateLimiter {
    rate: u64,
    last_refill: Instant,
    tokens: f64,
    max_tokens: f64,
}

impl RateLimiter {
    /// Limiter with a burst of roughly 10ms worth of packets
    pub fn new(packets_per_second: u64) -> Self {
        let burst = std::cmp::max(1, packets_per_second / 100);
        Self::with_burst(packets_per_second, burst)
    }

    pub fn with_burst(packets_per_second: u64, burst: u64) -> Self {
        let max_tokens = std::cmp::max(1, burst) as f64;
        Self {
            rate: packets_per_second,
            last_refill: Instant::now(),
            tokens: max_tokens,
            max_tokens,
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.last_refill = now;

        let tokens_to_add = elapsed * self.rate as f64;
        if tokens_to_add.is_finite() && tokens_to_add >= 0.0 {
            self.tokens = (self.tokens + tokens_to_add).min(self.max_tokens);
        }
    }

    /// Check if we can send a packet (consumes a token on success)
    pub fn can_send(&mut self) -> bool {
        if self.rate == 0 {
            return false;
        }

        self.refill();

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Calculate delay needed before next send
    pub fn delay_until_next(&self) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::from_millis(0);
        }
        if self.rate == 0 {
            return Duration::from_secs(1);
        }

        let needed_tokens = 1.0 - self.tokens;
        let delay_secs = needed_tokens / self.rate as f64;

        if delay_secs.is_finite() && delay_secs >= 0.0 && delay_secs <= 60.0 {
            Duration::from_secs_f64(delay_secs)
        } else {
            Duration::from_secs(1)
        }
    }

    pub fn rate(&self) -> u64 {
        self.rate
    }
}

/// Network utilities
pub struct NetworkUtils;

impl NetworkUtils {
    /// Local address the routing table would use towards `remote`
    ///
    /// Connecting a UDP socket sends nothing; it only resolves the route.
    pub fn source_for(remote: IpAddr) -> crate::Result<IpAddr> {
        let source = Self::route_source(SocketAddr::new(remote, 80))?;
        if source.is_ipv4() != remote.is_ipv4() {
            return Err(crate::ScanError::NetworkError(format!(
                "Route to {} resolved to {} of the other family",
                remote, source
            )));
        }
        Ok(source)
    }

    fn route_source(remote: SocketAddr) -> crate::Result<IpAddr> {
        let bind_addr: SocketAddr = match remote {
            SocketAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            SocketAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };

        let socket = UdpSocket::bind(bind_addr)
            .map_err(|e| crate::ScanError::NetworkError(e.to_string()))?;
        socket
            .connect(remote)
            .map_err(|e| crate::ScanError::NetworkError(format!("No route to {}: {}", remote, e)))?;

        let local_addr = socket
            .local_addr()
            .map_err(|e| crate::ScanError::NetworkError(e.to_string()))?;

        if local_addr.ip().is_unspecified() {
            return Err(crate::ScanError::NetworkError(format!(
                "No usable source address towards {}",
                remote
            )));
        }

        Ok(local_addr.ip())
    }
}
