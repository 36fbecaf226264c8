//! Probe transport: one send/receive contract over raw IPv4 and IPv6 sockets

use crate::config::ScanConfig;
use crate::network::packet::{PacketParser, TcpPacketBuilder, TcpResponse};
use crate::network::protocol::NetworkUtils;
use crate::network::socket::RawSocket;
use crate::network::{addr_to_u128, AddressFamily};
use crate::scanner::Probe;
use crate::ScanError;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Large enough for any IPv4 datagram
const RECV_BUFFER_LEN: usize = 65_535;

/// Destination networks remembered before the route cache starts over
const ROUTE_CACHE_LIMIT: usize = 65_536;

/// Send/receive contract the scan session drives
pub trait PacketTransport: Send + Sync {
    /// Craft and emit one SYN for `probe`. Never blocks on the network.
    fn send_syn(&self, probe: &Probe) -> crate::Result<()>;

    /// Wait up to `timeout` for one inbound TCP segment
    ///
    /// Non-TCP and malformed frames are discarded. `Ok(None)` means nothing
    /// usable arrived in time.
    fn recv(&self, timeout: Duration) -> crate::Result<Option<TcpResponse>>;

    /// Release the underlying resources. Safe to call more than once.
    fn close(&self);
}

/// Acquires a transport when a scan starts
pub trait TransportFactory: Send + Sync {
    fn open(&self, families: &[AddressFamily]) -> crate::Result<Arc<dyn PacketTransport>>;
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

type RouteLookup = Box<dyn Fn(IpAddr) -> crate::Result<IpAddr> + Send + Sync>;

/// Picks the source address written into each probe
///
/// `IP_HDRINCL` leaves the IPv4 source to us, so it has to match the
/// interface the kernel routes the probe through or replies never come
/// back. Lookups are made per destination network (/24 for IPv4, /64 for
/// IPv6) and cached, including networks with no route.
pub struct SourceRoutes {
    fixed: Option<IpAddr>,
    lookup: RouteLookup,
    cache: Mutex<HashMap<u128, Option<IpAddr>>>,
}

impl SourceRoutes {
    /// Ask the routing table, unless `fixed` overrides every destination
    pub fn system(fixed: Option<IpAddr>) -> Self {
        Self::with_lookup(fixed, NetworkUtils::source_for)
    }

    pub fn with_lookup<F>(fixed: Option<IpAddr>, lookup: F) -> Self
    where
        F: Fn(IpAddr) -> crate::Result<IpAddr> + Send + Sync + 'static,
    {
        Self {
            fixed,
            lookup: Box::new(lookup),
            cache: Mutex::new(HashMap::new()),
        }
    }

    fn network_of(target: &IpAddr) -> u128 {
        let host_bits = match target {
            IpAddr::V4(_) => 8,
            IpAddr::V6(_) => 64,
        };
        addr_to_u128(target) >> host_bits
    }

    pub fn source_for(&self, target: IpAddr) -> crate::Result<IpAddr> {
        if let Some(fixed) = self.fixed {
            return Ok(fixed);
        }

        let network = Self::network_of(&target);
        let mut cache = lock(&self.cache);
        let source = match cache.get(&network) {
            Some(cached) => *cached,
            None => {
                let resolved = match (self.lookup)(target) {
                    Ok(source) => {
                        log::debug!("Probes towards {} leave from {}", target, source);
                        Some(source)
                    }
                    Err(e) => {
                        log::debug!("No source address towards {}: {}", target, e);
                        None
                    }
                };
                if cache.len() >= ROUTE_CACHE_LIMIT {
                    cache.clear();
                }
                cache.insert(network, resolved);
                resolved
            }
        };

        source.ok_or_else(|| ScanError::NetworkError(format!("No route towards {}", target)))
    }
}

/// Receive side of one address family
trait SegmentSource {
    /// Read one queued segment without blocking
    fn try_recv(&self, buf: &mut [u8]) -> crate::Result<Option<TcpResponse>>;
}

/// Starts every read one past the source that produced the last segment,
/// so a family flooded with host traffic cannot starve the other one
#[derive(Debug, Default)]
struct ReadOrder {
    next: AtomicUsize,
}

impl ReadOrder {
    fn read_next<S: SegmentSource>(
        &self,
        sources: &[&S],
        buf: &mut [u8],
    ) -> crate::Result<Option<TcpResponse>> {
        let count = sources.len();
        if count == 0 {
            return Ok(None);
        }

        let start = self.next.load(Ordering::Relaxed) % count;
        for offset in 0..count {
            let index = (start + offset) % count;
            let result = sources[index].try_recv(buf);
            if !matches!(result, Ok(None)) {
                self.next.store(index + 1, Ordering::Relaxed);
                return result;
            }
        }
        Ok(None)
    }
}

struct FamilySocket {
    socket: RawSocket,
    routes: SourceRoutes,
}

impl SegmentSource for FamilySocket {
    fn try_recv(&self, buf: &mut [u8]) -> crate::Result<Option<TcpResponse>> {
        let (size, from) = match self.socket.recv_from(buf)? {
            Some(received) => received,
            None => return Ok(None),
        };

        let frame = &buf[..size];
        let response = match (self.socket.family(), from) {
            (AddressFamily::V4, _) => PacketParser::parse_ipv4_tcp(frame),
            (AddressFamily::V6, IpAddr::V6(source)) => PacketParser::parse_ipv6_tcp(frame, source),
            (AddressFamily::V6, IpAddr::V4(_)) => None,
        };

        if response.is_none() {
            log::trace!("Discarded {} byte non-TCP frame from {}", size, from);
        }
        Ok(response)
    }
}

/// Raw socket transport for both address families
///
/// Sends and receives share the sockets through read locks; `close` takes
/// the write lock so it waits for in-progress calls to return.
pub struct RawTransport {
    v4: RwLock<Option<FamilySocket>>,
    v6: RwLock<Option<FamilySocket>>,
    order: ReadOrder,
    buffer: Mutex<Vec<u8>>,
    closed: AtomicBool,
}

impl RawTransport {
    fn new(v4: Option<FamilySocket>, v6: Option<FamilySocket>) -> Self {
        Self {
            v4: RwLock::new(v4),
            v6: RwLock::new(v6),
            order: ReadOrder::default(),
            buffer: Mutex::new(vec![0u8; RECV_BUFFER_LEN]),
            closed: AtomicBool::new(false),
        }
    }

    fn slot(&self, family: AddressFamily) -> &RwLock<Option<FamilySocket>> {
        match family {
            AddressFamily::V4 => &self.v4,
            AddressFamily::V6 => &self.v6,
        }
    }

    /// Source address probes to `target` would carry, if its family is open
    /// and a route exists
    pub fn source_for(&self, target: IpAddr) -> Option<IpAddr> {
        let guard = self
            .slot(AddressFamily::of(&target))
            .read()
            .unwrap_or_else(|e| e.into_inner());
        guard.as_ref().and_then(|s| s.routes.source_for(target).ok())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

impl PacketTransport for RawTransport {
    fn send_syn(&self, probe: &Probe) -> crate::Result<()> {
        if self.is_closed() {
            return Err(ScanError::TransportClosed);
        }

        let family = AddressFamily::of(&probe.target);
        let guard = self.slot(family).read().unwrap_or_else(|e| e.into_inner());
        let family_socket = match guard.as_ref() {
            Some(s) => s,
            None if self.is_closed() => return Err(ScanError::TransportClosed),
            None => {
                return Err(ScanError::NetworkError(format!(
                    "No {} socket available for {}",
                    family, probe.target
                )))
            }
        };

        let source = family_socket.routes.source_for(probe.target)?;
        let packet = TcpPacketBuilder::new(
            source,
            probe.target,
            probe.token.source_port,
            probe.port,
        )
        .syn()
        .seq_num(probe.token.sequence)
        .build()?;

        family_socket.socket.send_to(&packet, probe.target)?;
        Ok(())
    }

    fn recv(&self, timeout: Duration) -> crate::Result<Option<TcpResponse>> {
        if self.is_closed() {
            std::thread::sleep(timeout);
            return Ok(None);
        }

        let v4 = self.v4.read().unwrap_or_else(|e| e.into_inner());
        let v6 = self.v6.read().unwrap_or_else(|e| e.into_inner());
        let open: Vec<&FamilySocket> = v4.iter().chain(v6.iter()).collect();
        if open.is_empty() {
            std::thread::sleep(timeout);
            return Ok(None);
        }
        let sockets: Vec<&RawSocket> = open.iter().map(|s| &s.socket).collect();

        let mut buf = lock(&self.buffer);
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(response) = self.order.read_next(&open, &mut buf)? {
                return Ok(Some(response));
            }

            let now = Instant::now();
            if now >= deadline || !RawSocket::wait_readable(&sockets, deadline - now)? {
                return Ok(None);
            }
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for family in [AddressFamily::V4, AddressFamily::V6] {
            let mut guard = self.slot(family).write().unwrap_or_else(|e| e.into_inner());
            if let Some(family_socket) = guard.take() {
                log::debug!("Closing raw {} socket", family);
                drop(family_socket);
            }
        }
    }
}

impl Drop for RawTransport {
    fn drop(&mut self) {
        self.close();
    }
}

/// Opens raw sockets for the families present in the address space
#[derive(Debug, Clone, Default)]
pub struct RawTransportFactory {
    source_ipv4: Option<IpAddr>,
    source_ipv6: Option<IpAddr>,
}

impl RawTransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take source address overrides from the scan configuration
    pub fn from_config(config: &ScanConfig) -> Self {
        Self {
            source_ipv4: config.source_ipv4.map(IpAddr::V4),
            source_ipv6: config.source_ipv6.map(IpAddr::V6),
        }
    }

    /// Only socket creation can fail here; routes are looked up per
    /// destination as probes go out
    fn open_family(&self, family: AddressFamily) -> crate::Result<FamilySocket> {
        let socket = RawSocket::new_tcp(family)?;
        socket.set_nonblocking(true)?;

        let fixed = match family {
            AddressFamily::V4 => self.source_ipv4,
            AddressFamily::V6 => self.source_ipv6,
        };
        match fixed {
            Some(source) => log::debug!("Opened raw {} socket, probes leave from {}", family, source),
            None => log::debug!("Opened raw {} socket, source chosen per route", family),
        }

        Ok(FamilySocket {
            socket,
            routes: SourceRoutes::system(fixed),
        })
    }
}

impl TransportFactory for RawTransportFactory {
    /// Fails only when none of the requested families can be opened
    fn open(&self, families: &[AddressFamily]) -> crate::Result<Arc<dyn PacketTransport>> {
        let mut v4 = None;
        let mut v6 = None;
        let mut first_error = None;

        for &family in families {
            match self.open_family(family) {
                Ok(family_socket) => match family {
                    AddressFamily::V4 => v4 = Some(family_socket),
                    AddressFamily::V6 => v6 = Some(family_socket),
                },
                Err(e) => {
                    log::warn!("Cannot probe {} targets: {}", family, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        if v4.is_none() && v6.is_none() {
            return Err(first_error.unwrap_or_else(|| {
                ScanError::InvalidTarget("No address family to probe".to_string())
            }));
        }

        Ok(Arc::new(RawTransport::new(v4, v6)))
    }
}

/// Drive `transport.recv` until `stop` is cancelled
///
/// Runs on a blocking thread. `handler` sees every parsed TCP segment;
/// receive errors are logged and the loop carries on.
pub fn receive_loop<F>(
    transport: Arc<dyn PacketTransport>,
    stop: CancellationToken,
    poll: Duration,
    mut handler: F,
) -> u64
where
    F: FnMut(TcpResponse),
{
    let mut received = 0u64;

    while !stop.is_cancelled() {
        match transport.recv(poll) {
            Ok(Some(response)) => {
                received += 1;
                handler(response);
            }
            Ok(None) => {}
            Err(ScanError::TransportClosed) => break,
            Err(e) => {
                log::debug!("Receive error: {}", e);
                std::thread::sleep(poll);
            }
        }
    }

    received
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::ProbeToken;
    use std::collections::VecDeque;
    use std::net::Ipv4Addr;

    struct ScriptedTransport {
        inbound: Mutex<VecDeque<TcpResponse>>,
    }

    impl PacketTransport for ScriptedTransport {
        fn send_syn(&self, _probe: &Probe) -> crate::Result<()> {
            Ok(())
        }

        fn recv(&self, timeout: Duration) -> crate::Result<Option<TcpResponse>> {
            let next = self.inbound.lock().unwrap().pop_front();
            if next.is_none() {
                std::thread::sleep(timeout);
            }
            Ok(next)
        }

        fn close(&self) {}
    }

    fn response(port: u16) -> TcpResponse {
        TcpResponse {
            source_ip: "10.0.0.1".parse().unwrap(),
            source_port: port,
            dest_port: 40000,
            flags: 0x12,
            seq_num: 1,
            ack_num: 2,
        }
    }

    #[test]
    fn test_receive_loop_delivers_until_stopped() {
        let transport = Arc::new(ScriptedTransport {
            inbound: Mutex::new(VecDeque::from(vec![response(80), response(443)])),
        });
        let stop = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let stop = stop.clone();
            let seen = seen.clone();
            let transport: Arc<dyn PacketTransport> = transport;
            std::thread::spawn(move || {
                receive_loop(transport, stop, Duration::from_millis(5), |r| {
                    seen.lock().unwrap().push(r.source_port)
                })
            })
        };

        let deadline = Instant::now() + Duration::from_secs(2);
        while seen.lock().unwrap().len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        stop.cancel();

        assert_eq!(handle.join().unwrap(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![80, 443]);
    }

    #[test]
    fn test_closed_raw_transport_rejects_sends() {
        let transport = RawTransport::new(None, None);
        transport.close();
        transport.close();

        let probe = Probe {
            target: "10.0.0.1".parse().unwrap(),
            port: 80,
            token: ProbeToken {
                source_port: 40000,
                sequence: 1,
            },
            sent_at: Instant::now(),
        };
        assert!(matches!(
            transport.send_syn(&probe),
            Err(ScanError::TransportClosed)
        ));
        assert!(transport.recv(Duration::from_millis(1)).unwrap().is_none());
    }

    #[test]
    fn test_factory_with_no_families_fails() {
        let factory = RawTransportFactory::new();
        assert!(factory.open(&[]).is_err());
    }

    /// One family's inbound queue
    struct QueuedSource {
        queue: Mutex<VecDeque<TcpResponse>>,
        failing: bool,
    }

    impl QueuedSource {
        fn with(responses: impl IntoIterator<Item = TcpResponse>) -> Self {
            Self {
                queue: Mutex::new(responses.into_iter().collect()),
                failing: false,
            }
        }

        fn broken() -> Self {
            Self {
                queue: Mutex::new(VecDeque::new()),
                failing: true,
            }
        }
    }

    impl SegmentSource for QueuedSource {
        fn try_recv(&self, _buf: &mut [u8]) -> crate::Result<Option<TcpResponse>> {
            if self.failing {
                return Err(ScanError::NetworkError("socket receive error".to_string()));
            }
            Ok(self.queue.lock().unwrap().pop_front())
        }
    }

    fn reply_from(source: &str, port: u16) -> TcpResponse {
        TcpResponse {
            source_ip: source.parse().unwrap(),
            ..response(port)
        }
    }

    #[test]
    fn test_busy_family_does_not_starve_the_other() {
        let v4 = QueuedSource::with((0..1_000).map(|p| reply_from("10.0.0.1", 10_000 + p)));
        let v6 = QueuedSource::with((0..3).map(|p| reply_from("2001:db8::1", 443 + p)));
        let order = ReadOrder::default();
        let mut buf = [0u8; 64];

        let reads: Vec<TcpResponse> = (0..6)
            .map(|_| order.read_next(&[&v4, &v6], &mut buf).unwrap().unwrap())
            .collect();

        let v6_ports: Vec<u16> = reads
            .iter()
            .filter(|r| r.source_ip.is_ipv6())
            .map(|r| r.source_port)
            .collect();
        assert_eq!(v6_ports, vec![443, 444, 445]);
        assert!(reads.iter().step_by(2).all(|r| r.source_ip.is_ipv4()));

        // Once the quiet family runs dry the busy one is read back to back
        assert!(order.read_next(&[&v4, &v6], &mut buf).unwrap().unwrap().source_ip.is_ipv4());
        assert!(order.read_next(&[&v4, &v6], &mut buf).unwrap().unwrap().source_ip.is_ipv4());
    }

    #[test]
    fn test_failing_family_does_not_block_the_other() {
        let broken = QueuedSource::broken();
        let healthy = QueuedSource::with([reply_from("2001:db8::1", 443)]);
        let order = ReadOrder::default();
        let mut buf = [0u8; 64];

        assert!(order.read_next(&[&broken, &healthy], &mut buf).is_err());
        let next = order.read_next(&[&broken, &healthy], &mut buf).unwrap();
        assert_eq!(next.map(|r| r.source_port), Some(443));
    }

    #[test]
    fn test_empty_sources_read_nothing() {
        let order = ReadOrder::default();
        let idle = QueuedSource::with([]);
        let mut buf = [0u8; 64];
        assert!(order.read_next(&[&idle, &idle], &mut buf).unwrap().is_none());
        assert!(order.read_next::<QueuedSource>(&[], &mut buf).unwrap().is_none());
    }

    #[test]
    fn test_source_routes_cached_per_network() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let routes = {
            let lookups = lookups.clone();
            SourceRoutes::with_lookup(None, move |target| {
                lookups.fetch_add(1, Ordering::SeqCst);
                match target {
                    IpAddr::V4(v4) if v4.octets()[0] == 10 => Ok("192.0.2.1".parse().unwrap()),
                    IpAddr::V4(v4) if v4.octets()[0] == 172 => Ok("198.51.100.1".parse().unwrap()),
                    _ => Err(ScanError::NetworkError("Network is unreachable".to_string())),
                }
            })
        };

        let lan: IpAddr = "192.0.2.1".parse().unwrap();
        let lab: IpAddr = "198.51.100.1".parse().unwrap();
        assert_eq!(routes.source_for("10.0.0.1".parse().unwrap()).unwrap(), lan);
        assert_eq!(routes.source_for("10.0.0.200".parse().unwrap()).unwrap(), lan);
        assert_eq!(lookups.load(Ordering::SeqCst), 1);

        assert_eq!(routes.source_for("172.16.0.9".parse().unwrap()).unwrap(), lab);
        assert_eq!(lookups.load(Ordering::SeqCst), 2);

        // Unroutable networks fail each send without a fresh lookup
        assert!(routes.source_for("203.0.113.5".parse().unwrap()).is_err());
        assert!(routes.source_for("203.0.113.6".parse().unwrap()).is_err());
        assert_eq!(lookups.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_fixed_source_skips_route_lookup() {
        let fixed: IpAddr = "192.0.2.77".parse().unwrap();
        let routes = SourceRoutes::with_lookup(Some(fixed), |_| {
            Err(ScanError::NetworkError("lookup must not run".to_string()))
        });
        assert_eq!(routes.source_for("203.0.113.5".parse().unwrap()).unwrap(), fixed);
    }

    #[test]
    fn test_system_routes_work_without_default_gateway() {
        // Loopback always has a route, unlike any public resolver address
        let routes = SourceRoutes::system(None);
        let source = routes
            .source_for(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 20)))
            .unwrap();
        assert!(source.is_loopback());
    }
}
