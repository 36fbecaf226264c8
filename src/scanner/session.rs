//! One run of a SYN sweep over an address space
//!
//! A session moves `Idle -> Running` when started and ends either in
//! `Completed` (every address sent and every probe resolved or expired) or,
//! through `Cancelling`, in `Cancelled`. The state lives in an atomic and
//! every transition is a compare-and-swap, so a cancel racing the natural
//! end of the scan is decided by whichever transition lands first.
//!
//! Two activities run per session: the send loop (an async task that paces
//! probes and reports progress) and the receive loop (a blocking thread that
//! feeds inbound segments through the correlator). The terminal callback is
//! issued only after both have stopped and the transport is closed.

use crate::config::ScanConfig;
use crate::network::packet::TcpResponse;
use crate::network::protocol::RateLimiter;
use crate::network::transport::{receive_loop, PacketTransport};
use crate::scanner::{
    Correlation, ProbeCorrelator, RejectReason, ResultCallback, ScanCallbacks, ScanProgress,
    ScanResult, ScanState, ScanStats,
};
use crate::utils::address_parser::AddressSpace;
use crate::ScanError;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Upper bound on how long the send loop sleeps while the window is full
const WINDOW_POLL: Duration = Duration::from_millis(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    Running = 1,
    Cancelling = 2,
    Cancelled = 3,
    Completed = 4,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::Running,
            2 => SessionState::Cancelling,
            3 => SessionState::Cancelled,
            _ => SessionState::Completed,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Cancelled | SessionState::Completed)
    }
}

#[derive(Default)]
struct Counters {
    packets_sent: AtomicU64,
    send_failures: AtomicU64,
    packets_received: AtomicU64,
    open: AtomicU64,
    closed: AtomicU64,
    unrelated: AtomicU64,
    duplicates: AtomicU64,
    stale: AtomicU64,
    expired: AtomicU64,
    abandoned: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    fn snapshot(&self, elapsed: Duration) -> ScanStats {
        ScanStats {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            open: self.open.load(Ordering::Relaxed),
            closed: self.closed.load(Ordering::Relaxed),
            unrelated: self.unrelated.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            abandoned: self.abandoned.load(Ordering::Relaxed),
            elapsed,
        }
    }
}

/// State shared between the session task and its handle
struct Shared {
    state: AtomicU8,
    cancel: CancellationToken,
    /// Set once the terminal callback has returned
    finished: Mutex<bool>,
    finished_cv: Condvar,
    started: Mutex<Option<Instant>>,
    final_stats: Mutex<Option<ScanStats>>,
    counters: Counters,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SessionState::Idle as u8),
            cancel: CancellationToken::new(),
            finished: Mutex::new(false),
            finished_cv: Condvar::new(),
            started: Mutex::new(None),
            final_stats: Mutex::new(None),
            counters: Counters::default(),
        }
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn request_cancel(&self) -> crate::Result<()> {
        if self.transition(SessionState::Running, SessionState::Cancelling) {
            log::info!("Cancelling scan");
            self.cancel.cancel();
            return Ok(());
        }

        match self.state() {
            SessionState::Cancelling => Ok(()),
            _ => Err(ScanError::NotRunning),
        }
    }

    fn is_finished(&self) -> bool {
        *lock(&self.finished)
    }

    fn mark_finished(&self) {
        *lock(&self.finished) = true;
        self.finished_cv.notify_all();
    }

    fn elapsed(&self) -> Duration {
        let started = *lock(&self.started);
        started.map(|s| s.elapsed()).unwrap_or_default()
    }

    fn stats(&self) -> ScanStats {
        match lock(&self.final_stats).clone() {
            Some(stats) => stats,
            None => self.counters.snapshot(self.elapsed()),
        }
    }
}

/// Marks the session finished even if the task unwinds or is never polled
struct FinishGuard(Arc<Shared>);

impl Drop for FinishGuard {
    fn drop(&mut self) {
        self.0.mark_finished();
    }
}

/// Lets any thread block until a session's terminal callback has returned
#[derive(Clone)]
pub struct Completion(Arc<Shared>);

impl Completion {
    pub fn wait(&self) {
        let mut finished = lock(&self.0.finished);
        while !*finished {
            finished = self
                .0
                .finished_cv
                .wait(finished)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    /// False if the session was still running when `timeout` elapsed
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let finished = lock(&self.0.finished);
        let (finished, _) = self
            .0
            .finished_cv
            .wait_timeout_while(finished, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        *finished
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A scan of one port over one address space
pub struct ScanSession {
    space: Arc<AddressSpace>,
    port: u16,
    config: ScanConfig,
    transport: Arc<dyn PacketTransport>,
    callbacks: ScanCallbacks,
    shared: Arc<Shared>,
}

impl ScanSession {
    pub fn new(
        space: Arc<AddressSpace>,
        port: u16,
        config: ScanConfig,
        transport: Arc<dyn PacketTransport>,
        callbacks: ScanCallbacks,
    ) -> Self {
        Self {
            space,
            port,
            config,
            transport,
            callbacks,
            shared: Arc::new(Shared::new()),
        }
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Move to `Running` and spawn the session onto `runtime`
    pub fn start(self, runtime: &tokio::runtime::Handle) -> crate::Result<SessionHandle> {
        if !self
            .shared
            .transition(SessionState::Idle, SessionState::Running)
        {
            return Err(ScanError::AlreadyRunning);
        }

        *lock(&self.shared.started) = Some(Instant::now());
        log::info!(
            "Starting SYN scan of port {} over {} addresses",
            self.port,
            self.space.len()
        );

        let shared = self.shared.clone();
        let finished = FinishGuard(self.shared.clone());
        let join = runtime.spawn(async move {
            let _finished = finished;
            self.run().await
        });

        Ok(SessionHandle {
            shared,
            join: Some(join),
        })
    }

    async fn run(self) {
        let source_ports = self.config.source_port_base
            ..=self
                .config
                .source_port_base
                .saturating_add(self.config.source_port_span.saturating_sub(1));
        let correlator = Arc::new(Mutex::new(ProbeCorrelator::new(
            self.port,
            rand::random(),
            self.config.observation_window_duration(),
            source_ports,
        )));

        let stop = CancellationToken::new();
        // Stops the receiver if this task unwinds before reaching the end
        let stop_guard = stop.clone().drop_guard();

        let receiver = {
            let transport = self.transport.clone();
            let correlator = correlator.clone();
            let shared = self.shared.clone();
            let on_result = self.callbacks.on_result.clone();
            let poll = self.config.receive_poll_duration();
            tokio::task::spawn_blocking(move || {
                receive_loop(transport, stop, poll, |response| {
                    dispatch(&response, &correlator, &shared.counters, &on_result)
                })
            })
        };

        let dispatched = self.send_all(&correlator).await;
        log::debug!("Dispatched {} of {} probes", dispatched, self.space.len());
        self.drain(&correlator).await;
        if self.shared.cancel.is_cancelled() {
            self.settle(&correlator).await;
        }

        drop(stop_guard);
        match receiver.await {
            Ok(received) => log::debug!("Receive loop handled {} segments", received),
            Err(e) => log::warn!("Receive loop ended abnormally: {}", e),
        }
        self.transport.close();

        let abandoned = lock(&correlator).clear() as u64;
        Counters::bump(&self.shared.counters.abandoned, abandoned);

        let outcome = if self
            .shared
            .transition(SessionState::Running, SessionState::Completed)
        {
            ScanState::Completed
        } else {
            self.shared
                .state
                .store(SessionState::Cancelled as u8, Ordering::Release);
            ScanState::Cancelled
        };

        let stats = self.shared.counters.snapshot(self.shared.elapsed());
        log::info!(
            "Scan of port {} {} in {:.2}s: {} sent, {} open, {} closed, {} expired, {} send failures",
            self.port,
            outcome,
            stats.elapsed.as_secs_f64(),
            stats.packets_sent,
            stats.open,
            stats.closed,
            stats.expired,
            stats.send_failures
        );
        log::debug!(
            "Rejected segments: {} unrelated, {} duplicate, {} stale; {} abandoned probes",
            stats.unrelated,
            stats.duplicates,
            stats.stale,
            stats.abandoned
        );
        *lock(&self.shared.final_stats) = Some(stats);

        (self.callbacks.on_result)(ScanResult::terminal(outcome, self.port));
    }

    /// Send one probe per address until the cursor reaches the end or the
    /// session is cancelled. Returns how many addresses were dispatched.
    async fn send_all(&self, correlator: &Mutex<ProbeCorrelator>) -> u64 {
        let total = self.space.len();
        let interval = self.config.progress_interval.max(1);
        let mut limiter = RateLimiter::new(self.config.rate_limit);
        let counters = &self.shared.counters;
        let mut dispatched = 0u64;

        for addr in self.space.iter() {
            if self.shared.cancel.is_cancelled()
                || !self.wait_for_window(correlator).await
                || !self.pace(&mut limiter).await
            {
                break;
            }

            let probe = lock(correlator).register(addr, Instant::now());
            match self.transport.send_syn(&probe) {
                Ok(()) => Counters::bump(&counters.packets_sent, 1),
                Err(e) => {
                    Counters::bump(&counters.send_failures, 1);
                    lock(correlator).forget(&addr);
                    log::debug!("Probe to {}:{} not sent: {}", addr, self.port, e);
                }
            }

            dispatched += 1;
            if dispatched % interval == 0 || dispatched == total {
                (self.callbacks.on_progress)(ScanProgress {
                    current_count: dispatched,
                    total_count: total,
                    address: Some(addr),
                });
            }
        }

        dispatched
    }

    /// Block while the in-flight window is full. False when cancelled.
    async fn wait_for_window(&self, correlator: &Mutex<ProbeCorrelator>) -> bool {
        loop {
            let in_flight = {
                let mut correlator = lock(correlator);
                if correlator.in_flight() < self.config.max_in_flight {
                    return true;
                }
                let expired = correlator.evict_expired(Instant::now());
                Counters::bump(&self.shared.counters.expired, expired as u64);
                correlator.in_flight()
            };
            if in_flight < self.config.max_in_flight {
                return true;
            }

            tokio::select! {
                _ = self.shared.cancel.cancelled() => return false,
                _ = tokio::time::sleep(WINDOW_POLL) => {}
            }
        }
    }

    /// Wait for a send token. False when cancelled.
    async fn pace(&self, limiter: &mut RateLimiter) -> bool {
        while !limiter.can_send() {
            let delay = limiter.delay_until_next();
            tokio::select! {
                _ = self.shared.cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        true
    }

    /// Drop expired probes and return how many are still in flight
    fn evict(&self, correlator: &Mutex<ProbeCorrelator>) -> usize {
        let mut correlator = lock(correlator);
        let expired = correlator.evict_expired(Instant::now());
        Counters::bump(&self.shared.counters.expired, expired as u64);
        correlator.in_flight()
    }

    fn drain_poll(&self) -> Duration {
        self.config.receive_poll_duration().min(WINDOW_POLL * 2)
    }

    /// Wait until every probe has been answered or has expired
    ///
    /// Cancellation cuts the wait short; see [`ScanSession::settle`].
    async fn drain(&self, correlator: &Mutex<ProbeCorrelator>) {
        let poll = self.drain_poll();

        loop {
            if self.shared.cancel.is_cancelled() || self.evict(correlator) == 0 {
                return;
            }

            tokio::select! {
                _ = self.shared.cancel.cancelled() => return,
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// After a cancel, keep receiving for at most the grace period so
    /// replies already in transit are still reported. Whatever is left
    /// afterwards is abandoned.
    async fn settle(&self, correlator: &Mutex<ProbeCorrelator>) {
        let grace = self.config.cancel_grace_duration();
        let deadline = Instant::now() + grace;
        let poll = self.drain_poll();

        loop {
            let remaining = self.evict(correlator);
            let now = Instant::now();
            if remaining == 0 || now >= deadline {
                return;
            }
            log::trace!("{} probes in flight after cancel", remaining);
            tokio::time::sleep(poll.min(deadline - now)).await;
        }
    }
}

/// Attribute one inbound segment and report it if it opens a probe
fn dispatch(
    response: &TcpResponse,
    correlator: &Mutex<ProbeCorrelator>,
    counters: &Counters,
    on_result: &ResultCallback,
) {
    Counters::bump(&counters.packets_received, 1);

    let correlation = lock(correlator).resolve(response, Instant::now());
    match correlation {
        Correlation::Open(probe) => {
            Counters::bump(&counters.open, 1);
            log::debug!(
                "{}:{} open ({:?})",
                probe.target,
                probe.port,
                probe.sent_at.elapsed()
            );
            on_result(ScanResult::success(probe.port, probe.target));
        }
        Correlation::Closed(probe) => {
            Counters::bump(&counters.closed, 1);
            log::trace!("{}:{} closed", probe.target, probe.port);
        }
        Correlation::Rejected(reason) => {
            let counter = match reason {
                RejectReason::Unrelated => &counters.unrelated,
                RejectReason::Unknown => &counters.duplicates,
                RejectReason::Stale => &counters.stale,
            };
            Counters::bump(counter, 1);
            log::trace!(
                "Ignored segment from {}:{} ({:?})",
                response.source_ip,
                response.source_port,
                reason
            );
        }
    }
}

/// Caller-side handle on a running session
pub struct SessionHandle {
    shared: Arc<Shared>,
    join: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Ask the session to stop. Succeeds again while already cancelling.
    pub fn cancel(&self) -> crate::Result<()> {
        self.shared.request_cancel()
    }

    /// Whether the terminal callback has been delivered and returned
    pub fn is_finished(&self) -> bool {
        self.shared.is_finished()
    }

    /// A waiter that outlives any lock held on this handle
    pub fn completion(&self) -> Completion {
        Completion(self.shared.clone())
    }

    /// Counters so far, or the final figures once the session has ended
    pub fn stats(&self) -> ScanStats {
        self.shared.stats()
    }

    /// Block the calling thread until the session task has exited
    pub fn wait(&mut self) {
        if let Some(join) = self.join.take() {
            if let Err(e) = futures::executor::block_on(join) {
                log::warn!("Scan session ended abnormally: {}", e);
            }
        }
    }
}
