//! Caller-facing scanner handle

use crate::config::ScanConfig;
use crate::network::{AddressFamily, RawTransportFactory, TransportFactory};
use crate::scanner::{ScanCallbacks, ScanSession, ScanStats, SessionHandle};
use crate::utils::address_parser::{AddressRangeParser, AddressSpace};
use crate::ScanError;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::runtime::Runtime;

/// Owns an address space and runs at most one scan session over it at a time
///
/// Dropping the scanner (or calling [`Scanner::free`]) cancels any active
/// session and blocks until its terminal callback has returned, so no
/// callback can fire after the scanner is gone.
pub struct Scanner {
    space: Arc<AddressSpace>,
    config: ScanConfig,
    factory: Arc<dyn TransportFactory>,
    runtime: Option<Runtime>,
    session: Mutex<Option<SessionHandle>>,
}

impl Scanner {
    /// Parse `targets` and build a scanner with the default configuration
    pub fn new(targets: &str) -> crate::Result<Self> {
        Self::with_config(targets, ScanConfig::default())
    }

    pub fn with_config(targets: &str, config: ScanConfig) -> crate::Result<Self> {
        config.validate()?;
        let space = AddressRangeParser::new().parse(targets)?;
        Self::from_space(space, config)
    }

    /// Build a scanner over an already parsed address space
    pub fn from_space(space: AddressSpace, config: ScanConfig) -> crate::Result<Self> {
        config.validate()?;
        if space.is_empty() {
            return Err(ScanError::InvalidTarget(
                "Address space holds no addresses".to_string(),
            ));
        }

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(config.runtime_threads())
            .thread_name("synsweep-worker")
            .enable_all()
            .build()?;

        let factory = Arc::new(RawTransportFactory::from_config(&config));

        log::debug!(
            "Scanner ready: {} addresses ({})",
            space.len(),
            space
                .families()
                .iter()
                .map(AddressFamily::name)
                .collect::<Vec<_>>()
                .join(", ")
        );

        Ok(Self {
            space: Arc::new(space),
            config,
            factory,
            runtime: Some(runtime),
            session: Mutex::new(None),
        })
    }

    /// Replace the transport used by future sessions
    pub fn with_transport_factory(mut self, factory: Arc<dyn TransportFactory>) -> Self {
        self.factory = factory;
        self
    }

    fn session(&self) -> MutexGuard<'_, Option<SessionHandle>> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Start probing `port` on every address. Returns as soon as the session
    /// is running; results arrive through `callbacks`.
    pub fn start_scan(&self, port: u16, callbacks: ScanCallbacks) -> crate::Result<()> {
        if port == 0 {
            return Err(ScanError::InvalidPort(0));
        }

        let mut slot = self.session();
        if let Some(active) = slot.as_ref() {
            if !active.is_finished() {
                return Err(ScanError::AlreadyRunning);
            }
        }
        if let Some(mut previous) = slot.take() {
            previous.wait();
        }

        let runtime = self.runtime.as_ref().ok_or(ScanError::NotRunning)?;
        let transport = self.factory.open(&self.space.families())?;

        let session = ScanSession::new(
            self.space.clone(),
            port,
            self.config.clone(),
            transport.clone(),
            callbacks,
        );
        match session.start(runtime.handle()) {
            Ok(handle) => {
                *slot = Some(handle);
                Ok(())
            }
            Err(e) => {
                transport.close();
                Err(e)
            }
        }
    }

    /// Ask the active session to stop; its `Cancelled` event follows later
    pub fn cancel_scan(&self) -> crate::Result<()> {
        match self.session().as_ref() {
            Some(active) => active.cancel(),
            None => Err(ScanError::NotRunning),
        }
    }

    /// Whether a session exists that has not delivered its terminal event
    pub fn is_scanning(&self) -> bool {
        self.session()
            .as_ref()
            .map(|active| !active.is_finished())
            .unwrap_or(false)
    }

    /// Block until the active session (if any) has delivered its terminal
    /// event. The session lock is not held while waiting, so `cancel_scan`
    /// stays usable from other threads.
    pub fn wait(&self) {
        let completion = self.session().as_ref().map(SessionHandle::completion);
        if let Some(completion) = completion {
            completion.wait();
        }
    }

    /// Like [`Scanner::wait`] but gives up after `timeout`. True when no
    /// session is left running.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let completion = self.session().as_ref().map(SessionHandle::completion);
        completion.map_or(true, |completion| completion.wait_timeout(timeout))
    }

    /// Statistics of the current or most recent session
    pub fn stats(&self) -> Option<ScanStats> {
        self.session().as_ref().map(SessionHandle::stats)
    }

    pub fn address_space(&self) -> &AddressSpace {
        &self.space
    }

    pub fn total_count(&self) -> u64 {
        self.space.len()
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Cancel any session and release every resource
    pub fn free(self) {
        drop(self);
    }
}

impl Drop for Scanner {
    fn drop(&mut self) {
        let slot = self.session.get_mut().unwrap_or_else(|e| e.into_inner());
        if let Some(mut active) = slot.take() {
            // NotRunning here only means it already ended
            let _ = active.cancel();
            active.wait();
        }

        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for Scanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scanner")
            .field("addresses", &self.space.len())
            .field("scanning", &self.is_scanning())
            .finish()
    }
}
