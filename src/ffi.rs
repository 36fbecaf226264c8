//! C interface
//!
//! A scanner is handed out as an opaque pointer. Every entry point reports
//! failure through a null pointer or `false` and never unwinds into the
//! caller. Callbacks run on the scanner's own threads; the terminal event
//! (`Cancelled` or `Completed`) is always the last call for a scan, and
//! `synsweep_free_scanner` returns only after it has finished.

use crate::config::ScanConfig;
use crate::scanner::{ScanCallbacks, ScanProgress, ScanResult, ScanState, Scanner};
use std::ffi::{c_char, c_void, CStr};
use std::net::IpAddr;
use std::panic::{self, AssertUnwindSafe};
use std::ptr;

/// Result record passed to the result callback
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynScanResult {
    pub state: ScanState,
    pub port: i32,
    /// 4 for IPv4, 16 for IPv6, 0 for terminal events
    pub ip_length: i32,
    pub ip_address: [u8; 16],
}

/// Progress record passed to the progress callback
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SynScanProgress {
    pub current_count: u64,
    pub total_count: u64,
    pub ip_length: i32,
    pub ip_address: [u8; 16],
}

pub type SynScanResultCallback = Option<unsafe extern "C" fn(SynScanResult, *mut c_void)>;
pub type SynScanProgressCallback = Option<unsafe extern "C" fn(SynScanProgress, *mut c_void)>;

/// Address as (length, zero-padded bytes)
fn encode_address(addr: Option<IpAddr>) -> (i32, [u8; 16]) {
    let mut bytes = [0u8; 16];
    match addr {
        Some(IpAddr::V4(v4)) => {
            bytes[..4].copy_from_slice(&v4.octets());
            (4, bytes)
        }
        Some(IpAddr::V6(v6)) => {
            bytes.copy_from_slice(&v6.octets());
            (16, bytes)
        }
        None => (0, bytes),
    }
}

impl From<ScanResult> for SynScanResult {
    fn from(result: ScanResult) -> Self {
        let (ip_length, ip_address) = encode_address(result.address);
        Self {
            state: result.state,
            port: i32::from(result.port),
            ip_length,
            ip_address,
        }
    }
}

impl From<ScanProgress> for SynScanProgress {
    fn from(progress: ScanProgress) -> Self {
        let (ip_length, ip_address) = encode_address(progress.address);
        Self {
            current_count: progress.current_count,
            total_count: progress.total_count,
            ip_length,
            ip_address,
        }
    }
}

/// Caller context pointer, passed back verbatim
#[derive(Clone, Copy)]
struct UserParam(*mut c_void);

// The pointer is never dereferenced on our side; the caller owns its
// thread-safety.
unsafe impl Send for UserParam {}
unsafe impl Sync for UserParam {}

impl UserParam {
    fn get(self) -> *mut c_void {
        self.0
    }
}

fn callbacks_for(
    on_result: SynScanResultCallback,
    on_progress: SynScanProgressCallback,
    user_param: UserParam,
) -> ScanCallbacks {
    ScanCallbacks::new(
        move |result| {
            if let Some(callback) = on_result {
                // SAFETY: the caller promised a valid function for the scan's lifetime
                unsafe { callback(result.into(), user_param.get()) }
            }
        },
        move |progress| {
            if let Some(callback) = on_progress {
                // SAFETY: as above
                unsafe { callback(progress.into(), user_param.get()) }
            }
        },
    )
}

/// Create a scanner from newline-separated target records
///
/// Returns null on null or non-UTF-8 input, or when no address can be parsed.
/// Privilege is not needed here; raw sockets are opened by
/// `synsweep_start_scan`.
///
/// # Safety
///
/// `content` must be null or point to a NUL-terminated string.
#[no_mangle]
pub unsafe extern "C" fn synsweep_create_scanner(content: *const c_char) -> *mut Scanner {
    if content.is_null() {
        return ptr::null_mut();
    }

    let text = match CStr::from_ptr(content).to_str() {
        Ok(text) => text,
        Err(e) => {
            log::warn!("Target list is not valid UTF-8: {}", e);
            return ptr::null_mut();
        }
    };

    let created = panic::catch_unwind(AssertUnwindSafe(|| {
        Scanner::with_config(text, ScanConfig::load_default_config())
    }));

    match created {
        Ok(Ok(scanner)) => Box::into_raw(Box::new(scanner)),
        Ok(Err(e)) => {
            log::warn!("Cannot create scanner: {}", e);
            ptr::null_mut()
        }
        Err(_) => ptr::null_mut(),
    }
}

/// Start a scan of `port` over the scanner's addresses
///
/// Returns false for an invalid handle or port, when a scan is already
/// running, or when raw sockets cannot be opened. A failed start leaves the
/// scanner usable.
///
/// # Safety
///
/// `scanner` must be null or a live pointer from `synsweep_create_scanner`.
/// The callbacks and `user_param` must stay valid until the terminal event
/// has been delivered.
#[no_mangle]
pub unsafe extern "C" fn synsweep_start_scan(
    scanner: *mut Scanner,
    port: i32,
    result_callback: SynScanResultCallback,
    progress_callback: SynScanProgressCallback,
    user_param: *mut c_void,
) -> bool {
    let scanner = match scanner.as_ref() {
        Some(scanner) => scanner,
        None => return false,
    };

    let port = match u16::try_from(port) {
        Ok(port) if port != 0 => port,
        _ => {
            log::warn!("Refusing to scan invalid port {}", port);
            return false;
        }
    };

    let callbacks = callbacks_for(result_callback, progress_callback, UserParam(user_param));
    match panic::catch_unwind(AssertUnwindSafe(|| scanner.start_scan(port, callbacks))) {
        Ok(Ok(())) => true,
        Ok(Err(e)) => {
            log::warn!("Cannot start scan: {}", e);
            false
        }
        Err(_) => false,
    }
}

/// Request cancellation of the running scan
///
/// Returns false when no scan is running. The `Cancelled` event follows
/// asynchronously.
///
/// # Safety
///
/// `scanner` must be null or a live pointer from `synsweep_create_scanner`.
#[no_mangle]
pub unsafe extern "C" fn synsweep_cancel_scan(scanner: *mut Scanner) -> bool {
    match scanner.as_ref() {
        Some(scanner) => panic::catch_unwind(AssertUnwindSafe(|| scanner.cancel_scan().is_ok()))
            .unwrap_or(false),
        None => false,
    }
}

/// Release a scanner, cancelling and draining any running scan first
///
/// # Safety
///
/// `scanner` must be null or a live pointer from `synsweep_create_scanner`
/// that has not been freed. Must not be called from inside a callback.
#[no_mangle]
pub unsafe extern "C" fn synsweep_free_scanner(scanner: *mut Scanner) {
    if scanner.is_null() {
        return;
    }
    let scanner = Box::from_raw(scanner);
    let _ = panic::catch_unwind(AssertUnwindSafe(move || scanner.free()));
}
