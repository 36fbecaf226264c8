//! Raw socket management and operations

use crate::ScanError;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::mem::MaybeUninit;
use std::net::{IpAddr, SocketAddr};
use std::os::unix::io::AsRawFd;
use std::time::Duration;

use super::AddressFamily;

/// Raw socket wrapper for sending crafted SYN probes and reading replies
pub struct RawSocket {
    socket: Socket,
    family: AddressFamily,
}

impl RawSocket {
    /// Create a raw IPv4 TCP socket with IP_HDRINCL set
    ///
    /// Probes are written as full IP + TCP frames; reads return the IPv4
    /// header followed by the TCP segment.
    pub fn new_tcp_v4() -> crate::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::from(libc::SOCK_RAW), Some(Protocol::TCP))
            .map_err(|e| ScanError::from_socket_error(e, "raw IPv4 TCP socket"))?;

        socket
            .set_header_included_v4(true)
            .map_err(|e| ScanError::from_socket_error(e, "IP_HDRINCL on raw IPv4 socket"))?;

        Ok(Self {
            socket,
            family: AddressFamily::V4,
        })
    }

    /// Create a raw IPv6 TCP socket
    ///
    /// The kernel builds the IPv6 header. Writes carry the TCP segment only,
    /// reads return the TCP segment without the IPv6 header.
    pub fn new_tcp_v6() -> crate::Result<Self> {
        let socket = Socket::new(Domain::IPV6, Type::from(libc::SOCK_RAW), Some(Protocol::TCP))
            .map_err(|e| ScanError::from_socket_error(e, "raw IPv6 TCP socket"))?;

        Ok(Self {
            socket,
            family: AddressFamily::V6,
        })
    }

    /// Open the socket matching an address family
    pub fn new_tcp(family: AddressFamily) -> crate::Result<Self> {
        match family {
            AddressFamily::V4 => Self::new_tcp_v4(),
            AddressFamily::V6 => Self::new_tcp_v6(),
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    /// Send a raw packet to the specified destination
    ///
    /// Raw sockets ignore the port, so the destination carries port 0.
    pub fn send_to(&self, packet: &[u8], dest: IpAddr) -> crate::Result<usize> {
        if AddressFamily::of(&dest) != self.family {
            return Err(ScanError::InvalidTarget(format!(
                "{} destination {} on an {} socket",
                AddressFamily::of(&dest),
                dest,
                self.family
            )));
        }

        let addr = SockAddr::from(SocketAddr::new(dest, 0));
        let bytes_sent = self
            .socket
            .send_to(packet, &addr)
            .map_err(|e| ScanError::NetworkError(format!("Send to {} failed: {}", dest, e)))?;
        Ok(bytes_sent)
    }

    /// Receive a packet from the socket
    ///
    /// Returns `Ok(None)` when nothing is queued (non-blocking mode) or the
    /// read timeout elapses.
    pub fn recv_from(&self, buf: &mut [u8]) -> crate::Result<Option<(usize, IpAddr)>> {
        // SAFETY: initialised bytes are valid `MaybeUninit<u8>`, and the
        // socket only ever writes initialised bytes into the slice
        let uninit_buf =
            unsafe { &mut *(buf as *mut [u8] as *mut [MaybeUninit<u8>]) };
        let capacity = uninit_buf.len();

        match self.socket.recv_from(uninit_buf) {
            Ok((size, addr)) => {
                let socket_addr = match addr.as_socket() {
                    Some(addr) => addr,
                    None => {
                        return Err(ScanError::NetworkError(
                            "Invalid socket address received".to_string(),
                        ))
                    }
                };

                if size > capacity {
                    return Err(ScanError::NetworkError(
                        "Received size exceeds buffer length".to_string(),
                    ));
                }

                Ok(Some((size, socket_addr.ip())))
            }
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut
                    || e.kind() == io::ErrorKind::Interrupted =>
            {
                Ok(None)
            }
            Err(e) => Err(ScanError::NetworkError(format!("Socket receive error: {}", e))),
        }
    }

    /// Switch between blocking reads and immediate `Ok(None)` when idle
    pub fn set_nonblocking(&self, nonblocking: bool) -> crate::Result<()> {
        self.socket
            .set_nonblocking(nonblocking)
            .map_err(|e| ScanError::NetworkError(e.to_string()))
    }

    /// Wait until at least one of `sockets` has a packet queued
    ///
    /// Returns `Ok(false)` when `timeout` elapses first. An interrupted wait
    /// reports `Ok(true)` so the caller simply reads again.
    pub fn wait_readable(sockets: &[&RawSocket], timeout: Duration) -> crate::Result<bool> {
        if sockets.is_empty() {
            std::thread::sleep(timeout);
            return Ok(false);
        }

        let mut fds: Vec<libc::pollfd> = sockets
            .iter()
            .map(|socket| libc::pollfd {
                fd: socket.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        let millis = ((timeout.as_micros() + 999) / 1_000).min(i32::MAX as u128) as libc::c_int;

        // SAFETY: `fds` is a live, correctly sized array of pollfd
        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, millis) };
        if ready < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(true);
            }
            return Err(ScanError::NetworkError(format!("poll failed: {}", err)));
        }
        Ok(ready > 0)
    }

    /// Get the raw file descriptor (Unix only)
    pub fn as_raw_fd(&self) -> i32 {
        self.socket.as_raw_fd()
    }
}

impl std::fmt::Debug for RawSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawSocket")
            .field("family", &self.family)
            .field("fd", &self.as_raw_fd())
            .finish()
    }
}
