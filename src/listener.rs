//! Passive acceptor: binds one `(family, ip, port)`, accepts one connection
//! per `process` call, and hands the raw socket back to the reactor as a
//! [`Spawn::Accepted`] request. TLS handshaking belongs to the server engine
//! that wraps the accepted socket, not to the listener.

use crate::error::{Error, Result};
use crate::reactor::{Connection, Outcome, Readiness, Spawn};
use mio::event::Source;
use mio::net::TcpListener as MioTcpListener;
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;
use tracing::{info, warn};

const LISTEN_BACKLOG: i32 = 128;

/// A bound, listening socket registered with the reactor.
pub struct Listener {
    sock: MioTcpListener,
    addr: SocketAddr,
    open: bool,
}

impl Listener {
    /// Bind and listen on `addr`. Translates common bind failures into the
    /// diagnostic hints an operator actually needs.
    pub fn bind(addr: SocketAddr) -> Result<Self> {
        let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
        let socket = Socket::new(domain, Type::STREAM, None).map_err(Error::Io)?;
        socket.set_reuse_address(true).map_err(Error::Io)?;
        socket.set_nonblocking(true).map_err(Error::Io)?;
        socket.bind(&addr.into()).map_err(|e| bind_error(addr, e))?;
        socket.listen(LISTEN_BACKLOG).map_err(Error::Io)?;

        let std_listener: std::net::TcpListener = socket.into();
        let sock = MioTcpListener::from_std(std_listener);
        info!(%addr, "listening for MTP connections");
        Ok(Self { sock, addr, open: true })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stop accepting new connections. Open connections already handed off
    /// are unaffected.
    pub fn shutdown(&mut self) {
        self.open = false;
        info!(addr = %self.addr, "listener closed");
    }
}

fn bind_error(addr: SocketAddr, e: std::io::Error) -> Error {
    let hint = match e.raw_os_error() {
        Some(libc_errno) if is_eaddrnotavail(libc_errno) => {
            " (is that really your IP address?)"
        }
        Some(libc_errno) if is_eacces(libc_errno) => {
            " (only privileged users may bind low ports)"
        }
        _ => "",
    };
    Error::Io(std::io::Error::new(
        e.kind(),
        format!("binding {addr}: {e}{hint}"),
    ))
}

#[cfg(unix)]
fn is_eaddrnotavail(code: i32) -> bool {
    code == libc_errno::EADDRNOTAVAIL
}
#[cfg(unix)]
fn is_eacces(code: i32) -> bool {
    code == libc_errno::EACCES
}
#[cfg(not(unix))]
fn is_eaddrnotavail(_code: i32) -> bool {
    false
}
#[cfg(not(unix))]
fn is_eacces(_code: i32) -> bool {
    false
}

/// Minimal errno constants so this module doesn't need a `libc` dependency
/// just for two integers; values match POSIX on every platform this node
/// targets.
#[cfg(unix)]
mod libc_errno {
    pub const EADDRNOTAVAIL: i32 = 99;
    pub const EACCES: i32 = 13;
}

impl Connection for Listener {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.sock
    }

    fn initial_readiness(&self) -> Readiness {
        Readiness { read: self.open, write: false }
    }

    fn process(&mut self, readable: bool, _writable: bool, _exceptional: bool, _quota: Option<usize>) -> Outcome {
        if !self.open {
            return Outcome::closed();
        }
        if !readable {
            return Outcome {
                readiness: Readiness { read: true, write: false },
                still_open: true,
                bytes_consumed: 0,
                spawn: None,
                throttled: false,
            };
        }

        match self.sock.accept() {
            Ok((stream, addr)) => Outcome {
                readiness: Readiness { read: true, write: false },
                still_open: true,
                bytes_consumed: 0,
                spawn: Some(Spawn::Accepted(stream, addr)),
                throttled: false,
            },
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Outcome {
                readiness: Readiness { read: true, write: false },
                still_open: true,
                bytes_consumed: 0,
                spawn: None,
                throttled: false,
            },
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => Outcome {
                readiness: Readiness { read: true, write: false },
                still_open: true,
                bytes_consumed: 0,
                spawn: None,
                throttled: false,
            },
            Err(e) => {
                warn!(addr = %self.addr, error = %e, "accept failed; listener remains registered");
                Outcome {
                    readiness: Readiness { read: true, write: false },
                    still_open: true,
                    bytes_consumed: 0,
                    spawn: None,
                    throttled: false,
                }
            }
        }
    }

    fn name(&self) -> &str {
        "listener"
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}
