//! Server-side MTP connection: wraps the TLS session handed to it by the
//! listener's accept and runs the greeting/exchange state machine.
//!
//! ```text
//! ACCEPTING  --(tls handshake complete)-->  AWAIT_GREETING
//! AWAIT_GREETING --(line matches, version intersects)--> GREETING_SENT
//! AWAIT_GREETING --(malformed or no intersection)--> CLOSING
//! GREETING_SENT  --(write flushed)--> EXCHANGE
//! EXCHANGE       --(frame received, digest valid)--> EXCHANGE
//! EXCHANGE       --(digest invalid or bad control tag)--> CLOSING
//! CLOSING        --(TLS close completes)--> CLOSED
//! ```
//!
//! The handshake and the single-byte `GREETING_SENT` wait are folded into
//! `AwaitGreeting`/`Exchange` here: rustls drives the handshake internally
//! on every `read_tls`/`write_tls` call, and the greeting reply is just the
//! first thing queued into `outbuf` once `Exchange` begins, flushed by the
//! same write path as every ack after it.

use crate::error::{Error, Result};
use crate::frame::{self, AckTag, ControlTag, MAX_GREETING_LEN, MESSAGE_LEN};
use crate::reactor::{Connection, Outcome, Readiness};
use mio::event::Source;
use mio::net::TcpStream;
use rustls::ServerConnection;
use std::io::{Read, Write};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

/// Where accepted packets and rejections go. An external collaborator above
/// the transport layer: the engine only guarantees it calls exactly one of
/// these per inbound frame, before the ack for that frame is queued.
pub trait PacketSink: Send + Sync {
    fn deliver(&self, body: &[u8]);
    fn junk_received(&self);
    fn rejected(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitGreeting,
    Exchange,
    Closing,
}

/// One inbound MTP connection: TLS session plus the greeting/exchange state
/// machine layered on top of it.
pub struct ServerEngine {
    stream: TcpStream,
    tls: ServerConnection,
    state: State,
    peer_addr: SocketAddr,
    inbuf: Vec<u8>,
    outbuf: Vec<u8>,
    sink: Arc<dyn PacketSink>,
    reject_packets: bool,
    last_activity: Instant,
    eof: bool,
    name: String,
}

impl ServerEngine {
    pub fn new(
        stream: TcpStream,
        peer_addr: SocketAddr,
        tls_config: Arc<rustls::ServerConfig>,
        sink: Arc<dyn PacketSink>,
        reject_packets: bool,
    ) -> Result<Self> {
        let tls = ServerConnection::new(tls_config)?;
        Ok(Self {
            stream,
            tls,
            state: State::AwaitGreeting,
            peer_addr,
            inbuf: Vec::new(),
            outbuf: Vec::new(),
            sink,
            reject_packets,
            last_activity: Instant::now(),
            eof: false,
            name: format!("server({peer_addr})"),
        })
    }

    fn do_read(&mut self, quota: Option<usize>) -> Result<usize> {
        // A zero share is a legitimate outcome of dividing the bandwidth
        // bucket across more ready connections than it has bytes for, not
        // EOF; `take(0)` would return `Ok(0)` from `read_tls` and the two
        // are indistinguishable once inside that call, so bail out before
        // making it and let the caller mark this connection throttled.
        if quota == Some(0) {
            return Ok(0);
        }
        let read_result = match quota {
            Some(q) => self.tls.read_tls(&mut (&mut self.stream).take(q as u64)),
            None => self.tls.read_tls(&mut self.stream),
        };
        let n = match read_result {
            Ok(0) => {
                self.eof = true;
                0
            }
            Ok(n) => n,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => 0,
            Err(e) => return Err(Error::Io(e)),
        };

        if let Err(e) = self.tls.process_new_packets() {
            return Err(Error::protocol(format!("TLS record error: {e}")));
        }

        let mut buf = [0u8; 16384];
        loop {
            match self.tls.reader().read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.inbuf.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(n)
    }

    fn do_write(&mut self) -> Result<usize> {
        if !self.outbuf.is_empty() {
            match self.tls.writer().write(&self.outbuf) {
                Ok(n) => {
                    self.outbuf.drain(..n);
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }
        let mut total = 0usize;
        while self.tls.wants_write() {
            match self.tls.write_tls(&mut self.stream) {
                Ok(0) => break,
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(Error::Io(e)),
            }
        }
        Ok(total)
    }

    /// Consume every complete greeting line or exchange frame now sitting in
    /// `inbuf`, returning `Err` on the first protocol violation.
    fn drain_inbuf(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::AwaitGreeting => {
                    let Some(end) = find_crlf(&self.inbuf) else {
                        if self.inbuf.len() > MAX_GREETING_LEN {
                            return Err(Error::protocol("greeting exceeds 4096 bytes"));
                        }
                        return Ok(());
                    };
                    let line: Vec<u8> = self.inbuf.drain(..=end).collect();
                    let peer_versions = frame::parse_greeting(&line)
                        .ok_or_else(|| Error::protocol("malformed greeting line"))?;
                    let chosen = frame::negotiate_version(&peer_versions)
                        .ok_or_else(|| Error::protocol("no shared protocol version"))?;
                    self.outbuf.extend_from_slice(&frame::render_greeting(&[chosen]));
                    self.state = State::Exchange;
                    debug!(peer = %self.peer_addr, version = chosen, "greeting negotiated");
                }
                State::Exchange => {
                    if self.inbuf.len() < MESSAGE_LEN {
                        return Ok(());
                    }
                    let raw: Vec<u8> = self.inbuf.drain(..MESSAGE_LEN).collect();
                    self.handle_frame(&raw)?;
                }
                State::Closing => return Ok(()),
            }
        }
    }

    fn handle_frame(&mut self, raw: &[u8]) -> Result<()> {
        let tag = &raw[..frame::CONTROL_LEN];
        let body = &raw[frame::CONTROL_LEN..frame::CONTROL_LEN + frame::PACKET_LEN];
        let digest: [u8; frame::DIGEST_LEN] = raw[frame::CONTROL_LEN + frame::PACKET_LEN..]
            .try_into()
            .expect("slice is exactly DIGEST_LEN bytes");

        match ControlTag::parse(tag) {
            Some(ControlTag::Junk) => {
                if digest != frame::digest_junk(body) {
                    self.state = State::Closing;
                    return Err(Error::protocol("JUNK digest mismatch"));
                }
                self.sink.junk_received();
                self.queue_ack(AckTag::Received, &frame::digest_received_junk(body));
            }
            Some(ControlTag::Send) if !self.reject_packets => {
                if digest != frame::digest_send(body) {
                    self.state = State::Closing;
                    return Err(Error::protocol("SEND digest mismatch"));
                }
                self.sink.deliver(body);
                self.queue_ack(AckTag::Received, &frame::digest_received(body));
            }
            Some(ControlTag::Send) => {
                if digest != frame::digest_send(body) {
                    self.state = State::Closing;
                    return Err(Error::protocol("SEND digest mismatch"));
                }
                self.sink.rejected();
                self.queue_ack(AckTag::Rejected, &frame::digest_rejected(body));
            }
            None => {
                self.state = State::Closing;
                return Err(Error::protocol("unknown control tag"));
            }
        }
        Ok(())
    }

    fn queue_ack(&mut self, tag: AckTag, digest: &[u8]) {
        self.outbuf.extend_from_slice(match tag {
            AckTag::Received => frame::RECEIVED_CONTROL.as_slice(),
            AckTag::Rejected => frame::REJECTED_CONTROL.as_slice(),
        });
        self.outbuf.extend_from_slice(digest);
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n").map(|i| i + 1)
}

impl Connection for ServerEngine {
    fn source(&mut self) -> &mut dyn Source {
        &mut self.stream
    }

    fn initial_readiness(&self) -> Readiness {
        Readiness { read: true, write: true }
    }

    fn process(&mut self, readable: bool, writable: bool, exceptional: bool, quota: Option<usize>) -> Outcome {
        if exceptional {
            return Outcome::closed();
        }

        let mut bytes = 0usize;
        let mut throttled = false;

        if readable && self.state != State::Closing {
            match self.do_read(quota) {
                Ok(n) => {
                    bytes += n;
                    if let Some(q) = quota {
                        throttled = n >= q;
                    }
                }
                Err(e) => {
                    warn!(peer = %self.peer_addr, error = %e, "server read failed");
                    return Outcome::closed();
                }
            }
            if let Err(e) = self.drain_inbuf() {
                debug!(peer = %self.peer_addr, error = %e, "protocol violation; closing without reply");
                return Outcome::closed();
            }
            self.last_activity = Instant::now();
        }

        if self.state == State::Closing {
            return Outcome::closed();
        }

        if writable || !self.outbuf.is_empty() {
            match self.do_write() {
                Ok(n) => bytes += n,
                Err(e) => {
                    warn!(peer = %self.peer_addr, error = %e, "server write failed");
                    return Outcome::closed();
                }
            }
        }

        if self.eof && self.outbuf.is_empty() {
            return Outcome::closed();
        }

        Outcome {
            readiness: Readiness {
                read: true,
                write: !self.outbuf.is_empty() || self.tls.wants_write(),
            },
            still_open: true,
            bytes_consumed: bytes,
            spawn: None,
            throttled,
        }
    }

    fn try_timeout(&mut self, cutoff: Instant) -> bool {
        self.last_activity < cutoff
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crlf_scan_finds_terminator() {
        assert_eq!(find_crlf(b"MTP 0.3\r\n"), Some(8));
        assert_eq!(find_crlf(b"no terminator"), None);
    }

    #[test]
    fn crlf_scan_is_none_for_partial_line() {
        assert_eq!(find_crlf(b"MTP 0.3"), None);
    }
}
