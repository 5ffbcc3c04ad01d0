//! The single-threaded readiness reactor: connection registry, the
//! multiplexer wait, per-tick bandwidth division, and idle eviction.
//!
//! Exactly one scheduler thread owns every [`Connection`] registered here.
//! `mio::Poll` supplies the OS-level readiness primitive (epoll on Linux,
//! kqueue on BSD/macOS, IOCP on Windows) behind one interface, which is the
//! "variants behind one trait" the design calls for: rather than hand-roll
//! select/poll/epoll backends ourselves, we take the one the ecosystem
//! already gets right and are careful to preserve the level-triggered
//! contract on top of it (see [`Connection::process`]).

use crate::error::Result;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often [`Reactor::tick`] must be called to keep the token bucket
/// refilling at the configured rate.
pub const TICK_INTERVAL: Duration = Duration::from_secs(1);

/// A connection's read/write interest, cached by the reactor between calls
/// to [`Connection::process`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Readiness {
    pub read: bool,
    /// `false` = no write interest, `true` = write interest. Exceptional
    /// conditions (OOB/error) are always reported by mio regardless of
    /// registered interest, so there is no separate "also watch errors" bit
    /// to carry here.
    pub write: bool,
}

impl Readiness {
    pub const NONE: Readiness = Readiness {
        read: false,
        write: false,
    };

    fn to_interest(self) -> Option<Interest> {
        match (self.read, self.write) {
            (false, false) => None,
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
        }
    }
}

/// A request handed back from [`Connection::process`] asking the reactor to
/// adopt a new connection (used by the listener to hand off an accepted
/// socket without holding a reference back into the reactor itself).
pub enum Spawn {
    /// A TCP connection accepted by a listener, not yet wrapped in TLS.
    Accepted(mio::net::TcpStream, std::net::SocketAddr),
}

/// Result of driving one connection's I/O.
pub struct Outcome {
    /// Read/write interest to re-register for the next wait.
    pub readiness: Readiness,
    /// If false, the reactor drops this connection before the next wait.
    pub still_open: bool,
    /// Bytes sent and received this call, charged against the bandwidth
    /// bucket.
    pub bytes_consumed: usize,
    /// A new connection this call wants the reactor to adopt (listeners
    /// only; everything else leaves this `None`).
    pub spawn: Option<Spawn>,
    /// True if this call stopped early because it exhausted its bandwidth
    /// quota while more readable data was already sitting in a buffer (TLS
    /// plaintext, not just the socket). Since mio's readiness is
    /// edge-triggered, the reactor won't see a fresh event for bytes it
    /// never asked the kernel for, so it must revisit this connection on
    /// the next `process` call without waiting on the multiplexer.
    pub throttled: bool,
}

impl Outcome {
    pub fn closed() -> Self {
        Outcome {
            readiness: Readiness::NONE,
            still_open: false,
            bytes_consumed: 0,
            spawn: None,
            throttled: false,
        }
    }
}

/// The uniform interface every participant in the reactor implements.
///
/// Invariant: between returns from `process`, the reactor's cached readiness
/// equals the last readiness it returned; once `still_open` is false the
/// reactor removes the entry before the next wait.
pub trait Connection {
    /// The socket to register with the OS multiplexer.
    fn source(&mut self) -> &mut dyn Source;

    /// Readiness this connection wants right now (used only at
    /// registration time; subsequent interest comes from `process`'s
    /// return value).
    fn initial_readiness(&self) -> Readiness;

    /// Invoked when there is data to read, room to write, or an exceptional
    /// condition to handle. Must attempt to make progress until it would
    /// block: the reactor calls this once per readiness report and does not
    /// loop internally, so engines that stop short of `WouldBlock` will
    /// stall even though the underlying primitive is level-triggered.
    fn process(&mut self, readable: bool, writable: bool, exceptional: bool, quota: Option<usize>) -> Outcome;

    /// If this connection has seen no activity since `cutoff`, shut it down
    /// and report `true` so the reactor removes it.
    fn try_timeout(&mut self, _cutoff: Instant) -> bool {
        false
    }

    /// Name used in log lines; does not need to be unique.
    fn name(&self) -> &str {
        "connection"
    }

    /// Lets callers holding just a `Token` recover the concrete connection
    /// type (the dispatcher needs this to append packets to an already
    /// -registered `ClientEngine`). Every implementor returns `self`.
    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Process-wide byte budget, refilled every [`TICK_INTERVAL`].
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    per_tick: u64,
    max: u64,
    bucket: u64,
}

impl TokenBucket {
    /// `max_burst` defaults to `5 * bytes_per_second * TICK_INTERVAL` when
    /// `None`, matching the original node's default.
    pub fn new(bytes_per_second: u64, max_burst: Option<u64>) -> Self {
        let per_tick = (bytes_per_second as f64 * TICK_INTERVAL.as_secs_f64()) as u64;
        let max = max_burst.unwrap_or(per_tick * 5);
        Self {
            per_tick,
            max,
            bucket: max,
        }
    }

    pub fn tick(&mut self) {
        self.bucket = (self.bucket + self.per_tick).min(self.max);
    }

    pub fn available(&self) -> u64 {
        self.bucket
    }

    pub fn consume(&mut self, n: u64) {
        self.bucket = self.bucket.saturating_sub(n);
    }

    /// Per-connection share for this dispatch round: `floor(bucket / n)`.
    /// Deliberately sub-fair under saturation (leftover bytes go unused this
    /// tick) to keep the arithmetic integer and tick-bounded.
    pub fn share(&self, n_ready: usize) -> usize {
        if n_ready == 0 {
            0
        } else {
            (self.bucket / n_ready as u64) as usize
        }
    }
}

/// The reactor: registry of connections, multiplexer wait, dispatch with a
/// fair per-tick byte quota, and idle eviction.
pub struct Reactor {
    poll: Poll,
    events: Events,
    connections: HashMap<Token, Box<dyn Connection>>,
    readiness: HashMap<Token, Readiness>,
    next_token: usize,
    idle_timeout: Option<Duration>,
    bandwidth: Option<TokenBucket>,
    throttled: std::collections::HashSet<Token>,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(1024),
            connections: HashMap::new(),
            readiness: HashMap::new(),
            next_token: 0,
            idle_timeout: None,
            bandwidth: None,
            throttled: std::collections::HashSet::new(),
        })
    }

    pub fn set_idle_timeout(&mut self, timeout: Option<Duration>) {
        self.idle_timeout = timeout;
    }

    /// `bytes_per_second = None` disables bandwidth limiting entirely.
    pub fn set_bandwidth(&mut self, bytes_per_second: Option<u64>, max_burst: Option<u64>) {
        self.bandwidth = bytes_per_second.map(|n| TokenBucket::new(n, max_burst));
    }

    /// Query the connection's initial readiness; if it reports no interest
    /// at all and isn't already queued to die, register it with the OS
    /// multiplexer. Does nothing for a connection that is already closed.
    pub fn register(&mut self, mut conn: Box<dyn Connection>) -> Result<Token> {
        let readiness = conn.initial_readiness();
        let token = Token(self.next_token);
        self.next_token += 1;
        if let Some(interest) = readiness.to_interest() {
            self.poll.registry().register(conn.source(), token, interest)?;
        }
        debug!(conn = conn.name(), ?token, "registered connection");
        self.readiness.insert(token, readiness);
        self.connections.insert(token, conn);
        Ok(token)
    }

    /// Recover a concrete connection type by token, e.g. so the outbound
    /// dispatcher can append a packet to an already-registered
    /// `ClientEngine` without the reactor knowing that type exists.
    pub fn get_mut<T: 'static>(&mut self, token: Token) -> Option<&mut T> {
        self.connections.get_mut(&token)?.as_any_mut().downcast_mut::<T>()
    }

    fn remove(&mut self, token: Token) {
        if let Some(mut conn) = self.connections.remove(&token) {
            let _ = self.poll.registry().deregister(conn.source());
        }
        self.readiness.remove(&token);
    }

    /// Wait up to `timeout` for readiness, dispatch every ready connection
    /// once, and return any spawn requests (newly accepted sockets) for the
    /// caller to wrap and register.
    pub fn process(&mut self, timeout: Duration) -> Result<Vec<(mio::net::TcpStream, std::net::SocketAddr)>> {
        let watching = self
            .readiness
            .values()
            .any(|r| r.to_interest().is_some());
        if !watching {
            // Never select on an empty fd set: some platforms mishandle it.
            std::thread::sleep(timeout);
            return Ok(Vec::new());
        }

        if let Some(bucket) = &self.bandwidth {
            if bucket.available() == 0 {
                std::thread::sleep(timeout);
                return Ok(Vec::new());
            }
        }

        match self.poll.poll(&mut self.events, Some(timeout)) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        }

        let mut ready: Vec<(Token, bool, bool, bool)> = self
            .events
            .iter()
            .map(|e| {
                (
                    e.token(),
                    e.is_readable(),
                    e.is_writable(),
                    e.is_error() || e.is_read_closed() || e.is_write_closed(),
                )
            })
            .collect();

        // Connections throttled by quota last round may still have buffered
        // readable data with no corresponding fresh socket event; revisit
        // them unconditionally so a chatty peer isn't starved just because
        // mio won't re-report readiness we didn't fully drain.
        let polled: std::collections::HashSet<Token> = ready.iter().map(|(t, ..)| *t).collect();
        for token in self.throttled.drain().collect::<Vec<_>>() {
            if !polled.contains(&token) && self.connections.contains_key(&token) {
                ready.push((token, true, false, false));
            }
        }

        if ready.is_empty() {
            return Ok(Vec::new());
        }

        let quota = self.bandwidth.as_ref().map(|b| b.share(ready.len()));
        let mut spawns = Vec::new();
        let mut to_remove = Vec::new();

        for (token, r, w, x) in ready {
            let Some(conn) = self.connections.get_mut(&token) else {
                continue;
            };
            let name = conn.name().to_string();
            let outcome = conn.process(r, w, x, quota);

            if let Some(bucket) = &mut self.bandwidth {
                bucket.consume(outcome.bytes_consumed as u64);
            }
            if let Some(Spawn::Accepted(stream, addr)) = outcome.spawn {
                spawns.push((stream, addr));
            }

            if !outcome.still_open {
                to_remove.push(token);
                continue;
            }

            if outcome.throttled {
                self.throttled.insert(token);
            }

            if let Some(interest) = outcome.readiness.to_interest() {
                if let Err(e) = self.reregister(token, interest) {
                    warn!(conn = name.as_str(), error = %e, "reregister failed; dropping connection");
                    to_remove.push(token);
                    continue;
                }
            } else if let Some(conn) = self.connections.get_mut(&token) {
                let _ = self.poll.registry().deregister(conn.source());
            }
            self.readiness.insert(token, outcome.readiness);
        }

        for token in to_remove {
            self.throttled.remove(&token);
            self.remove(token);
        }

        Ok(spawns)
    }

    fn reregister(&mut self, token: Token, interest: Interest) -> io::Result<()> {
        let had_interest = self
            .readiness
            .get(&token)
            .and_then(|r| r.to_interest())
            .is_some();
        let conn = self.connections.get_mut(&token).expect("token just dispatched");
        if had_interest {
            self.poll.registry().reregister(conn.source(), token, interest)
        } else {
            self.poll.registry().register(conn.source(), token, interest)
        }
    }

    /// Close any connection idle since before `now - idle_timeout`.
    pub fn try_timeout(&mut self, now: Instant) {
        let Some(timeout) = self.idle_timeout else {
            return;
        };
        let cutoff = now.checked_sub(timeout).unwrap_or(now);
        let expired: Vec<Token> = self
            .connections
            .iter_mut()
            .filter_map(|(token, conn)| conn.try_timeout(cutoff).then_some(*token))
            .collect();
        for token in expired {
            debug!(?token, "connection idle past timeout");
            self.remove(token);
        }
    }

    /// Must be called exactly once every [`TICK_INTERVAL`].
    pub fn tick(&mut self) {
        if let Some(bucket) = &mut self.bandwidth {
            bucket.tick();
        }
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_bucket_refills_and_clamps_to_max() {
        let mut bucket = TokenBucket::new(100, Some(250));
        assert_eq!(bucket.available(), 250);
        bucket.consume(250);
        assert_eq!(bucket.available(), 0);
        bucket.tick();
        assert_eq!(bucket.available(), 100);
        bucket.tick();
        bucket.tick();
        bucket.tick();
        // 100 -> 200 -> 250 (clamped) -> 250 (clamped)
        assert_eq!(bucket.available(), 250);
    }

    #[test]
    fn token_bucket_default_burst_is_five_ticks() {
        let bucket = TokenBucket::new(1000, None);
        assert_eq!(bucket.available(), 5000);
    }

    #[test]
    fn share_divides_evenly_and_drops_remainder() {
        let bucket = TokenBucket::new(10, Some(10));
        assert_eq!(bucket.share(3), 3); // floor(10/3) == 3, 1 byte unused
        assert_eq!(bucket.share(0), 0);
    }

    #[test]
    fn readiness_interest_mapping() {
        assert_eq!(Readiness::NONE.to_interest(), None);
        assert_eq!(
            Readiness { read: true, write: false }.to_interest(),
            Some(Interest::READABLE)
        );
        assert_eq!(
            Readiness { read: true, write: true }.to_interest(),
            Some(Interest::READABLE | Interest::WRITABLE)
        );
    }
}
