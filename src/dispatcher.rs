//! Outbound dispatcher: routes packets to a per-destination [`ClientEngine`],
//! coalescing bursts aimed at the same peer onto one connection and capping
//! how many outbound connections may be open at once.

use crate::client::{ClientEngine, DeliverablePacket};
use crate::dns::DnsCache;
use crate::reactor::Reactor;
use mio::Token;
use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// `(ip, port, key fingerprint)` identifies one outbound destination;
/// address family is already carried by `IpAddr`.
pub type RouteKey = (IpAddr, u16, String);

/// Where to route a batch of packets: either a literal address or a name
/// that still needs resolving.
pub enum Destination {
    Literal(IpAddr),
    Hostname(String),
}

/// Routing information accompanying a batch of packets handed to the
/// dispatcher.
pub struct Routing {
    pub destination: Destination,
    pub port: u16,
    pub key_fingerprint: String,
}

struct PendingBatch {
    key: RouteKey,
    addr: SocketAddr,
    packets: Vec<Box<dyn DeliverablePacket>>,
    display_name: String,
}

/// Owns every outbound `ClientEngine`, the backlog of batches waiting for
/// an admission slot, and the inbox DNS completions land in.
pub struct Dispatcher {
    active: HashMap<RouteKey, Token>,
    pending: VecDeque<PendingBatch>,
    /// Completions land here from either a synchronous DNS cache hit or
    /// `DnsCache::process` draining a worker thread's answer; a `Mutex`
    /// keeps this correct even if a future resolver backend posts directly
    /// from its own thread instead of through `DnsCache`'s channel.
    msg_queue: Arc<Mutex<VecDeque<PendingBatch>>>,
    /// `(key, token)` pairs, so a stale engine's close notification can't
    /// clobber a newer mapping that has since replaced it at the same key
    /// (see `drain`).
    closed: Arc<Mutex<VecDeque<(RouteKey, Token)>>>,
    max_active: usize,
    /// Shared so a repeat connection to the same fingerprint skips logging
    /// first-contact again; each destination still gets its own
    /// [`rustls::ClientConfig`] pinned to its own key fingerprint.
    cert_cache: Arc<crate::tls::PeerCertificateCache>,
    optimize_throughput: bool,
}

impl Dispatcher {
    pub fn new(max_active: usize, cert_cache: Arc<crate::tls::PeerCertificateCache>, optimize_throughput: bool) -> Self {
        Self {
            active: HashMap::new(),
            pending: VecDeque::new(),
            msg_queue: Arc::new(Mutex::new(VecDeque::new())),
            closed: Arc::new(Mutex::new(VecDeque::new())),
            max_active,
            cert_cache,
            optimize_throughput,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Resolve `routing`'s destination (synchronously for a literal IP, via
    /// `dns` otherwise) and queue `packets` for delivery once resolved.
    /// Packets are failed `retriable=true` on resolution failure; no
    /// connection is attempted.
    pub fn send_packets_by_routing(
        &mut self,
        dns: &mut DnsCache,
        routing: Routing,
        packets: Vec<Box<dyn DeliverablePacket>>,
    ) {
        let port = routing.port;
        let key_fingerprint = routing.key_fingerprint;

        match routing.destination {
            Destination::Literal(ip) => {
                let display_name = ip.to_string();
                self.msg_queue.lock().unwrap().push_back(PendingBatch {
                    key: (ip, port, key_fingerprint),
                    addr: SocketAddr::new(ip, port),
                    packets,
                    display_name,
                });
            }
            Destination::Hostname(host) => {
                let msg_queue = Arc::clone(&self.msg_queue);
                let display_name = host.clone();
                dns.lookup(
                    &host,
                    Box::new(move |result| match result {
                        Ok(ip) => {
                            msg_queue.lock().unwrap().push_back(PendingBatch {
                                key: (ip, port, key_fingerprint),
                                addr: SocketAddr::new(ip, port),
                                packets,
                                display_name,
                            });
                        }
                        Err(e) => {
                            warn!(host = %display_name, reason = %e.reason, "DNS resolution failed; failing packets");
                            for packet in packets {
                                packet.failed(true);
                            }
                        }
                    }),
                );
            }
        }
    }

    /// Reap closed engines, admit from `pending`, then drain `msg_queue`.
    /// Must run before every `Reactor::process` call.
    pub fn drain(&mut self, reactor: &mut Reactor) {
        let closed: Vec<(RouteKey, Token)> = self.closed.lock().unwrap().drain(..).collect();
        for (key, token) in closed {
            // A destination whose engine was `Draining` when a fresh batch
            // arrived may already have been replaced in `active` by a new
            // engine/token for the same key; only remove the mapping if it
            // still points at the engine that's actually closing.
            if self.active.get(&key) == Some(&token) {
                self.active.remove(&key);
            }
        }

        while self.active.len() < self.max_active {
            let Some(batch) = self.pending.pop_front() else {
                break;
            };
            self.dispatch(reactor, batch);
        }

        let incoming: Vec<PendingBatch> = self.msg_queue.lock().unwrap().drain(..).collect();
        for batch in incoming {
            self.dispatch(reactor, batch);
        }
    }

    fn dispatch(&mut self, reactor: &mut Reactor, mut batch: PendingBatch) {
        if let Some(&token) = self.active.get(&batch.key) {
            if let Some(engine) = reactor.get_mut::<ClientEngine>(token) {
                if engine.is_accepting() {
                    for packet in batch.packets.drain(..) {
                        engine.push(packet);
                    }
                    return;
                }
            }
        }

        if self.active.len() >= self.max_active {
            self.pending.push_back(batch);
            return;
        }

        let key_fingerprint = batch.key.2.clone();
        let tls_config = crate::tls::build_client_config(key_fingerprint, Arc::clone(&self.cert_cache));
        let mut engine = match ClientEngine::connect(batch.addr, tls_config, self.optimize_throughput) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(addr = %batch.addr, name = %batch.display_name, error = %e, "outbound connect failed; failing packets");
                for packet in batch.packets {
                    packet.failed(true);
                }
                return;
            }
        };

        for packet in batch.packets {
            engine.push(packet);
        }

        match reactor.register(Box::new(engine)) {
            Ok(token) => {
                let key = batch.key.clone();
                let closed = Arc::clone(&self.closed);
                if let Some(engine) = reactor.get_mut::<ClientEngine>(token) {
                    engine.set_on_closed(Box::new(move || {
                        closed.lock().unwrap().push_back((key, token));
                    }));
                }
                info!(addr = %batch.addr, name = %batch.display_name, "opened outbound connection");
                self.active.insert(batch.key, token);
            }
            Err(e) => warn!(addr = %batch.addr, error = %e, "failed to register outbound connection"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admission_cap_is_respected_by_construction() {
        let cache = Arc::new(crate::tls::PeerCertificateCache::new());
        let dispatcher = Dispatcher::new(4, cache, false);
        assert_eq!(dispatcher.max_active, 4);
        assert_eq!(dispatcher.active_count(), 0);
    }
}
