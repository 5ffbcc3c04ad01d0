//! Top-level wiring: binds the listener, owns the reactor, the outbound
//! dispatcher, and the DNS cache, and drives them with one tick loop.
//!
//! Directory lookups, keystore management, and the SMTP/HTTP exit adapters
//! that feed packets into [`Dispatcher::send_packets_by_routing`] are
//! external collaborators above this layer; `Node` only owns the transport.

use crate::config::TransportConfig;
use crate::dispatcher::Dispatcher;
use crate::dns::DnsCache;
use crate::error::Result;
use crate::listener::Listener;
use crate::reactor::{Reactor, TICK_INTERVAL};
use crate::server::{PacketSink, ServerEngine};
use crate::tls::{self, PeerCertificateCache};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// A running node's transport layer, wired together and driven by one loop.
pub struct Node {
    reactor: Reactor,
    dispatcher: Dispatcher,
    dns: DnsCache,
    config: TransportConfig,
    server_tls: Arc<rustls::ServerConfig>,
    sink: Arc<dyn PacketSink>,
    last_tick: Instant,
}

impl Node {
    /// Bind the listener and build the reactor, dispatcher, and DNS cache
    /// from `config`. `sink` receives every accepted SEND/JUNK packet.
    pub fn new(config: TransportConfig, sink: Arc<dyn PacketSink>) -> Result<Self> {
        let server_tls = tls::build_server_config(&config.tls.cert_path, &config.tls.key_path)?;
        let cert_cache = Arc::new(PeerCertificateCache::new());

        let mut reactor = Reactor::new()?;
        reactor.set_idle_timeout(Some(config.idle_timeout()));
        reactor.set_bandwidth(config.server.max_bandwidth, config.server.max_bandwidth_spike);

        let listen_addr = SocketAddr::new(config.incoming.listen_ip, config.incoming.port);
        let listener = Listener::bind(listen_addr)?;
        reactor.register(Box::new(listener))?;

        let dispatcher = Dispatcher::new(
            config.outgoing.max_connections,
            cert_cache,
            config.server.optimize_throughput,
        );

        info!(addr = %listen_addr, "node transport layer ready");

        Ok(Self {
            reactor,
            dispatcher,
            dns: DnsCache::new(),
            config,
            server_tls,
            sink,
            last_tick: Instant::now(),
        })
    }

    /// Access the outbound dispatcher, e.g. to call
    /// `send_packets_by_routing` from the layer that decides where packets
    /// go next.
    pub fn dispatcher_mut(&mut self) -> &mut Dispatcher {
        &mut self.dispatcher
    }

    /// Access the DNS cache the dispatcher resolves hostnames through.
    pub fn dns_mut(&mut self) -> &mut DnsCache {
        &mut self.dns
    }

    pub fn connection_count(&self) -> usize {
        self.reactor.len()
    }

    /// Run until an unrecoverable reactor error occurs. Does not return
    /// under normal operation.
    pub fn run(mut self) -> Result<()> {
        loop {
            self.step()?;
        }
    }

    /// One iteration of the loop: drain the dispatcher, wait for readiness,
    /// wrap any freshly accepted sockets in a server engine, and tick the
    /// bandwidth bucket and DNS cache on schedule.
    pub fn step(&mut self) -> Result<()> {
        self.dispatcher.drain(&mut self.reactor);

        let spawns = self.reactor.process(TICK_INTERVAL)?;
        for (stream, addr) in spawns {
            self.accept(stream, addr);
        }

        let now = Instant::now();
        if now.duration_since(self.last_tick) >= TICK_INTERVAL {
            self.reactor.tick();
            self.dns.process();
            self.dns.clean_cache(now);
            self.reactor.try_timeout(now);
            self.last_tick = now;
        }

        Ok(())
    }

    fn accept(&mut self, stream: mio::net::TcpStream, addr: SocketAddr) {
        let engine = match ServerEngine::new(
            stream,
            addr,
            Arc::clone(&self.server_tls),
            Arc::clone(&self.sink),
            self.config.incoming.reject_packets,
        ) {
            Ok(engine) => engine,
            Err(e) => {
                warn!(peer = %addr, error = %e, "failed to start inbound TLS session");
                return;
            }
        };
        if let Err(e) = self.reactor.register(Box::new(engine)) {
            warn!(peer = %addr, error = %e, "failed to register inbound connection");
        }
    }
}
