//! Drives a real MTP handshake and SEND/JUNK/REJECTED exchange over a
//! loopback TCP connection, through actual TLS sessions pinned to a
//! fingerprint computed from a throwaway test certificate.

use mtpd_core::client::{ClientEngine, DeliverablePacket};
use mtpd_core::frame::PACKET_LEN;
use mtpd_core::listener::Listener;
use mtpd_core::reactor::Reactor;
use mtpd_core::server::{PacketSink, ServerEngine};
use mtpd_core::tls;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const SERVER_CERT: &str = include_str!("fixtures/server-cert.pem");
const SERVER_KEY: &str = include_str!("fixtures/server-key.pem");
const SERVER_FINGERPRINT: &str = "46a0d74530ee4521092a168a91e3d10ff768937e";

static FIXTURE_COUNTER: AtomicU64 = AtomicU64::new(0);

fn write_fixture(contents: &str) -> PathBuf {
    let id = FIXTURE_COUNTER.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("mtpd-core-test-{}-{id}", std::process::id()));
    std::fs::write(&path, contents).expect("write test fixture");
    path
}

#[derive(Default)]
struct RecordingSink {
    delivered: Mutex<Vec<Vec<u8>>>,
    junk: Mutex<usize>,
    rejected: Mutex<usize>,
}

impl PacketSink for RecordingSink {
    fn deliver(&self, body: &[u8]) {
        self.delivered.lock().unwrap().push(body.to_vec());
    }
    fn junk_received(&self) {
        *self.junk.lock().unwrap() += 1;
    }
    fn rejected(&self) {
        *self.rejected.lock().unwrap() += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fate {
    Pending,
    Succeeded,
    Failed(bool),
}

struct TestPacket {
    body: Vec<u8>,
    junk: bool,
    fate: Arc<Mutex<Fate>>,
}

impl DeliverablePacket for TestPacket {
    fn contents(&self) -> &[u8] {
        &self.body
    }
    fn is_junk(&self) -> bool {
        self.junk
    }
    fn succeeded(self: Box<Self>) {
        *self.fate.lock().unwrap() = Fate::Succeeded;
    }
    fn failed(self: Box<Self>, retriable: bool) {
        *self.fate.lock().unwrap() = Fate::Failed(retriable);
    }
}

fn client_config() -> Arc<rustls::ClientConfig> {
    let cache = Arc::new(tls::PeerCertificateCache::new());
    tls::build_client_config(SERVER_FINGERPRINT.to_string(), cache)
}

/// Pump the reactor until `done` reports true or the deadline passes,
/// wrapping any freshly accepted socket in a server engine along the way.
fn pump_until(
    reactor: &mut Reactor,
    sink: &Arc<dyn PacketSink + Send + Sync>,
    reject_packets: bool,
    server_tls: &Arc<rustls::ServerConfig>,
    mut done: impl FnMut() -> bool,
) {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let spawns = reactor.process(Duration::from_millis(20)).expect("reactor step");
        for (stream, addr) in spawns {
            let engine = ServerEngine::new(stream, addr, Arc::clone(server_tls), Arc::clone(sink), reject_packets)
                .expect("server TLS session");
            reactor.register(Box::new(engine)).expect("register server engine");
        }
        if done() {
            return;
        }
        assert!(Instant::now() < deadline, "timed out waiting for exchange to complete");
    }
}

#[test]
fn send_and_junk_packets_are_delivered_and_acked() {
    let cert_path = write_fixture(SERVER_CERT);
    let key_path = write_fixture(SERVER_KEY);
    let server_tls = tls::build_server_config(cert_path.to_str().unwrap(), key_path.to_str().unwrap())
        .expect("build server tls config");

    let sink: Arc<RecordingSink> = Arc::new(RecordingSink::default());
    let sink_dyn: Arc<dyn PacketSink + Send + Sync> = sink.clone();

    let mut reactor = Reactor::new().expect("reactor");
    let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
    let listen_addr = listener.local_addr();
    reactor.register(Box::new(listener)).expect("register listener");

    let client = ClientEngine::connect(listen_addr, client_config(), false).expect("dial");
    let client_token = reactor.register(Box::new(client)).expect("register client");

    let send_fate = Arc::new(Mutex::new(Fate::Pending));
    let junk_fate = Arc::new(Mutex::new(Fate::Pending));

    reactor
        .get_mut::<ClientEngine>(client_token)
        .unwrap()
        .push(Box::new(TestPacket {
            body: vec![0xAB; PACKET_LEN],
            junk: false,
            fate: Arc::clone(&send_fate),
        }));
    reactor
        .get_mut::<ClientEngine>(client_token)
        .unwrap()
        .push(Box::new(TestPacket {
            body: vec![0xCD; PACKET_LEN],
            junk: true,
            fate: Arc::clone(&junk_fate),
        }));

    pump_until(&mut reactor, &sink_dyn, false, &server_tls, || {
        matches!(*send_fate.lock().unwrap(), Fate::Succeeded) && matches!(*junk_fate.lock().unwrap(), Fate::Succeeded)
    });

    assert_eq!(sink.delivered.lock().unwrap().as_slice(), [vec![0xAB; PACKET_LEN]]);
    assert_eq!(*sink.junk.lock().unwrap(), 1);
    assert_eq!(*sink.rejected.lock().unwrap(), 0);
}

#[test]
fn reject_mode_fails_the_packet_without_delivering_it() {
    let cert_path = write_fixture(SERVER_CERT);
    let key_path = write_fixture(SERVER_KEY);
    let server_tls = tls::build_server_config(cert_path.to_str().unwrap(), key_path.to_str().unwrap())
        .expect("build server tls config");

    let sink: Arc<RecordingSink> = Arc::new(RecordingSink::default());
    let sink_dyn: Arc<dyn PacketSink + Send + Sync> = sink.clone();

    let mut reactor = Reactor::new().expect("reactor");
    let listener = Listener::bind("127.0.0.1:0".parse().unwrap()).expect("bind");
    let listen_addr = listener.local_addr();
    reactor.register(Box::new(listener)).expect("register listener");

    let client = ClientEngine::connect(listen_addr, client_config(), false).expect("dial");
    let client_token = reactor.register(Box::new(client)).expect("register client");

    let fate = Arc::new(Mutex::new(Fate::Pending));
    reactor.get_mut::<ClientEngine>(client_token).unwrap().push(Box::new(TestPacket {
        body: vec![0x42; PACKET_LEN],
        junk: false,
        fate: Arc::clone(&fate),
    }));

    pump_until(&mut reactor, &sink_dyn, true, &server_tls, || {
        !matches!(*fate.lock().unwrap(), Fate::Pending)
    });

    assert_eq!(*fate.lock().unwrap(), Fate::Failed(false));
    assert!(sink.delivered.lock().unwrap().is_empty());
    assert_eq!(*sink.rejected.lock().unwrap(), 1);
}
