//! Single-threaded DNS cache consulted by the outbound dispatcher.
//!
//! A lookup that needs real resolution spawns a worker thread that performs
//! the blocking `getaddrinfo` call and posts its result back over a
//! crossbeam channel — the one legitimate cross-thread boundary in this
//! node. `process` drains that channel once per reactor tick; everything
//! else here runs exclusively on the scheduler thread.

use crossbeam::channel::{self, Receiver, Sender};
use std::collections::HashMap;
use std::net::{IpAddr, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const FORWARD_TTL: Duration = Duration::from_secs(30 * 60);
const REVERSE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Why a lookup failed. Carries enough to log; callers don't need to
/// distinguish resolver error classes.
#[derive(Debug, Clone)]
pub struct LookupError {
    pub reason: String,
}

pub type Callback = Box<dyn FnOnce(Result<IpAddr, LookupError>) + Send>;

struct ForwardEntry {
    /// `None` while resolution is in flight (PENDING).
    result: Option<Result<IpAddr, String>>,
    completed_at: Option<Instant>,
    waiters: Vec<Callback>,
}

struct WorkerResult {
    name: String,
    result: Result<IpAddr, String>,
}

/// Forward (name -> address) and reverse (address -> name) caches, plus the
/// inbox worker threads post completions into.
pub struct DnsCache {
    forward: HashMap<String, ForwardEntry>,
    reverse: HashMap<IpAddr, (String, Instant)>,
    tx: Sender<WorkerResult>,
    rx: Receiver<WorkerResult>,
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

impl DnsCache {
    pub fn new() -> Self {
        let (tx, rx) = channel::unbounded();
        Self {
            forward: HashMap::new(),
            reverse: HashMap::new(),
            tx,
            rx,
        }
    }

    /// Resolve `name`, invoking `cb` exactly once. Literal IPs and warm
    /// cache hits call back synchronously, on the current stack; everything
    /// else waits for `process` to drain the worker thread's answer.
    pub fn lookup(&mut self, name: &str, cb: Callback) {
        if let Ok(ip) = name.parse::<IpAddr>() {
            cb(Ok(ip));
            return;
        }

        if let Some(entry) = self.forward.get_mut(name) {
            match entry.result.clone() {
                Some(result) => deliver(cb, result),
                None => entry.waiters.push(cb),
            }
            return;
        }

        self.forward.insert(
            name.to_string(),
            ForwardEntry {
                result: None,
                completed_at: None,
                waiters: vec![cb],
            },
        );
        self.spawn_resolve(name.to_string());
    }

    fn spawn_resolve(&self, name: String) {
        let tx = self.tx.clone();
        std::thread::spawn(move || {
            let result = resolve_blocking(&name);
            let _ = tx.send(WorkerResult { name, result });
        });
    }

    /// Drain completed resolutions and fire their waiters. Call once per
    /// reactor tick.
    pub fn process(&mut self) {
        while let Ok(msg) = self.rx.try_recv() {
            let Some(entry) = self.forward.get_mut(&msg.name) else {
                // Cache entry was evicted or cancelled by `shutdown` before
                // the worker finished; drop the answer silently.
                continue;
            };
            entry.result = Some(msg.result.clone());
            entry.completed_at = Some(Instant::now());

            if let Ok(ip) = &msg.result {
                self.reverse.insert(*ip, (msg.name.clone(), Instant::now()));
            }

            let waiters = std::mem::take(&mut entry.waiters);
            debug!(name = %msg.name, ok = msg.result.is_ok(), waiters = waiters.len(), "DNS resolution completed");
            for cb in waiters {
                deliver(cb, msg.result.clone());
            }
        }
    }

    /// Drop forward entries older than 30 minutes (PENDING entries are
    /// never aged) and reverse entries older than 24 hours.
    pub fn clean_cache(&mut self, now: Instant) {
        self.forward.retain(|_, entry| match entry.completed_at {
            None => true,
            Some(at) => now.duration_since(at) < FORWARD_TTL,
        });
        self.reverse.retain(|_, (_, at)| now.duration_since(*at) < REVERSE_TTL);
    }

    /// Cancel every outstanding request without invoking its waiters. Any
    /// worker-thread answer that arrives afterward is drained by `process`
    /// and discarded, since its forward entry no longer exists.
    pub fn shutdown(&mut self) {
        let pending = self.forward.len();
        self.forward.clear();
        if pending > 0 {
            warn!(pending, "DNS cache shut down with requests in flight");
        }
        while self.rx.try_recv().is_ok() {}
    }

    /// Reverse-lookup a display name for `ip`, if one is cached.
    pub fn display_name(&self, ip: &IpAddr) -> Option<&str> {
        self.reverse.get(ip).map(|(name, _)| name.as_str())
    }
}

fn deliver(cb: Callback, result: Result<IpAddr, String>) {
    cb(result.map_err(|reason| LookupError { reason }));
}

fn resolve_blocking(name: &str) -> Result<IpAddr, String> {
    (name, 0u16)
        .to_socket_addrs()
        .map_err(|e| e.to_string())?
        .next()
        .map(|addr| addr.ip())
        .ok_or_else(|| "no addresses returned".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn literal_ip_resolves_synchronously() {
        let mut cache = DnsCache::new();
        let (tx, rx) = mpsc::channel();
        cache.lookup("127.0.0.1", Box::new(move |r| tx.send(r).unwrap()));
        let result = rx.try_recv().expect("literal IP must answer on the same stack");
        assert_eq!(result.unwrap(), "127.0.0.1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn clean_cache_never_evicts_pending_entries() {
        let mut cache = DnsCache::new();
        cache.forward.insert(
            "still-resolving.example".to_string(),
            ForwardEntry { result: None, completed_at: None, waiters: Vec::new() },
        );
        cache.clean_cache(Instant::now() + Duration::from_secs(3600));
        assert!(cache.forward.contains_key("still-resolving.example"));
    }

    #[test]
    fn clean_cache_evicts_stale_forward_entries() {
        let mut cache = DnsCache::new();
        cache.forward.insert(
            "stale.example".to_string(),
            ForwardEntry {
                result: Some(Ok("10.0.0.1".parse().unwrap())),
                completed_at: Some(Instant::now()),
                waiters: Vec::new(),
            },
        );
        cache.clean_cache(Instant::now() + FORWARD_TTL + Duration::from_secs(1));
        assert!(!cache.forward.contains_key("stale.example"));
    }

    #[test]
    fn shutdown_clears_pending_without_invoking_waiters() {
        let mut cache = DnsCache::new();
        let invoked = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
        let flag = invoked.clone();
        cache.lookup("never-resolves.example", Box::new(move |_| {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }));
        cache.shutdown();
        assert!(!invoked.load(std::sync::atomic::Ordering::SeqCst));
        assert!(cache.forward.is_empty());
    }
}
