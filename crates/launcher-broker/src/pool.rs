//! Idle worker pool

use std::time::{Duration, Instant};

use launcher_core::Result;
use log::debug;
use nix::unistd::Pid;

/// Protocol class any worker of which can serve any request
pub const ANY_PROTOCOL: &str = "*";

/// What a worker can serve: a protocol plus the host it is connected to, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityKey {
    pub protocol: String,
    pub host: Option<String>,
}

impl CapabilityKey {
    /// An empty host means "not bound to a host"
    pub fn new(protocol: impl Into<String>, host: &str) -> Self {
        Self {
            protocol: protocol.into(),
            host: (!host.is_empty()).then(|| host.to_string()),
        }
    }
}

/// Channel through which an idle worker is handed to its next caller
pub trait WorkerConnection {
    /// Tell the worker to connect to `app_socket`
    fn hand_over(&mut self, app_socket: &str) -> Result<()>;
}

/// A worker that finished its job and is waiting for another one
#[derive(Debug)]
pub struct IdleWorker<C> {
    pub pid: Pid,
    pub key: CapabilityKey,
    pub connection: C,
    pub last_used: Instant,
    /// Reserved for the caller that will ask for this url
    pub held_url: Option<String>,
    /// Must not be reused once its current job ends
    pub temp_auth: bool,
}

impl<C> IdleWorker<C> {
    pub fn new(pid: Pid, key: CapabilityKey, connection: C) -> Self {
        Self {
            pid,
            key,
            connection,
            last_used: Instant::now(),
            held_url: None,
            temp_auth: false,
        }
    }

    pub fn held_for(mut self, url: impl Into<String>) -> Self {
        self.held_url = Some(url.into());
        self
    }

    pub fn temp_auth(mut self, temp_auth: bool) -> Self {
        self.temp_auth = temp_auth;
        self
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_used)
    }
}

/// Idle workers in registration order
#[derive(Debug)]
pub struct WorkerPool<C> {
    workers: Vec<IdleWorker<C>>,
    max_idle: Duration,
    keep_one: Option<String>,
}

impl<C> WorkerPool<C> {
    /// `keep_one` names the protocol of which one worker survives every sweep
    pub fn new(max_idle: Duration, keep_one: Option<String>) -> Self {
        Self {
            workers: Vec::new(),
            max_idle,
            keep_one,
        }
    }

    /// Add a worker that became idle. A worker already pooled under the same
    /// pid is replaced. Returns the worker back when it must be evicted
    /// instead of pooled.
    pub fn register(&mut self, worker: IdleWorker<C>) -> Option<IdleWorker<C>> {
        self.remove(worker.pid);
        if worker.temp_auth {
            debug!("worker {} used temporary authorization, evicting", worker.pid);
            return Some(worker);
        }
        debug!(
            "worker {} idle for {}:{}",
            worker.pid,
            worker.key.protocol,
            worker.key.host.as_deref().unwrap_or("")
        );
        self.workers.push(worker);
        None
    }

    /// Remove and return the best idle worker for `protocol` on `host`.
    ///
    /// Tried in order: same protocol and host, same protocol without a host,
    /// then any worker of the wildcard class. Held workers are never matched.
    pub fn take_match(&mut self, protocol: &str, host: &str) -> Option<IdleWorker<C>> {
        let wanted = CapabilityKey::new(protocol, host);
        let tiers: [&dyn Fn(&CapabilityKey) -> bool; 3] = [
            &|key: &CapabilityKey| *key == wanted,
            &|key: &CapabilityKey| key.protocol == wanted.protocol && key.host.is_none(),
            &|key: &CapabilityKey| key.protocol == ANY_PROTOCOL,
        ];
        for tier in tiers {
            let found = self
                .workers
                .iter()
                .position(|w| w.held_url.is_none() && tier(&w.key));
            if let Some(index) = found {
                return Some(self.workers.remove(index));
            }
        }
        None
    }

    /// Remove and return the worker held for `url`
    pub fn take_held(&mut self, url: &str) -> Option<IdleWorker<C>> {
        let index = self
            .workers
            .iter()
            .position(|w| w.held_url.as_deref() == Some(url))?;
        Some(self.workers.remove(index))
    }

    pub fn has_held(&self, url: &str) -> bool {
        self.workers
            .iter()
            .any(|w| w.held_url.as_deref() == Some(url))
    }

    pub fn remove(&mut self, pid: Pid) -> Option<IdleWorker<C>> {
        let index = self.workers.iter().position(|w| w.pid == pid)?;
        Some(self.workers.remove(index))
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.workers.iter().any(|w| w.pid == pid)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IdleWorker<C>> {
        self.workers.iter()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Evict workers idle longer than the ceiling, except the first worker of
    /// the keep-one protocol.
    pub fn sweep(&mut self, now: Instant) -> Vec<IdleWorker<C>> {
        let mut kept_one = false;
        let mut evicted = Vec::new();
        let mut survivors = Vec::with_capacity(self.workers.len());
        for worker in self.workers.drain(..) {
            if !kept_one && self.keep_one.as_deref() == Some(worker.key.protocol.as_str()) {
                kept_one = true;
                survivors.push(worker);
            } else if worker.idle_for(now) > self.max_idle {
                debug!("worker {} idle too long, evicting", worker.pid);
                evicted.push(worker);
            } else {
                survivors.push(worker);
            }
        }
        self.workers = survivors;
        evicted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Recorded(Vec<String>);

    impl WorkerConnection for Recorded {
        fn hand_over(&mut self, app_socket: &str) -> Result<()> {
            self.0.push(app_socket.to_string());
            Ok(())
        }
    }

    fn worker(pid: i32, protocol: &str, host: &str) -> IdleWorker<Recorded> {
        IdleWorker::new(
            Pid::from_raw(pid),
            CapabilityKey::new(protocol, host),
            Recorded::default(),
        )
    }

    fn pool() -> WorkerPool<Recorded> {
        WorkerPool::new(Duration::from_secs(30), Some("file".to_string()))
    }

    #[test]
    fn hostless_worker_serves_hostless_request() {
        let mut pool = pool();
        pool.register(worker(1, "http", "example.com"));
        pool.register(worker(2, "http", ""));

        let matched = pool.take_match("http", "").unwrap();
        assert_eq!(matched.pid, Pid::from_raw(2));
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn exact_host_wins_over_hostless() {
        let mut pool = pool();
        pool.register(worker(2, "http", ""));
        pool.register(worker(1, "http", "example.com"));

        let matched = pool.take_match("http", "example.com").unwrap();
        assert_eq!(matched.pid, Pid::from_raw(1));
        // Falls back to the hostless worker once the exact one is gone
        assert_eq!(
            pool.take_match("http", "example.com").unwrap().pid,
            Pid::from_raw(2)
        );
        assert!(pool.take_match("http", "example.com").is_none());
    }

    #[test]
    fn wildcard_class_is_the_last_resort() {
        let mut pool = pool();
        pool.register(worker(3, ANY_PROTOCOL, ""));
        pool.register(worker(4, "ftp", "other.org"));

        assert_eq!(pool.take_match("ftp", "").unwrap().pid, Pid::from_raw(3));
        assert!(pool.take_match("ftp", "").is_none());
    }

    #[test]
    fn held_workers_only_go_to_their_url() {
        let mut pool = pool();
        pool.register(worker(5, "http", "").held_for("http://example.com/a"));

        assert!(pool.take_match("http", "").is_none());
        assert!(pool.has_held("http://example.com/a"));
        assert!(!pool.has_held("http://example.com/b"));
        assert_eq!(
            pool.take_held("http://example.com/a").unwrap().pid,
            Pid::from_raw(5)
        );
        assert!(pool.is_empty());
    }

    #[test]
    fn temp_auth_worker_is_not_pooled() {
        let mut pool = pool();
        pool.register(worker(6, "sftp", ""));
        let evicted = pool.register(worker(6, "sftp", "").temp_auth(true));
        assert_eq!(evicted.map(|w| w.pid), Some(Pid::from_raw(6)));
        assert!(pool.is_empty());
    }

    #[test]
    fn reregistering_replaces_the_old_entry() {
        let mut pool = pool();
        pool.register(worker(7, "http", ""));
        pool.register(worker(7, "http", "example.com"));
        assert_eq!(pool.len(), 1);
        assert_eq!(
            pool.iter().next().unwrap().key.host.as_deref(),
            Some("example.com")
        );
    }

    #[test]
    fn sweep_keeps_one_file_worker() {
        let mut pool = pool();
        let long_ago = Instant::now();
        for (pid, protocol) in [(1, "file"), (2, "file"), (3, "http")] {
            let mut w = worker(pid, protocol, "");
            w.last_used = long_ago;
            pool.register(w);
        }
        let mut fresh = worker(4, "http", "");
        fresh.last_used = long_ago + Duration::from_secs(40);
        pool.register(fresh);

        let now = long_ago + Duration::from_secs(45);
        let evicted: Vec<_> = pool.sweep(now).into_iter().map(|w| w.pid.as_raw()).collect();
        assert_eq!(evicted, [2, 3]);
        let left: Vec<_> = pool.iter().map(|w| w.pid.as_raw()).collect();
        assert_eq!(left, [1, 4]);

        assert!(pool.sweep(now).is_empty());
    }

    #[test]
    fn matched_worker_can_be_handed_over() {
        let mut pool = pool();
        pool.register(worker(8, "http", ""));
        let mut matched = pool.take_match("http", "").unwrap();
        matched.connection.hand_over("/tmp/app.sock").unwrap();
        assert_eq!(matched.connection.0, ["/tmp/app.sock"]);
        assert!(!pool.contains(Pid::from_raw(8)));
    }
}
