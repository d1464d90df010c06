//! The broker server loop
//!
//! One thread waits on the spawner link, the caller socket, the worker socket
//! and every connected worker. The idle-worker sweep runs off the wait timeout
//! and only while the pool holds somebody.

pub mod caller;
pub mod worker;

use std::collections::HashMap;
use std::fs;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use launcher_broker::{Broker, BrokerConfig, LocalRegistry, SpawnerLink};
use launcher_core::poll::wait_readable;
use launcher_core::socket::{accept_pending, bind_private_socket};
use launcher_core::util::default_socket_path;
use launcher_core::{LauncherError, Result};
use launcher_proto::ControlMessage;
use launcher_spawner::LoopControl;
use log::{debug, info, warn};
use nix::unistd::Pid;

pub use caller::{CallerReply, CallerRequest};
pub use worker::{WorkerHandle, WorkerLine, WorkerPeer};

use caller::{read_request, reply_to, write_reply};
use worker::parse_line;

/// Name of the caller socket inside the runtime directory
pub const BROKER_SOCKET_NAME: &str = "broker";

/// Name of the worker registration socket inside the runtime directory
pub const WORKER_SOCKET_NAME: &str = "workers";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub caller_socket: PathBuf,
    pub worker_socket: PathBuf,
    /// Read timeout for a caller's request line
    pub client_timeout: Duration,
    pub broker: BrokerConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let fallback = |name: &str| {
            default_socket_path(name).unwrap_or_else(|_| {
                std::env::temp_dir()
                    .join(launcher_core::util::SOCKET_DIR)
                    .join(name)
            })
        };
        Self {
            caller_socket: fallback(BROKER_SOCKET_NAME),
            worker_socket: fallback(WORKER_SOCKET_NAME),
            client_timeout: Duration::from_secs(5),
            broker: BrokerConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Both sockets inside `dir`
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            caller_socket: dir.join(BROKER_SOCKET_NAME),
            worker_socket: dir.join(WORKER_SOCKET_NAME),
            ..Default::default()
        }
    }

    pub fn broker(mut self, broker: BrokerConfig) -> Self {
        self.broker = broker;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for path in [&self.caller_socket, &self.worker_socket] {
            let len = path.as_os_str().len();
            if len == 0 || len >= 108 {
                return Err(LauncherError::InvalidConfig(format!(
                    "socket path must be 1..107 bytes: {}",
                    path.display()
                )));
            }
        }
        if self.caller_socket == self.worker_socket {
            return Err(LauncherError::InvalidConfig(
                "caller and worker sockets must differ".to_string(),
            ));
        }
        self.broker.validate()
    }
}

/// Broker plus the sockets it serves. Socket files are removed on drop.
pub struct BrokerServer<L: SpawnerLink + AsRawFd> {
    config: ServerConfig,
    broker: Broker<L, LocalRegistry, WorkerHandle>,
    callers: UnixListener,
    workers: UnixListener,
    peers: HashMap<RawFd, WorkerPeer>,
    next_sweep: Option<Instant>,
    terminating: bool,
}

impl<L: SpawnerLink + AsRawFd> BrokerServer<L> {
    /// Bind both sockets and greet the spawner
    pub fn new(config: ServerConfig, mut link: L) -> Result<Self> {
        config.validate()?;
        link.send(&ControlMessage::Ready)?;

        let mut broker = Broker::new(config.broker.clone(), link, LocalRegistry::new())?;
        broker.set_pool_address(config.worker_socket.to_string_lossy());

        let callers = bind_private_socket(&config.caller_socket)?;
        let workers = match bind_private_socket(&config.worker_socket) {
            Ok(listener) => listener,
            Err(e) => {
                let _ = fs::remove_file(&config.caller_socket);
                return Err(e);
            }
        };
        info!(
            "broker serving callers on {} and workers on {}",
            config.caller_socket.display(),
            config.worker_socket.display()
        );

        Ok(Self {
            config,
            broker,
            callers,
            workers,
            peers: HashMap::new(),
            next_sweep: None,
            terminating: false,
        })
    }

    pub fn broker(&self) -> &Broker<L, LocalRegistry, WorkerHandle> {
        &self.broker
    }

    pub fn caller_socket(&self) -> &Path {
        &self.config.caller_socket
    }

    pub fn worker_socket(&self) -> &Path {
        &self.config.worker_socket
    }

    pub fn connected_workers(&self) -> usize {
        self.peers.len()
    }

    /// Whether the eviction timer is armed
    pub fn sweep_due(&self) -> Option<Instant> {
        self.next_sweep
    }

    /// Serve until a caller asks for termination or the spawner link breaks
    pub fn run(&mut self) -> Result<()> {
        while self.poll_once(None)? == LoopControl::Continue {}
        info!("broker exiting");
        Ok(())
    }

    /// One loop iteration, waiting at most `max_wait` for something to happen
    pub fn poll_once(&mut self, max_wait: Option<Duration>) -> Result<LoopControl> {
        if self.terminating {
            return Ok(LoopControl::Finished);
        }

        let now = Instant::now();
        let timeout = match (self.timer_timeout(now), max_wait) {
            (Some(timer), Some(max)) => Some(timer.min(max)),
            (timer, max) => timer.or(max),
        };

        let mut fds = vec![
            self.broker.link().as_raw_fd(),
            self.callers.as_raw_fd(),
            self.workers.as_raw_fd(),
        ];
        let peer_fds: Vec<RawFd> = self.peers.keys().copied().collect();
        fds.extend(&peer_fds);

        let ready = wait_readable(&fds, timeout)?;

        if ready[0] {
            if let Err(e) = self.broker.on_link_readable() {
                if e.is_fatal_for_broker() {
                    warn!("spawner link lost: {}", e);
                    return Err(e);
                }
                warn!("spawner link: {}", e);
            }
        }
        for (fd, readable) in peer_fds.iter().zip(&ready[3..]) {
            if *readable {
                self.service_worker(*fd);
            }
        }
        if ready[2] {
            self.accept_workers();
        }
        if ready[1] {
            self.accept_callers()?;
        }

        self.run_timer(Instant::now());
        Ok(if self.terminating {
            LoopControl::Finished
        } else {
            LoopControl::Continue
        })
    }

    fn timer_timeout(&mut self, now: Instant) -> Option<Duration> {
        if !self.broker.timer_armed() {
            if self.next_sweep.take().is_some() {
                debug!("worker pool empty, eviction timer stopped");
            }
            return None;
        }
        let interval = self.broker.sweep_interval();
        let due = *self.next_sweep.get_or_insert(now + interval);
        Some(due.saturating_duration_since(now))
    }

    fn run_timer(&mut self, now: Instant) {
        let Some(due) = self.next_sweep else {
            if self.broker.timer_armed() {
                self.next_sweep = Some(now + self.broker.sweep_interval());
            }
            return;
        };
        if now < due {
            return;
        }
        for pid in self.broker.sweep_idle(now) {
            self.drop_worker(pid);
        }
        self.next_sweep = self
            .broker
            .timer_armed()
            .then(|| now + self.broker.sweep_interval());
    }

    fn accept_workers(&mut self) {
        loop {
            match accept_pending(&self.workers) {
                Ok(Some(stream)) => match WorkerPeer::new(stream) {
                    Ok(peer) => {
                        debug!("worker connected");
                        self.peers.insert(peer.as_raw_fd(), peer);
                    }
                    Err(e) => warn!("worker connection: {}", e),
                },
                Ok(None) => return,
                Err(e) => {
                    warn!("accept on worker socket failed: {}", e);
                    return;
                }
            }
        }
    }

    fn service_worker(&mut self, fd: RawFd) {
        let Some(peer) = self.peers.get_mut(&fd) else {
            return;
        };
        let lines = match peer.read_lines() {
            Ok(Some(lines)) => lines,
            Ok(None) => return self.close_peer(fd),
            Err(e) => {
                warn!("worker connection: {}", e);
                return self.close_peer(fd);
            }
        };

        for line in lines {
            let parsed = match parse_line(&line) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("{}", e);
                    continue;
                }
            };
            let Some(peer) = self.peers.get_mut(&fd) else {
                return;
            };
            match peer.apply(parsed) {
                Ok(Some(idle)) => {
                    if let Some(evicted) = self.broker.worker_idle(idle) {
                        self.drop_worker(evicted);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!("worker connection: {}", e);
                    return self.close_peer(fd);
                }
            }
        }
    }

    /// Forget a worker whose connection ended
    fn close_peer(&mut self, fd: RawFd) {
        let Some(peer) = self.peers.remove(&fd) else {
            return;
        };
        peer.disconnect();
        match peer.pid {
            Some(pid) => {
                debug!("worker {} disconnected", pid);
                self.broker.worker_gone(pid);
            }
            None => debug!("unregistered worker disconnected"),
        }
    }

    /// Close the connection of an evicted worker so it exits
    fn drop_worker(&mut self, pid: Pid) {
        let fds: Vec<RawFd> = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.pid == Some(pid))
            .map(|(fd, _)| *fd)
            .collect();
        for fd in fds {
            if let Some(peer) = self.peers.remove(&fd) {
                debug!("closing evicted worker {}", pid);
                peer.disconnect();
            }
        }
    }

    fn accept_callers(&mut self) -> Result<()> {
        loop {
            match accept_pending(&self.callers) {
                Ok(Some(stream)) => self.serve_caller(stream)?,
                Ok(None) => return Ok(()),
                Err(e) => {
                    warn!("accept on caller socket failed: {}", e);
                    return Ok(());
                }
            }
            if self.terminating {
                return Ok(());
            }
        }
    }

    /// Handle one caller connection. Only a broken spawner link is an error.
    fn serve_caller(&mut self, mut stream: UnixStream) -> Result<()> {
        if let Err(e) = stream.set_read_timeout(Some(self.config.client_timeout)) {
            debug!("caller read timeout: {}", e);
        }
        let request = match read_request(&stream) {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!("caller disconnected without a request");
                return Ok(());
            }
            Err(e) => {
                warn!("bad caller request: {}", e);
                send(&mut stream, CallerReply::Failed {
                    message: e.to_string(),
                });
                return Ok(());
            }
        };
        debug!("caller request {:?}", request);

        // Deferred requests are answered by the broker even when they fail
        let deferred = matches!(
            request,
            CallerRequest::Exec { .. } | CallerRequest::StartService { blind: false, .. }
        );
        match self.dispatch(request, &stream) {
            Ok(Some(reply)) => send(&mut stream, reply),
            Ok(None) => {}
            Err(e) => {
                if !deferred {
                    send(&mut stream, CallerReply::Failed {
                        message: e.to_string(),
                    });
                }
                if e.is_fatal_for_broker() {
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Run one request. `None` means the reply is written later by the broker.
    fn dispatch(&mut self, request: CallerRequest, stream: &UnixStream) -> Result<Option<CallerReply>> {
        match request {
            CallerRequest::Exec {
                program,
                args,
                cwd,
                env,
                startup_token,
                wait,
            } => {
                let reply = reply_to(stream)?;
                self.broker
                    .exec(&program, args, &cwd, env, &startup_token, wait, reply)?;
                Ok(None)
            }
            CallerRequest::ExecBlind {
                program,
                args,
                env,
                startup_token,
            } => {
                let outcome = self.broker.exec_blind(&program, args, env, &startup_token)?;
                Ok(Some(CallerReply::Outcome(outcome)))
            }
            CallerRequest::StartService {
                command,
                urls,
                env,
                startup_token,
                blind,
            } => {
                let reply = if blind { None } else { Some(reply_to(stream)?) };
                self.broker
                    .start_service(&command, &urls, env, &startup_token, blind, reply)?;
                Ok(blind.then_some(CallerReply::Done))
            }
            CallerRequest::ServiceRegistered { name, owner } => {
                if owner.is_empty() {
                    self.broker.service_released(&name);
                } else {
                    self.broker.service_registered(&name, &owner);
                }
                Ok(Some(CallerReply::Done))
            }
            CallerRequest::RequestWorker {
                protocol,
                host,
                app_socket,
            } => {
                let pid = self.broker.request_worker(&protocol, &host, &app_socket)?;
                Ok(Some(CallerReply::Worker { pid: pid.as_raw() }))
            }
            CallerRequest::SetEnv { name, value } => {
                self.broker.set_launch_env(&name, &value)?;
                Ok(Some(CallerReply::Done))
            }
            CallerRequest::Terminate => {
                self.terminating = true;
                self.broker.terminate_spawner()?;
                Ok(Some(CallerReply::Done))
            }
        }
    }
}

impl<L: SpawnerLink + AsRawFd> Drop for BrokerServer<L> {
    fn drop(&mut self) {
        for path in [&self.config.caller_socket, &self.config.worker_socket] {
            if let Err(e) = fs::remove_file(path) {
                debug!("could not remove {}: {}", path.display(), e);
            }
        }
    }
}

fn send(stream: &mut UnixStream, reply: CallerReply) {
    if let Err(e) = write_reply(stream, &reply) {
        debug!("caller went away: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = ServerConfig::default();
        assert!(config.caller_socket.ends_with(BROKER_SOCKET_NAME));
        assert!(config.worker_socket.ends_with(WORKER_SOCKET_NAME));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn same_socket_twice_is_rejected() {
        let mut config = ServerConfig::in_dir(Path::new("/tmp"));
        config.worker_socket = config.caller_socket.clone();
        assert!(matches!(
            config.validate(),
            Err(LauncherError::InvalidConfig(_))
        ));
    }
}
