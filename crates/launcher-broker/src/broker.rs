//! The broker: queues launches, serializes them through one spawner link,
//! tracks every request to completion and manages idle workers.

use std::path::Path;
use std::time::{Duration, Instant};

use launcher_core::util::is_startup_token;
use launcher_core::{LauncherError, LogNotifier, Result, StartupNotifier};
use launcher_proto::{ControlMessage, ExecRequest, command_name};
use log::{debug, info, warn};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::link::SpawnerLink;
use crate::pool::{IdleWorker, WorkerConnection, WorkerPool};
use crate::queue::RequestQueue;
use crate::registry::ServiceRegistry;
use crate::request::{ActivationPolicy, LaunchOutcome, LaunchRequest, Reply, RequestStatus};

/// Called with the worker's pid once it is idle again or gone
pub type WorkerWait = Box<dyn FnOnce(Pid)>;

/// Broker configuration, loadable from JSON
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Idle ceiling before a pooled worker is evicted
    pub worker_max_idle_secs: u64,
    /// Period of the eviction timer
    pub sweep_interval_secs: u64,
    /// Protocol of which one idle worker is always kept
    pub keep_one_protocol: Option<String>,
    /// Program started for a worker request nothing in the pool can serve
    pub worker_program: String,
    /// Workers launched for this protocol stop before exec for a debugger
    pub debug_wait_protocol: Option<String>,
    /// Prefix of service names derived from a binary name
    pub service_domain: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            worker_max_idle_secs: 30,
            sweep_interval_secs: 10,
            keep_one_protocol: Some("file".to_string()),
            worker_program: "launcher-worker".to_string(),
            debug_wait_protocol: None,
            service_domain: "org.kde".to_string(),
        }
    }
}

impl BrokerConfig {
    pub fn worker_max_idle(mut self, idle: Duration) -> Self {
        self.worker_max_idle_secs = idle.as_secs();
        self
    }

    pub fn sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    pub fn keep_one_protocol(mut self, protocol: Option<String>) -> Self {
        self.keep_one_protocol = protocol;
        self
    }

    pub fn worker_program(mut self, program: impl Into<String>) -> Self {
        self.worker_program = program.into();
        self
    }

    pub fn debug_wait_protocol(mut self, protocol: Option<String>) -> Self {
        self.debug_wait_protocol = protocol;
        self
    }

    pub fn service_domain(mut self, domain: impl Into<String>) -> Self {
        self.service_domain = domain.into();
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_interval_secs == 0 {
            return Err(LauncherError::InvalidConfig(
                "sweep interval must be non-zero".to_string(),
            ));
        }
        if self.worker_program.is_empty() {
            return Err(LauncherError::InvalidConfig(
                "worker program must not be empty".to_string(),
            ));
        }
        if self.service_domain.is_empty() || self.service_domain.ends_with('.') {
            return Err(LauncherError::InvalidConfig(format!(
                "invalid service domain '{}'",
                self.service_domain
            )));
        }
        Ok(())
    }
}

/// A service entry resolved to something runnable
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolvedCommand {
    pub program: String,
    pub args: Vec<String>,
    pub activation: ActivationPolicy,
    /// Name the program registers; derived from the binary when absent
    pub service_name: Option<String>,
    pub working_dir: Option<String>,
    /// The program accepts several urls in one invocation
    pub allow_multiple: bool,
}

impl ResolvedCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            ..Default::default()
        }
    }
}

/// What the spawner answered to one EXEC
type SpawnReply = std::result::Result<Pid, Option<String>>;

pub struct Broker<L, R, C> {
    config: BrokerConfig,
    link: L,
    registry: R,
    notifier: Box<dyn StartupNotifier>,
    queue: RequestQueue,
    /// Spawned requests still waiting for a registration or an exit
    in_flight: Vec<LaunchRequest>,
    pool: WorkerPool<C>,
    worker_waits: Vec<(Pid, WorkerWait)>,
    /// An EXEC is on the link and its reply has not arrived
    launch_pending: bool,
    /// Address new workers are told to register at
    pool_address: String,
}

impl<L, R, C> Broker<L, R, C>
where
    L: SpawnerLink,
    R: ServiceRegistry,
    C: WorkerConnection,
{
    pub fn new(config: BrokerConfig, link: L, registry: R) -> Result<Self> {
        config.validate()?;
        let pool = WorkerPool::new(
            Duration::from_secs(config.worker_max_idle_secs),
            config.keep_one_protocol.clone(),
        );
        Ok(Self {
            config,
            link,
            registry,
            notifier: Box::new(LogNotifier),
            queue: RequestQueue::new(),
            in_flight: Vec::new(),
            pool,
            worker_waits: Vec::new(),
            launch_pending: false,
            pool_address: String::new(),
        })
    }

    pub fn set_notifier(&mut self, notifier: Box<dyn StartupNotifier>) {
        self.notifier = notifier;
    }

    pub fn set_pool_address(&mut self, address: impl Into<String>) {
        self.pool_address = address.into();
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn link(&self) -> &L {
        &self.link
    }

    pub fn link_mut(&mut self) -> &mut L {
        &mut self.link
    }

    pub fn registry(&self) -> &R {
        &self.registry
    }

    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn idle_workers(&self) -> usize {
        self.pool.len()
    }

    pub fn is_launch_pending(&self) -> bool {
        self.launch_pending
    }

    /// Queue a request without dispatching it
    pub fn enqueue(&mut self, request: LaunchRequest) {
        debug!("queued {} ({} waiting)", request.program, self.queue.len() + 1);
        self.queue.push(request);
    }

    /// Queue a request and dispatch whatever the queue holds
    pub fn submit(&mut self, request: LaunchRequest) -> Result<()> {
        self.enqueue(request);
        self.process_queue()
    }

    /// Launch queued requests one at a time, oldest first. Does nothing while
    /// a launch is already waiting for its reply.
    pub fn process_queue(&mut self) -> Result<()> {
        if self.launch_pending {
            return Ok(());
        }
        while let Some(request) = self.queue.pop() {
            self.dispatch(request)?;
        }
        Ok(())
    }

    fn dispatch(&mut self, mut request: LaunchRequest) -> Result<()> {
        request.transition(RequestStatus::Launching);
        let reply = match self.launch_now(request.to_exec_request()) {
            Ok(reply) => reply,
            Err(e) => {
                request.on_spawn_failed(Some(e.to_string()));
                self.finish(request);
                return Err(e);
            }
        };
        match reply {
            Ok(pid) => request.on_spawned(pid),
            Err(reason) => request.on_spawn_failed(reason),
        }

        if request.status() == RequestStatus::Launching {
            self.in_flight.push(request);
        } else {
            self.finish(request);
        }
        Ok(())
    }

    /// Send one EXEC and wait for its reply. A request that cannot be
    /// encoded fails on its own and never reaches the link.
    fn launch_now(&mut self, exec: ExecRequest) -> Result<SpawnReply> {
        debug!("launching {} {:?}", exec.program, exec.args);
        let message = ControlMessage::Exec(exec);
        if let Err(e) = check_encodable(&message) {
            warn!("not launching: {}", e);
            return Ok(Err(Some(local_reason(e))));
        }

        self.launch_pending = true;
        let reply = self.exchange(&message);
        self.launch_pending = false;
        reply
    }

    fn exchange(&mut self, message: &ControlMessage) -> Result<SpawnReply> {
        self.link.send(message)?;
        self.await_spawn_reply()
    }

    /// Read the link until the outstanding EXEC is answered. Death notices
    /// arriving first are handled in order.
    fn await_spawn_reply(&mut self) -> Result<SpawnReply> {
        loop {
            match self.link.recv()? {
                ControlMessage::Spawned { pid } => return Ok(Ok(Pid::from_raw(pid))),
                ControlMessage::Error { message } => return Ok(Err(message)),
                ControlMessage::ChildDied { pid, status } => {
                    self.process_died(Pid::from_raw(pid), status)
                }
                other => warn!(
                    "ignoring {} while waiting for a launch reply",
                    command_name(other.command())
                ),
            }
        }
    }

    /// Handle one message the spawner sent outside a launch exchange
    pub fn on_link_readable(&mut self) -> Result<()> {
        match self.link.recv()? {
            ControlMessage::ChildDied { pid, status } => {
                self.process_died(Pid::from_raw(pid), status)
            }
            other => warn!(
                "unexpected {} from the spawner",
                command_name(other.command())
            ),
        }
        self.process_queue()
    }

    /// A process the spawner launched for us has terminated
    pub fn process_died(&mut self, pid: Pid, status: i32) {
        let Some(index) = self.in_flight.iter().position(|r| r.pid() == Some(pid)) else {
            debug!("death of untracked pid {} (status {})", pid, status);
            return;
        };
        let mut request = self.in_flight.remove(index);
        request.on_process_died(status, &self.registry);
        self.finish(request);
    }

    /// `name` changed owner. Completes every launching request waiting for it.
    pub fn service_registered(&mut self, name: &str, owner: &str) {
        if name.is_empty() || owner.is_empty() {
            return;
        }
        self.registry.owner_changed(name, owner);

        let mut index = 0;
        while index < self.in_flight.len() {
            if self.in_flight[index].on_service_registered(name, &self.registry) {
                let request = self.in_flight.remove(index);
                self.finish(request);
            } else {
                index += 1;
            }
        }
    }

    /// `name` lost its owner
    pub fn service_released(&mut self, name: &str) {
        self.registry.owner_changed(name, "");
    }

    fn finish(&mut self, request: LaunchRequest) -> LaunchOutcome {
        if request.status() == RequestStatus::Error {
            if let Some(token) = request.startup_token.as_deref() {
                self.notifier.notify_startup_end(token, None);
            }
        }
        request.finish()
    }

    /// Launch immediately, bypassing the queue, and forget the request
    pub fn exec_blind(
        &mut self,
        program: &str,
        args: Vec<String>,
        env: Vec<String>,
        startup_token: &str,
    ) -> Result<LaunchOutcome> {
        let mut request = LaunchRequest::new(program, args)
            .env(env)
            .startup_token(startup_token);
        request.transition(RequestStatus::Launching);
        let reply = match self.launch_now(request.to_exec_request()) {
            Ok(reply) => reply,
            Err(e) => {
                request.on_spawn_failed(Some(e.to_string()));
                self.finish(request);
                return Err(e);
            }
        };
        match reply {
            Ok(pid) => request.on_spawned(pid),
            Err(reason) => request.on_spawn_failed(reason),
        }
        Ok(self.finish(request))
    }

    /// Launch a plain program. With `wait` the reply comes when it exits.
    #[allow(clippy::too_many_arguments)]
    pub fn exec(
        &mut self,
        program: &str,
        args: Vec<String>,
        cwd: &str,
        env: Vec<String>,
        startup_token: &str,
        wait: bool,
        reply: Reply,
    ) -> Result<()> {
        let request = LaunchRequest::new(program, args)
            .env(env)
            .cwd(cwd)
            .startup_token(startup_token)
            .wait(wait)
            .reply(reply);
        self.submit(request)
    }

    /// Launch a resolved service for `urls`.
    ///
    /// A command that cannot take several urls is started once per url; only
    /// the first instance is reported through `reply`. `blind` drops the reply.
    pub fn start_service(
        &mut self,
        command: &ResolvedCommand,
        urls: &[String],
        env: Vec<String>,
        startup_token: &str,
        blind: bool,
        reply: Option<Reply>,
    ) -> Result<()> {
        if command.program.is_empty() {
            if is_startup_token(startup_token) {
                self.notifier.notify_startup_end(startup_token, None);
            }
            let outcome = LaunchOutcome::failure("", Some("service has no program"));
            if let Some(reply) = reply.filter(|_| !blind) {
                reply(outcome);
            }
            return Ok(());
        }

        let urls = if urls.len() > 1 && !command.allow_multiple {
            for url in &urls[1..] {
                // A startup token cannot be reused across instances
                self.start_service(
                    command,
                    std::slice::from_ref(url),
                    env.clone(),
                    "0",
                    true,
                    None,
                )?;
            }
            &urls[..1]
        } else {
            urls
        };

        let mut args = command.args.clone();
        args.extend(urls.iter().cloned());

        let cwd = command
            .working_dir
            .clone()
            .filter(|d| !d.is_empty())
            .or_else(|| urls.first().and_then(|url| parent_of_local_file(url)))
            .unwrap_or_default();

        let mut request = LaunchRequest::new(command.program.clone(), args)
            .env(env)
            .cwd(cwd)
            .startup_token(startup_token);

        if command.activation.expects_registration() {
            match command.service_name.as_deref().filter(|n| !n.is_empty()) {
                Some(name) => {
                    request = request.activation(command.activation, Some(name.to_string()));
                }
                None => {
                    let bin = binary_name(&command.program);
                    let derived = format!("{}.{}", self.config.service_domain, bin);
                    request = request
                        .activation(command.activation, Some(derived))
                        .tolerant_name(format!("*.{}", bin));
                }
            }
        }

        if let Some(reply) = reply.filter(|_| !blind) {
            request = request.reply(reply);
        }
        info!(
            "starting service {} ({:?})",
            command.program, command.activation
        );
        self.submit(request)
    }

    /// Set a variable in the spawner's launch environment
    pub fn set_launch_env(&mut self, name: &str, value: &str) -> Result<()> {
        let message = ControlMessage::SetEnv {
            name: name.to_string(),
            value: value.to_string(),
        };
        check_encodable(&message)?;
        self.link.send(&message)
    }

    pub fn terminate_spawner(&mut self) -> Result<()> {
        info!("asking the spawner to terminate");
        self.link.send(&ControlMessage::Terminate)
    }

    /// Hand an idle worker for `protocol` on `host` to `app_socket`, or launch
    /// a fresh one that will connect there itself. Returns the worker's pid.
    pub fn request_worker(&mut self, protocol: &str, host: &str, app_socket: &str) -> Result<Pid> {
        while let Some(mut worker) = self.pool.take_match(protocol, host) {
            match worker.connection.hand_over(app_socket) {
                Ok(()) => {
                    debug!("reusing worker {} for {}", worker.pid, protocol);
                    return Ok(worker.pid);
                }
                Err(e) => warn!("idle worker {} unusable: {}", worker.pid, e),
            }
        }

        if self.config.debug_wait_protocol.as_deref() == Some(protocol) {
            info!("next {} worker will stop before exec", protocol);
            self.link.send(&ControlMessage::DebugWait)?;
        }

        let program = self.config.worker_program.clone();
        let exec = ExecRequest::new(
            program.clone(),
            vec![
                protocol.to_string(),
                self.pool_address.clone(),
                app_socket.to_string(),
            ],
        );
        match self.launch_now(exec)? {
            Ok(pid) => Ok(pid),
            Err(reason) => {
                let mut message = format!("error loading '{}'", program);
                if let Some(reason) = reason {
                    message.push_str(": ");
                    message.push_str(&reason);
                }
                Err(LauncherError::ExecFailed(message))
            }
        }
    }

    /// Hand the worker held for `url` to `app_socket`
    pub fn request_held_worker(&mut self, url: &str, app_socket: &str) -> Option<Pid> {
        let mut worker = self.pool.take_held(url)?;
        match worker.connection.hand_over(app_socket) {
            Ok(()) => Some(worker.pid),
            Err(e) => {
                warn!("held worker {} unusable: {}", worker.pid, e);
                None
            }
        }
    }

    pub fn has_held_worker(&self, url: &str) -> bool {
        self.pool.has_held(url)
    }

    /// Call `reply` once worker `pid` is idle. Immediate if it already is.
    pub fn wait_for_worker(&mut self, pid: Pid, reply: WorkerWait) {
        if self.pool.contains(pid) {
            reply(pid);
        } else {
            self.worker_waits.push((pid, reply));
        }
    }

    fn answer_worker_waits(&mut self, pid: Pid) {
        let (ready, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.worker_waits)
            .into_iter()
            .partition(|(waited, _)| *waited == pid);
        self.worker_waits = waiting;
        for (_, reply) in ready {
            reply(pid);
        }
    }

    /// A worker reported itself idle. Returns its pid when it was evicted
    /// instead of pooled.
    pub fn worker_idle(&mut self, worker: IdleWorker<C>) -> Option<Pid> {
        let pid = worker.pid;
        let evicted = self.pool.register(worker).map(|w| w.pid);
        self.answer_worker_waits(pid);
        evicted
    }

    /// A worker's connection closed
    pub fn worker_gone(&mut self, pid: Pid) {
        if self.pool.remove(pid).is_some() {
            debug!("idle worker {} gone", pid);
        }
        self.answer_worker_waits(pid);
        if self.pool.is_empty() {
            debug!("worker pool empty, eviction timer disarmed");
        }
    }

    /// Evict workers idle past the ceiling. Returns their pids.
    pub fn sweep_idle(&mut self, now: Instant) -> Vec<Pid> {
        self.pool.sweep(now).into_iter().map(|w| w.pid).collect()
    }

    /// The eviction timer only runs while there is something to evict
    pub fn timer_armed(&self) -> bool {
        !self.pool.is_empty()
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.config.sweep_interval_secs)
    }
}

/// Encode `message` without sending it. Whatever the encoder refuses is a
/// fault of the request, not of the spawner link.
fn check_encodable(message: &ControlMessage) -> Result<()> {
    match message.encode() {
        Ok(_) => Ok(()),
        Err(LauncherError::Protocol(reason)) => Err(LauncherError::InvalidConfig(reason)),
        Err(e) => Err(e),
    }
}

fn local_reason(err: LauncherError) -> String {
    match err {
        LauncherError::InvalidConfig(reason) => reason,
        other => other.to_string(),
    }
}

/// Parent directory of `url` when it names a local file
fn parent_of_local_file(url: &str) -> Option<String> {
    let path = url.strip_prefix("file://").unwrap_or(url);
    if !path.starts_with('/') {
        return None;
    }
    Path::new(path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
}

/// Last path component of `program`
fn binary_name(program: &str) -> &str {
    program.rsplit('/').next().unwrap_or(program)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_file_parent_directory() {
        assert_eq!(
            parent_of_local_file("/home/u/doc.txt").as_deref(),
            Some("/home/u")
        );
        assert_eq!(
            parent_of_local_file("file:///tmp/a.png").as_deref(),
            Some("/tmp")
        );
        assert_eq!(parent_of_local_file("http://example.com/a"), None);
    }

    #[test]
    fn binary_name_strips_directories() {
        assert_eq!(binary_name("/usr/bin/kate"), "kate");
        assert_eq!(binary_name("kate"), "kate");
    }

    #[test]
    fn config_defaults_and_validation() {
        let config = BrokerConfig::default();
        assert_eq!(config.worker_max_idle_secs, 30);
        assert_eq!(config.sweep_interval_secs, 10);
        assert_eq!(config.keep_one_protocol.as_deref(), Some("file"));
        assert!(config.validate().is_ok());

        assert!(config.clone().sweep_interval(Duration::ZERO).validate().is_err());
        assert!(config.clone().worker_program("").validate().is_err());
        assert!(config.service_domain("org.").validate().is_err());
    }

    #[test]
    fn config_loads_partial_json() {
        let config: BrokerConfig =
            serde_json::from_str(r#"{"worker_program": "/usr/lib/worker", "sweep_interval_secs": 5}"#)
                .unwrap();
        assert_eq!(config.worker_program, "/usr/lib/worker");
        assert_eq!(config.sweep_interval_secs, 5);
        assert_eq!(config.worker_max_idle_secs, 30);
    }
}
