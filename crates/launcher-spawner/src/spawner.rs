//! The spawner event loop
//!
//! One thread, one blocking point: a readiness wait over the death pipe, the
//! control socket and the broker link. Each iteration drains the death pipe and
//! reaps before waiting again, so a SIGCHLD that lands between two waits is
//! never lost.

use std::os::fd::AsRawFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

use launcher_core::poll::wait_readable;
use launcher_core::util::default_socket_path;
use launcher_core::{LauncherError, LogNotifier, Result, StartupNotifier};
use launcher_proto::{ControlMessage, ExecRequest, command_name, read_message, write_message};
use log::{debug, error, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;

use crate::children::ChildRegistry;
use crate::exec::{ExecConfig, ExecHandshake, ExecOutcome, ProtectionHandshake};
use crate::signals::{DeathPipe, reap_terminated};
use crate::socket::ControlSocket;

/// Name of the spawner socket inside the runtime directory
pub const SPAWNER_SOCKET_NAME: &str = "spawner";

/// Argument prefix telling a supervised broker which inherited fd is its link
pub const BROKER_FD_ARG: &str = "--fd=";

/// Program the spawner starts and supervises as its broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Spawner configuration
#[derive(Debug, Clone)]
pub struct SpawnerConfig {
    /// Control socket location
    pub socket_path: PathBuf,
    /// How long a previous spawner gets to exit after being told to terminate
    pub probe_grace: Duration,
    /// Read timeout for one-shot client requests
    pub client_timeout: Duration,
    /// Broker to launch over a socketpair and restart when it dies
    pub broker: Option<BrokerCommand>,
}

impl Default for SpawnerConfig {
    fn default() -> Self {
        let socket_path = default_socket_path(SPAWNER_SOCKET_NAME).unwrap_or_else(|_| {
            std::env::temp_dir()
                .join(launcher_core::util::SOCKET_DIR)
                .join(SPAWNER_SOCKET_NAME)
        });
        Self {
            socket_path,
            probe_grace: Duration::from_secs(1),
            client_timeout: Duration::from_secs(5),
            broker: None,
        }
    }
}

impl SpawnerConfig {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: socket_path.into(),
            ..Default::default()
        }
    }

    pub fn probe_grace(mut self, grace: Duration) -> Self {
        self.probe_grace = grace;
        self
    }

    pub fn client_timeout(mut self, timeout: Duration) -> Self {
        self.client_timeout = timeout;
        self
    }

    pub fn broker(mut self, program: impl Into<String>, args: Vec<String>) -> Self {
        self.broker = Some(BrokerCommand {
            program: program.into(),
            args,
        });
        self
    }

    pub fn validate(&self) -> Result<()> {
        // sun_path holds 108 bytes including the terminator
        let len = self.socket_path.as_os_str().len();
        if len == 0 || len >= 108 {
            return Err(LauncherError::InvalidConfig(format!(
                "socket path must be 1..107 bytes: {}",
                self.socket_path.display()
            )));
        }
        if self.client_timeout.is_zero() {
            return Err(LauncherError::InvalidConfig(
                "client timeout must be non-zero".to_string(),
            ));
        }
        if let Some(broker) = &self.broker {
            if broker.program.is_empty() {
                return Err(LauncherError::InvalidConfig(
                    "broker program must not be empty".to_string(),
                ));
            }
        }
        Ok(())
    }
}

/// Whether the loop should keep going
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopControl {
    Continue,
    /// Shutdown requested and the last child has been reaped
    Finished,
}

#[derive(Debug)]
struct BrokerLink {
    stream: UnixStream,
    pid: Option<Pid>,
    /// The broker has sent its empty OK
    ready: bool,
}

/// All spawner state, owned by the event loop
pub struct SpawnerState<N: StartupNotifier = LogNotifier> {
    config: SpawnerConfig,
    socket: Option<ControlSocket>,
    broker: Option<BrokerLink>,
    children: ChildRegistry<UnixStream>,
    death_pipe: DeathPipe,
    /// SETENV overrides applied under every later launch
    launch_env: Vec<String>,
    debug_wait: bool,
    notifier: N,
    protection: Option<Box<dyn ProtectionHandshake>>,
}

impl SpawnerState<LogNotifier> {
    pub fn new(config: SpawnerConfig) -> Result<Self> {
        Self::with_notifier(config, LogNotifier)
    }
}

impl<N: StartupNotifier> SpawnerState<N> {
    /// Install the SIGCHLD pipe and take over the control socket
    pub fn with_notifier(config: SpawnerConfig, notifier: N) -> Result<Self> {
        config.validate()?;
        let death_pipe = DeathPipe::install()?;
        let socket = ControlSocket::bind(&config.socket_path, config.probe_grace)?;
        info!("spawner listening on {}", socket.path().display());

        Ok(Self {
            config,
            socket: Some(socket),
            broker: None,
            children: ChildRegistry::new(),
            death_pipe,
            launch_env: Vec::new(),
            debug_wait: false,
            notifier,
            protection: None,
        })
    }

    pub fn set_protection(&mut self, protection: Box<dyn ProtectionHandshake>) {
        self.protection = Some(protection);
    }

    pub fn socket_path(&self) -> &Path {
        &self.config.socket_path
    }

    pub fn child_count(&self) -> usize {
        self.children.len()
    }

    /// Whether shutdown has started (the control socket is closed)
    pub fn is_shutting_down(&self) -> bool {
        self.socket.is_none()
    }

    pub fn launch_env(&self) -> &[String] {
        &self.launch_env
    }

    pub fn notifier(&self) -> &N {
        &self.notifier
    }

    /// Use `stream` as the broker link. The broker must send an empty OK before
    /// its link may be lost without taking the spawner down.
    pub fn attach_broker(&mut self, stream: UnixStream, pid: Option<Pid>) {
        self.broker = Some(BrokerLink {
            stream,
            pid,
            ready: false,
        });
    }

    /// Launch the configured broker with one end of a socketpair as `--fd=N`
    pub fn start_broker(&mut self) -> Result<Pid> {
        let command = self.config.broker.clone().ok_or_else(|| {
            LauncherError::InvalidConfig("no broker command configured".to_string())
        })?;
        let (ours, theirs) = UnixStream::pair()?;
        let fd = theirs.as_raw_fd();

        let mut args = command.args.clone();
        args.push(format!("{}{}", BROKER_FD_ARG, fd));
        let config = ExecConfig {
            program: command.program.clone(),
            args,
            env: self.launch_env.clone(),
            inherit_fds: vec![fd],
            ..Default::default()
        };

        let outcome = self.handshake().run(&config);
        match outcome {
            ExecOutcome::Spawned(pid) => {
                info!("started broker {} as pid {}", command.program, pid);
                self.attach_broker(ours, Some(pid));
                Ok(pid)
            }
            ExecOutcome::Failed(mut failure) => {
                failure.message = format!("broker {}: {}", command.program, failure.message);
                Err(failure.into())
            }
        }
    }

    /// Run until shutdown completes
    pub fn run(&mut self) -> Result<()> {
        while self.poll_once(None)? == LoopControl::Continue {}
        info!("spawner exiting");
        Ok(())
    }

    /// One loop iteration: reap, wait for readiness (at most `timeout`), dispatch.
    pub fn poll_once(&mut self, timeout: Option<Duration>) -> Result<LoopControl> {
        self.reap_children();
        if self.is_finished() {
            return Ok(LoopControl::Finished);
        }

        let mut fds = vec![self.death_pipe.read_fd()];
        let socket_slot = self.socket.as_ref().map(|s| {
            fds.push(s.as_raw_fd());
            fds.len() - 1
        });
        let broker_slot = self.broker.as_ref().map(|b| {
            fds.push(b.stream.as_raw_fd());
            fds.len() - 1
        });

        let ready = wait_readable(&fds, timeout)?;

        if broker_slot.is_some_and(|i| ready[i]) {
            self.service_broker()?;
        }
        if socket_slot.is_some_and(|i| ready[i]) {
            self.accept_clients();
        }

        self.reap_children();
        Ok(if self.is_finished() {
            LoopControl::Finished
        } else {
            LoopControl::Continue
        })
    }

    /// Run one exec handshake for `request`, with startup notification around it
    pub fn launch(&mut self, request: &ExecRequest) -> ExecOutcome {
        let mut config = ExecConfig::from_request(request, &self.launch_env);
        config.suspend_before_exec = std::mem::take(&mut self.debug_wait);

        if let Some(token) = request.startup_token.as_deref() {
            self.notifier.notify_startup_begin(token, &request.program);
        }

        let outcome = self.handshake().run(&config);
        match &outcome {
            ExecOutcome::Spawned(pid) => info!("launched {} as pid {}", request.program, pid),
            ExecOutcome::Failed(failure) => {
                warn!("could not launch {}: {}", request.program, failure.message)
            }
        }

        if let Some(token) = request.startup_token.as_deref() {
            let pid = match &outcome {
                ExecOutcome::Spawned(pid) => Some(*pid),
                ExecOutcome::Failed(_) => None,
            };
            self.notifier.notify_startup_end(token, pid);
        }
        outcome
    }

    fn handshake(&self) -> ExecHandshake<'_> {
        match &self.protection {
            Some(protection) => ExecHandshake::new().with_protection(protection.as_ref()),
            None => ExecHandshake::new(),
        }
    }

    fn is_finished(&self) -> bool {
        self.socket.is_none() && self.children.is_empty()
    }

    fn reap_children(&mut self) {
        self.death_pipe.drain();
        for (pid, status) in reap_terminated() {
            self.children.notify_death(pid, status);
        }
    }

    fn accept_clients(&mut self) {
        loop {
            let accepted = match &self.socket {
                Some(socket) => socket.accept(),
                None => return,
            };
            match accepted {
                Ok(Some(stream)) => self.serve_client(stream),
                Ok(None) => return,
                Err(e) => {
                    warn!("accept on control socket failed: {}", e);
                    return;
                }
            }
        }
    }

    /// One-shot client: one request per connection. The connection stays
    /// open only as the death-notice channel of the child it launched.
    fn serve_client(&mut self, mut stream: UnixStream) {
        if let Err(e) = stream.set_read_timeout(Some(self.config.client_timeout)) {
            debug!("client read timeout: {}", e);
        }
        match read_message(&mut stream) {
            Ok(Some(ControlMessage::Ready)) if self.broker.is_none() => {
                // A broker started on its own connects and greets like this
                if let Err(e) = stream.set_read_timeout(None) {
                    debug!("broker link timeout: {}", e);
                }
                info!("broker connected over the control socket");
                self.broker = Some(BrokerLink {
                    stream,
                    pid: None,
                    ready: true,
                });
            }
            Ok(Some(ControlMessage::Ready)) => warn!("ignoring OK, a broker is already attached"),
            Ok(Some(message)) => {
                if let Err(e) = self.handle_message(message, &mut stream) {
                    debug!("client went away: {}", e);
                }
            }
            Ok(None) => debug!("client disconnected without a request"),
            Err(e) => warn!("malformed client request: {}", e),
        }
    }

    fn service_broker(&mut self) -> Result<()> {
        let Some(link) = self.broker.as_mut() else {
            return Ok(());
        };

        let message = match read_message(&mut link.stream) {
            Ok(Some(message)) => message,
            Ok(None) => return self.broker_lost("link closed"),
            Err(e) => return self.broker_lost(&e.to_string()),
        };

        if message == ControlMessage::Ready {
            info!("broker ready");
            link.ready = true;
            return Ok(());
        }

        let mut reply = link.stream.try_clone()?;
        if let Err(e) = self.handle_message(message, &mut reply) {
            return self.broker_lost(&e.to_string());
        }
        Ok(())
    }

    /// Dispatch one request; replies go to `reply`
    fn handle_message(&mut self, message: ControlMessage, reply: &mut UnixStream) -> Result<()> {
        match message {
            ControlMessage::Exec(request) => match self.launch(&request) {
                ExecOutcome::Spawned(pid) => {
                    write_message(
                        reply,
                        &ControlMessage::Spawned {
                            pid: pid.as_raw(),
                        },
                    )?;
                    self.children.insert(pid, reply.try_clone()?);
                }
                ExecOutcome::Failed(failure) => {
                    write_message(
                        reply,
                        &ControlMessage::Error {
                            message: Some(failure.message),
                        },
                    )?;
                }
            },
            ControlMessage::SetEnv { name, value } => {
                debug!("launch environment: {}={}", name, value);
                self.launch_env.push(format!("{}={}", name, value));
            }
            ControlMessage::DebugWait => {
                info!("next launched child will stop before exec");
                self.debug_wait = true;
            }
            ControlMessage::Terminate => self.begin_shutdown(),
            other => warn!(
                "unexpected {} on control channel",
                command_name(other.command())
            ),
        }
        Ok(())
    }

    fn broker_lost(&mut self, reason: &str) -> Result<()> {
        let Some(link) = self.broker.take() else {
            return Ok(());
        };
        if !link.ready {
            error!("broker failed before its handshake: {}", reason);
            return Err(LauncherError::ChannelClosed);
        }

        warn!("lost broker link: {}", reason);
        if let Some(pid) = link.pid {
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                debug!("kill broker {}: {}", pid, e);
            }
        }
        if self.socket.is_some() && self.config.broker.is_some() {
            self.start_broker()?;
        }
        Ok(())
    }

    /// Stop the broker and close the control socket. The loop finishes once
    /// the last child is reaped.
    fn begin_shutdown(&mut self) {
        info!(
            "terminate requested, {} children still running",
            self.children.len()
        );
        if let Some(link) = self.broker.take() {
            if let Some(pid) = link.pid {
                if let Err(e) = kill(pid, Signal::SIGTERM) {
                    debug!("terminate broker {}: {}", pid, e);
                }
            }
        }
        // Dropping the socket unlinks it
        self.socket = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = SpawnerConfig::default();
        assert!(config.socket_path.ends_with(SPAWNER_SOCKET_NAME));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn builder_sets_broker() {
        let config = SpawnerConfig::new("/tmp/x")
            .probe_grace(Duration::ZERO)
            .broker("launcher-ctl", vec!["broker".to_string()]);
        assert_eq!(config.probe_grace, Duration::ZERO);
        assert_eq!(
            config.broker,
            Some(BrokerCommand {
                program: "launcher-ctl".to_string(),
                args: vec!["broker".to_string()],
            })
        );
    }

    #[test]
    fn missing_broker_program_is_an_exec_failure() {
        let _guard = crate::test_support::serial_guard();
        let dir = tempfile::tempdir().unwrap();
        let config = SpawnerConfig::new(dir.path().join("spawner"))
            .probe_grace(Duration::ZERO)
            .broker("/nonexistent/broker", vec![]);
        let mut spawner = SpawnerState::new(config).unwrap();
        match spawner.start_broker() {
            Err(LauncherError::ExecFailed(message)) => {
                assert!(message.starts_with("broker /nonexistent/broker: "), "{}", message)
            }
            other => panic!("expected exec failure, got {:?}", other),
        }
    }

    #[test]
    fn overlong_socket_path_is_rejected() {
        let config = SpawnerConfig::new(format!("/tmp/{}", "x".repeat(200)));
        assert!(matches!(
            config.validate(),
            Err(LauncherError::InvalidConfig(_))
        ));
    }

    #[test]
    fn empty_broker_program_is_rejected() {
        let config = SpawnerConfig::new("/tmp/x").broker("", vec![]);
        assert!(config.validate().is_err());
    }
}
