//! Launch requests and their completion state machine

use std::fmt;

use launcher_core::util::{describe_exit_status, is_startup_token};
use launcher_proto::{ExecRequest, ExecVariant};
use log::{debug, warn};
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};

use crate::registry::ServiceRegistry;

/// Suffix sandboxed applications append to the name they register
const SANDBOX_NAME_SUFFIX: &str = ".kdbus";

/// Whether a launch is expected to register as a named service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationPolicy {
    /// Fire and forget, or wait for exit
    #[default]
    None,
    /// Registers one well-known name; an already registered name counts as running
    Unique,
    /// Registers a per-instance name
    Multi,
}

impl ActivationPolicy {
    pub fn expects_registration(self) -> bool {
        !matches!(self, ActivationPolicy::None)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RequestStatus {
    Init,
    Launching,
    Running,
    Error,
    Done,
}

impl RequestStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RequestStatus::Running | RequestStatus::Error | RequestStatus::Done
        )
    }

    /// Statuses only move forward: Init, then Launching, then one terminal status.
    /// Launching to Launching is allowed and means "spawned, still waiting".
    pub fn can_become(self, next: RequestStatus) -> bool {
        match self {
            RequestStatus::Init => next == RequestStatus::Launching,
            RequestStatus::Launching => true,
            _ => false,
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RequestStatus::Init => "init",
            RequestStatus::Launching => "launching",
            RequestStatus::Running => "running",
            RequestStatus::Error => "error",
            RequestStatus::Done => "done",
        };
        f.write_str(name)
    }
}

/// What the caller of a launch gets back, exactly once
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchOutcome {
    /// 0 on success
    pub result: i32,
    /// Registered service name, empty when none
    pub service_name: String,
    /// Empty on success
    pub error: String,
    /// 0 on failure
    pub pid: i32,
}

impl LaunchOutcome {
    pub fn is_success(&self) -> bool {
        self.result == 0
    }

    /// Failure outcome for `program`, with `reason` appended on its own line
    pub fn failure(program: &str, reason: Option<&str>) -> Self {
        let mut error = format!("could not launch '{}'", program);
        if let Some(reason) = reason.filter(|r| !r.is_empty()) {
            error.push_str(":\n");
            error.push_str(reason);
        }
        Self {
            result: 1,
            service_name: String::new(),
            error,
            pid: 0,
        }
    }
}

/// Deferred reply to the caller that asked for a launch
pub type Reply = Box<dyn FnOnce(LaunchOutcome)>;

/// One "start this program" ask, owned by the broker until it is answered
pub struct LaunchRequest {
    pub program: String,
    pub args: Vec<String>,
    /// `NAME=value` overrides, later entries win
    pub env: Vec<String>,
    pub cwd: Option<String>,
    pub activation: ActivationPolicy,
    /// Name the process is expected to register
    pub expected_name: Option<String>,
    /// Looser pattern (`*.<bin>`) tried when the expected name was derived
    pub tolerant_name: Option<String>,
    pub startup_token: Option<String>,
    /// With no activation: answer when the process exits instead of when it starts
    pub wait: bool,
    status: RequestStatus,
    pid: Option<Pid>,
    service_name: Option<String>,
    error: Option<String>,
    exit_status: Option<i32>,
    reply: Option<Reply>,
}

impl fmt::Debug for LaunchRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LaunchRequest")
            .field("program", &self.program)
            .field("args", &self.args)
            .field("activation", &self.activation)
            .field("expected_name", &self.expected_name)
            .field("wait", &self.wait)
            .field("status", &self.status)
            .field("pid", &self.pid)
            .field("has_reply", &self.reply.is_some())
            .finish_non_exhaustive()
    }
}

impl LaunchRequest {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            env: Vec::new(),
            cwd: None,
            activation: ActivationPolicy::None,
            expected_name: None,
            tolerant_name: None,
            startup_token: None,
            wait: false,
            status: RequestStatus::Init,
            pid: None,
            service_name: None,
            error: None,
            exit_status: None,
            reply: None,
        }
    }

    pub fn env(mut self, env: Vec<String>) -> Self {
        self.env = env;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into()).filter(|c: &String| !c.is_empty());
        self
    }

    pub fn activation(mut self, policy: ActivationPolicy, expected_name: Option<String>) -> Self {
        self.activation = policy;
        self.expected_name = expected_name.filter(|n| !n.is_empty());
        self
    }

    pub fn tolerant_name(mut self, pattern: impl Into<String>) -> Self {
        self.tolerant_name = Some(pattern.into());
        self
    }

    /// `""` and `"0"` mean no startup notification
    pub fn startup_token(mut self, token: &str) -> Self {
        self.startup_token = is_startup_token(token).then(|| token.to_string());
        self
    }

    pub fn wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    pub fn reply(mut self, reply: Reply) -> Self {
        self.reply = Some(reply);
        self
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    pub fn pid(&self) -> Option<Pid> {
        self.pid
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Exit status, once the process has been seen dying
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    pub fn has_reply(&self) -> bool {
        self.reply.is_some()
    }

    /// Move to `next` if the state machine allows it
    pub(crate) fn transition(&mut self, next: RequestStatus) -> bool {
        if !self.status.can_become(next) {
            warn!(
                "{}: refusing status change {} -> {}",
                self.program, self.status, next
            );
            return false;
        }
        debug!("{}: {} -> {}", self.program, self.status, next);
        self.status = next;
        true
    }

    /// Wire form of this request
    pub fn to_exec_request(&self) -> ExecRequest {
        let mut request = ExecRequest::new(self.program.clone(), self.args.clone());
        request.variant = ExecVariant::ExecNew;
        request.env = self.env.clone();
        request.cwd = self.cwd.clone();
        match self.startup_token.as_deref() {
            Some(token) => request.with_startup_token(token),
            None => request,
        }
    }

    /// The spawner forked and exec'd the program
    pub(crate) fn on_spawned(&mut self, pid: Pid) {
        self.pid = Some(pid);
        if self.activation == ActivationPolicy::None && !self.wait {
            self.transition(RequestStatus::Running);
        } else {
            // Still waiting: for a registration, or for the exit
            self.transition(RequestStatus::Launching);
        }
    }

    pub(crate) fn on_spawn_failed(&mut self, reason: Option<String>) {
        self.error = reason.filter(|r| !r.is_empty());
        self.transition(RequestStatus::Error);
    }

    /// The spawned process exited with `status` while this request waited on it
    pub(crate) fn on_process_died(&mut self, status: i32, registry: &dyn ServiceRegistry) {
        self.exit_status = Some(status);
        let unique_already_running = self.activation == ActivationPolicy::Unique
            && self
                .expected_name
                .as_deref()
                .is_some_and(|name| registry.is_registered(name));

        let next = if unique_already_running {
            RequestStatus::Running
        } else if self.activation == ActivationPolicy::None && self.wait {
            RequestStatus::Done
        } else if status == 0 && self.activation.expects_registration() {
            // Ran and quit cleanly without registering (e.g. a chooser dialog was closed)
            RequestStatus::Done
        } else {
            self.error = Some(format!("process {}", describe_exit_status(status)));
            RequestStatus::Error
        };
        self.transition(next);
    }

    /// A service called `name` appeared. Returns whether this request completed.
    pub(crate) fn on_service_registered(
        &mut self,
        name: &str,
        registry: &dyn ServiceRegistry,
    ) -> bool {
        if self.status != RequestStatus::Launching || !self.activation.expects_registration() {
            return false;
        }

        if self.activation == ActivationPolicy::Unique {
            if let Some(expected) = self.expected_name.as_deref() {
                if name == expected || registry.is_registered(expected) {
                    debug!("unique service {} is running", expected);
                    return self.transition(RequestStatus::Running);
                }
            }
        }

        let Some(pattern) = self
            .tolerant_name
            .as_deref()
            .or(self.expected_name.as_deref())
        else {
            return false;
        };
        if matches_pending(name, pattern) {
            self.service_name = Some(name.to_string());
            return self.transition(RequestStatus::Running);
        }
        false
    }

    /// Answer for the caller; requires a terminal status to report success
    pub fn outcome(&self) -> LaunchOutcome {
        match self.status {
            RequestStatus::Running | RequestStatus::Done => LaunchOutcome {
                result: 0,
                service_name: self
                    .service_name
                    .clone()
                    .or_else(|| self.expected_name.clone())
                    .unwrap_or_default(),
                error: String::new(),
                pid: self.pid.map(Pid::as_raw).unwrap_or(0),
            },
            _ => LaunchOutcome::failure(&self.program, self.error.as_deref()),
        }
    }

    /// Deliver the outcome to the waiting caller, if any, and consume the request
    pub(crate) fn finish(mut self) -> LaunchOutcome {
        let outcome = self.outcome();
        debug!(
            "{} finished as {} (pid {})",
            self.program, self.status, outcome.pid
        );
        if let Some(reply) = self.reply.take() {
            reply(outcome.clone());
        }
        outcome
    }
}

/// Whether a newly registered `name` is the one `pending` waits for.
///
/// An instance suffix (`-1234`) is stripped first. `*.x` matches any name whose
/// last dot-separated segment is `x`; a sandbox suffix on the registered name
/// is ignored.
pub fn matches_pending(name: &str, pending: &str) -> bool {
    let base = match name.rfind('-') {
        Some(pos) => &name[..pos],
        None => name,
    };

    if let Some(wanted) = pending.strip_prefix("*.") {
        let app = base.rsplit('.').next().unwrap_or(base);
        return app == wanted;
    }

    if let Some(unsandboxed) = base.strip_suffix(SANDBOX_NAME_SUFFIX) {
        return unsandboxed == pending;
    }

    base == pending
}
