//! Fork/exec with a status pipe so the parent knows whether exec succeeded
//!
//! The child reports progress over a pipe whose write end is close-on-exec:
//!
//! - byte [`STATUS_EXEC_ATTEMPT`] right before `execve`
//! - byte [`STATUS_EXEC_FAILED`] followed by the native-endian errno if `execve` returned
//!
//! A successful exec closes the write end, so the parent sees "attempt" then EOF.
//! Everything the child needs (argv, envp, resolved path) is built before the
//! fork; after the fork the child only makes async-signal-safe calls.

use std::ffi::{CString, OsString};
use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

use launcher_core::LauncherError;
use launcher_core::util::{self, merge_env_overrides};
use launcher_proto::ExecRequest;
use log::{debug, warn};
use nix::unistd::{AccessFlags, ForkResult, Pid, access, fork, pipe};

/// Child is about to call `execve`
pub const STATUS_EXEC_ATTEMPT: u8 = 2;
/// `execve` returned; four errno bytes follow
pub const STATUS_EXEC_FAILED: u8 = 1;

const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Environment variable carrying the startup-notification token into the child
pub const STARTUP_ID_VAR: &str = "DESKTOP_STARTUP_ID";

/// Exec configuration for one launch
#[derive(Debug, Clone, Default)]
pub struct ExecConfig {
    /// Program name or path; also used verbatim as argv[0]
    pub program: String,
    pub args: Vec<String>,
    /// `NAME=value` overrides applied on top of the base environment
    pub env: Vec<String>,
    /// Working directory; failure to enter it is ignored
    pub cwd: Option<String>,
    /// Terminal to attach stdout/stderr to
    pub tty: Option<String>,
    /// Start from an empty environment instead of the spawner's own
    pub reset_env: bool,
    /// Skip the first PATH directory that contains the program
    pub avoid_loops: bool,
    pub startup_token: Option<String>,
    /// Stop the child with SIGSTOP right before exec so a debugger can attach
    pub suspend_before_exec: bool,
    /// Descriptors the child must keep across exec (close-on-exec is cleared)
    pub inherit_fds: Vec<RawFd>,
}

impl ExecConfig {
    /// Build the exec configuration for a decoded request. `launch_env` holds
    /// spawner-wide overrides; the request's own entries win over them.
    pub fn from_request(request: &ExecRequest, launch_env: &[String]) -> Self {
        let mut env = launch_env.to_vec();
        env.extend(request.env.iter().cloned());
        Self {
            program: request.program.clone(),
            args: request.args.clone(),
            env,
            cwd: request.cwd.clone().filter(|c| !c.is_empty()),
            tty: request.tty.clone().filter(|t| !t.is_empty()),
            reset_env: request.variant.resets_env(),
            avoid_loops: request.avoid_loops,
            startup_token: request.startup_token.clone(),
            ..Default::default()
        }
    }

    /// Final child environment: base (inherited unless reset), overrides, and the
    /// startup token variable set or removed.
    pub fn build_environment(&self) -> Vec<(OsString, OsString)> {
        let base: Vec<(OsString, OsString)> = if self.reset_env {
            Vec::new()
        } else {
            std::env::vars_os().collect()
        };
        let mut env = merge_env_overrides(base, &self.env);
        env.retain(|(k, _)| k != STARTUP_ID_VAR);
        if let Some(token) = self.startup_token.as_deref() {
            if util::is_startup_token(token) {
                env.push((OsString::from(STARTUP_ID_VAR), OsString::from(token)));
            }
        }
        env
    }

    fn search_path(&self) -> String {
        if let Some(path) = util::lookup_env_override(&self.env, "PATH") {
            return path.to_string();
        }
        if !self.reset_env {
            if let Ok(path) = std::env::var("PATH") {
                return path;
            }
        }
        DEFAULT_PATH.to_string()
    }
}

/// Resolve `program` against a colon-separated search path.
///
/// Names containing a slash are used as given. With `avoid_loops`, the directory
/// of the first hit is dropped and the search repeated, so a wrapper named like
/// the program it wraps does not launch itself.
pub fn resolve_program_path(program: &str, search_path: &str, avoid_loops: bool) -> Option<String> {
    if program.contains('/') {
        return Some(program.to_string());
    }

    let mut dirs: Vec<&str> = search_path
        .split(':')
        .map(|entry| if entry.is_empty() { "." } else { entry })
        .collect();

    let first = find_in_dirs(program, &dirs)?;
    if !avoid_loops {
        return Some(first);
    }

    let bin_dir = Path::new(&first)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();
    if let Some(pos) = dirs
        .iter()
        .position(|d| d.trim_end_matches('/') == bin_dir.trim_end_matches('/'))
    {
        dirs.remove(pos);
    }
    find_in_dirs(program, &dirs)
}

fn find_in_dirs(program: &str, dirs: &[&str]) -> Option<String> {
    dirs.iter()
        .map(|dir| Path::new(dir).join(program))
        .find(|candidate| candidate.is_file() && access(candidate, AccessFlags::X_OK).is_ok())
        .map(|candidate| candidate.to_string_lossy().into_owned())
}

/// Why a launch failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The status pipe could not be created
    ResourceExhausted,
    /// `fork` failed
    ProcessLimit,
    /// The program could not be executed
    ExecFailed,
    /// Arguments could not be converted for `execve`
    InvalidRequest,
}

/// A failed launch with a human-readable reason
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl ExecFailure {
    fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl From<ExecFailure> for LauncherError {
    fn from(failure: ExecFailure) -> Self {
        match failure.kind {
            FailureKind::ResourceExhausted | FailureKind::ProcessLimit => {
                LauncherError::ResourceExhausted(failure.message)
            }
            FailureKind::ExecFailed => LauncherError::ExecFailed(failure.message),
            FailureKind::InvalidRequest => LauncherError::InvalidConfig(failure.message),
        }
    }
}

/// Result of one exec handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecOutcome {
    Spawned(Pid),
    Failed(ExecFailure),
}

/// Hook run in the child right after fork, before anything else.
///
/// Used to hand back privileges or protections the spawner holds (for example an
/// OOM score adjustment) so launched programs do not inherit them. Runs between
/// fork and exec: implementations must stick to async-signal-safe calls.
pub trait ProtectionHandshake {
    fn release_in_child(&self);
}

/// Everything the child touches, prepared before the fork
struct PreparedExec {
    path: Option<CString>,
    argv: Vec<CString>,
    envp: Vec<CString>,
    cwd: Option<CString>,
    tty: Option<CString>,
}

impl PreparedExec {
    fn new(config: &ExecConfig) -> Result<Self, ExecFailure> {
        let invalid = |what: &str| {
            ExecFailure::new(
                FailureKind::InvalidRequest,
                format!("{} contains a nul byte", what),
            )
        };

        let path = resolve_program_path(&config.program, &config.search_path(), config.avoid_loops)
            .map(|p| CString::new(p).map_err(|_| invalid("program path")))
            .transpose()?;
        if path.is_none() {
            debug!("{}: not found in search path", config.program);
        }

        let mut argv = Vec::with_capacity(config.args.len() + 1);
        argv.push(CString::new(config.program.as_str()).map_err(|_| invalid("program name"))?);
        for arg in &config.args {
            argv.push(CString::new(arg.as_str()).map_err(|_| invalid("argument"))?);
        }

        let envp = config
            .build_environment()
            .into_iter()
            .map(|(k, v)| {
                let mut entry = k.into_vec();
                entry.push(b'=');
                entry.extend_from_slice(v.as_bytes());
                CString::new(entry)
            })
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| invalid("environment entry"))?;

        let cwd = config
            .cwd
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|_| invalid("working directory"))?;
        let tty = config
            .tty
            .as_deref()
            .map(CString::new)
            .transpose()
            .map_err(|_| invalid("tty"))?;

        Ok(Self {
            path,
            argv,
            envp,
            cwd,
            tty,
        })
    }
}

/// Runs the fork/exec handshake
#[derive(Default)]
pub struct ExecHandshake<'a> {
    protection: Option<&'a dyn ProtectionHandshake>,
}

impl<'a> ExecHandshake<'a> {
    pub fn new() -> Self {
        Self { protection: None }
    }

    pub fn with_protection(mut self, protection: &'a dyn ProtectionHandshake) -> Self {
        self.protection = Some(protection);
        self
    }

    /// Fork and exec `config`, blocking until the child has exec'd or failed.
    ///
    /// With `suspend_before_exec` the child stops itself before exec and this
    /// call blocks until someone sends it SIGCONT.
    pub fn run(&self, config: &ExecConfig) -> ExecOutcome {
        let prepared = match PreparedExec::new(config) {
            Ok(p) => p,
            Err(failure) => return ExecOutcome::Failed(failure),
        };

        let (read_end, write_end) = match pipe() {
            Ok(fds) => fds,
            Err(e) => {
                warn!("pipe failed: {}", e);
                return ExecOutcome::Failed(ExecFailure::new(
                    FailureKind::ResourceExhausted,
                    format!(
                        "unable to start new process: resource exhausted (too many open files: {})",
                        e
                    ),
                ));
            }
        };

        // Pointer tables must exist before fork; the child may not allocate.
        let argv_ptrs = null_terminated(&prepared.argv);
        let envp_ptrs = null_terminated(&prepared.envp);

        // SAFETY: the spawner is single-threaded; the child only runs
        // async-signal-safe code before exec or _exit
        match unsafe { fork() } {
            Ok(ForkResult::Child) => {
                let read_fd = read_end.as_raw_fd();
                let write_fd = write_end.as_raw_fd();
                // Leak the owned fds: the child never returns to Rust code that would drop them
                std::mem::forget(read_end);
                std::mem::forget(write_end);
                unsafe {
                    child_after_fork(
                        read_fd,
                        write_fd,
                        &prepared,
                        &argv_ptrs,
                        &envp_ptrs,
                        config,
                        self.protection,
                    )
                }
            }
            Ok(ForkResult::Parent { child }) => {
                drop(write_end);
                wait_for_exec(child, read_end, &config.program)
            }
            Err(e) => {
                warn!("fork failed: {}", e);
                ExecOutcome::Failed(ExecFailure::new(
                    FailureKind::ProcessLimit,
                    format!("unable to create new process: process limit reached ({})", e),
                ))
            }
        }
    }
}

fn null_terminated(strings: &[CString]) -> Vec<*const libc::c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}

/// Child side of the handshake. Never returns.
///
/// # Safety
/// Must only be called in a freshly forked child of a single-threaded parent.
#[allow(clippy::too_many_arguments)]
unsafe fn child_after_fork(
    read_fd: RawFd,
    write_fd: RawFd,
    prepared: &PreparedExec,
    argv: &[*const libc::c_char],
    envp: &[*const libc::c_char],
    config: &ExecConfig,
    protection: Option<&dyn ProtectionHandshake>,
) -> ! {
    libc::close(read_fd);

    libc::signal(libc::SIGCHLD, libc::SIG_DFL);
    libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    let mut empty: libc::sigset_t = std::mem::zeroed();
    libc::sigemptyset(&mut empty);
    libc::sigprocmask(libc::SIG_SETMASK, &empty, std::ptr::null_mut());

    if let Some(protection) = protection {
        protection.release_in_child();
    }

    // Errors ignored: the program still runs from the spawner's directory
    if let Some(cwd) = &prepared.cwd {
        libc::chdir(cwd.as_ptr());
    }

    for &fd in &config.inherit_fds {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags >= 0 {
            libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
        }
    }

    let attempt = [STATUS_EXEC_ATTEMPT];
    libc::write(write_fd, attempt.as_ptr() as *const libc::c_void, 1);
    libc::fcntl(write_fd, libc::F_SETFD, libc::FD_CLOEXEC);

    if let Some(tty) = &prepared.tty {
        let fd = libc::open(tty.as_ptr(), libc::O_WRONLY);
        if fd >= 0 {
            libc::dup2(fd, libc::STDOUT_FILENO);
            libc::dup2(fd, libc::STDERR_FILENO);
            libc::close(fd);
        }
    }

    if config.suspend_before_exec {
        libc::raise(libc::SIGSTOP);
    }

    let errno = match &prepared.path {
        Some(path) => {
            libc::execve(path.as_ptr(), argv.as_ptr(), envp.as_ptr());
            *libc::__errno_location()
        }
        None => libc::ENOENT,
    };

    let mut report = [0u8; 5];
    report[0] = STATUS_EXEC_FAILED;
    report[1..].copy_from_slice(&errno.to_ne_bytes());
    libc::write(write_fd, report.as_ptr() as *const libc::c_void, report.len());
    libc::_exit(255);
}

/// Parent side: read status bytes until EOF
fn wait_for_exec(child: Pid, read_end: OwnedFd, program: &str) -> ExecOutcome {
    let mut pipe = File::from(read_end);
    let mut attempted = false;
    let mut byte = [0u8; 1];

    loop {
        match pipe.read(&mut byte) {
            Ok(0) if attempted => {
                debug!("{}: exec'd as pid {}", program, child);
                return ExecOutcome::Spawned(child);
            }
            Ok(0) => {
                return ExecOutcome::Failed(ExecFailure::new(
                    FailureKind::ExecFailed,
                    "exec failed: child exited before exec",
                ));
            }
            Ok(_) if byte[0] == STATUS_EXEC_ATTEMPT => attempted = true,
            Ok(_) if byte[0] == STATUS_EXEC_FAILED => {
                let mut errno = [0u8; 4];
                let reason = match pipe.read_exact(&mut errno) {
                    Ok(()) => {
                        std::io::Error::from_raw_os_error(i32::from_ne_bytes(errno)).to_string()
                    }
                    Err(_) => "unknown error".to_string(),
                };
                debug!("{}: exec failed: {}", program, reason);
                return ExecOutcome::Failed(ExecFailure::new(
                    FailureKind::ExecFailed,
                    format!("exec failed: {}: {}", program, reason),
                ));
            }
            Ok(_) => {
                return ExecOutcome::Failed(ExecFailure::new(
                    FailureKind::ExecFailed,
                    format!("exec failed: unexpected status byte {}", byte[0]),
                ));
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                return ExecOutcome::Failed(ExecFailure::new(
                    FailureKind::ExecFailed,
                    format!("exec failed: error reading status pipe: {}", e),
                ));
            }
        }
    }
}
