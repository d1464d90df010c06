//! SIGCHLD self-pipe and child reaping
//!
//! The handler writes one byte into a non-blocking pipe and nothing else. The
//! event loop watches the read end, so a child dying between two polls still
//! wakes it up. Reaping happens in the loop, never in the handler.

use std::fs::File;
use std::io::{ErrorKind, Read};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicI32, Ordering};

use launcher_core::util::normalize_wait_status;
use launcher_core::{LauncherError, Result};
use log::debug;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{
    SaFlags, SigAction, SigHandler, SigSet, SigmaskHow, Signal, sigaction, sigprocmask,
};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, pipe2};

/// Write end of the death pipe, or -1 when no pipe is installed
static DEATH_PIPE_WRITE_FD: AtomicI32 = AtomicI32::new(-1);

extern "C" fn on_child_exit(_: libc::c_int) {
    let fd = DEATH_PIPE_WRITE_FD.load(Ordering::Relaxed);
    if fd < 0 {
        return;
    }
    // SAFETY: write(2) and errno access are async-signal-safe
    unsafe {
        let saved = *libc::__errno_location();
        let byte = 0u8;
        libc::write(fd, &byte as *const u8 as *const libc::c_void, 1);
        *libc::__errno_location() = saved;
    }
}

/// Installed SIGCHLD handler plus its self-pipe. Dropping it restores the
/// previous disposition.
pub struct DeathPipe {
    read: File,
    _write: OwnedFd,
    previous_chld: SigAction,
    previous_pipe: SigAction,
}

impl DeathPipe {
    /// Create the pipe and install the handler. Also ignores SIGPIPE so a peer
    /// hanging up surfaces as a write error instead of killing the process.
    pub fn install() -> Result<Self> {
        let (read, write) = pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
            .map_err(|e| LauncherError::Syscall(format!("death pipe: {}", e)))?;
        DEATH_PIPE_WRITE_FD.store(write.as_raw_fd(), Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::Handler(on_child_exit),
            SaFlags::SA_NOCLDSTOP | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        let ignore = SigAction::new(SigHandler::SigIgn, SaFlags::empty(), SigSet::empty());

        // SAFETY: the handler only touches an atomic and calls write(2)
        let previous_chld = unsafe { sigaction(Signal::SIGCHLD, &action) }.inspect_err(|_| {
            DEATH_PIPE_WRITE_FD.store(-1, Ordering::SeqCst);
        })?;
        // SAFETY: SIG_IGN installs no code
        let previous_pipe = unsafe { sigaction(Signal::SIGPIPE, &ignore) }?;

        let mut unblock = SigSet::empty();
        unblock.add(Signal::SIGCHLD);
        sigprocmask(SigmaskHow::SIG_UNBLOCK, Some(&unblock), None)?;

        debug!("SIGCHLD self-pipe installed");
        Ok(Self {
            read: File::from(read),
            _write: write,
            previous_chld,
            previous_pipe,
        })
    }

    /// Discard pending wakeup bytes. Returns how many were read.
    pub fn drain(&mut self) -> usize {
        let mut buf = [0u8; 64];
        let mut total = 0;
        loop {
            match self.read.read(&mut buf) {
                Ok(0) => return total,
                Ok(n) => total += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(_) => return total,
            }
        }
    }

    pub fn read_fd(&self) -> RawFd {
        self.read.as_raw_fd()
    }
}

impl Drop for DeathPipe {
    fn drop(&mut self) {
        DEATH_PIPE_WRITE_FD.store(-1, Ordering::SeqCst);
        // SAFETY: restoring dispositions saved at install time
        unsafe {
            let _ = sigaction(Signal::SIGCHLD, &self.previous_chld);
            let _ = sigaction(Signal::SIGPIPE, &self.previous_pipe);
        }
    }
}

/// Reap every terminated child without blocking.
///
/// Returns `(pid, status)` pairs with the status normalized to the exit code or
/// 128 + signal number.
pub fn reap_terminated() -> Vec<(Pid, i32)> {
    let mut reaped = Vec::new();
    loop {
        match waitpid(Pid::from_raw(-1), Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => break,
            Ok(status) => {
                if let Some(entry) = normalize_wait_status(status) {
                    reaped.push(entry);
                }
            }
            Err(Errno::EINTR) => continue,
            // ECHILD: nothing left to wait for
            Err(_) => break,
        }
    }
    reaped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::serial_guard;
    use nix::unistd::{ForkResult, fork};
    use std::time::{Duration, Instant};

    fn reap_until(pid: Pid, deadline: Duration) -> Option<i32> {
        let start = Instant::now();
        while start.elapsed() < deadline {
            if let Some((_, status)) = reap_terminated().into_iter().find(|(p, _)| *p == pid) {
                return Some(status);
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn child_exit_wakes_the_pipe() {
        let _guard = serial_guard();
        let mut pipe = DeathPipe::install().unwrap();
        pipe.drain();

        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe { libc::_exit(3) },
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => panic!("fork failed: {}", e),
        };

        assert_eq!(reap_until(child, Duration::from_secs(5)), Some(3));
        assert!(pipe.drain() >= 1);
    }

    #[test]
    fn signal_death_is_normalized() {
        let _guard = serial_guard();
        let _pipe = DeathPipe::install().unwrap();

        let child = match unsafe { fork() } {
            Ok(ForkResult::Child) => unsafe {
                libc::raise(libc::SIGTERM);
                libc::_exit(1)
            },
            Ok(ForkResult::Parent { child }) => child,
            Err(e) => panic!("fork failed: {}", e),
        };

        assert_eq!(reap_until(child, Duration::from_secs(5)), Some(128 + 15));
    }

    #[test]
    fn reap_without_children_returns_nothing() {
        let _guard = serial_guard();
        assert!(reap_terminated().is_empty());
    }

    #[test]
    fn drop_disarms_the_handler() {
        let _guard = serial_guard();
        let pipe = DeathPipe::install().unwrap();
        assert!(DEATH_PIPE_WRITE_FD.load(Ordering::SeqCst) >= 0);
        drop(pipe);
        assert_eq!(DEATH_PIPE_WRITE_FD.load(Ordering::SeqCst), -1);
    }
}
