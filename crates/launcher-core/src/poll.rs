//! Readiness wait over a set of file descriptors
//!
//! Both event loops block in exactly one place: this call.

use std::os::fd::BorrowedFd;
use std::os::unix::io::RawFd;
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::{LauncherError, Result};

/// Block until at least one of `fds` is readable or `timeout` elapses.
///
/// Returns one flag per input fd. Hang-up and error conditions count as
/// readable so the caller observes EOF on its next read. An interrupted wait
/// returns all `false`; callers treat it as a spurious wakeup.
///
/// Every fd must stay open for the duration of the call.
pub fn wait_readable(fds: &[RawFd], timeout: Option<Duration>) -> Result<Vec<bool>> {
    let mut pollfds: Vec<PollFd> = fds
        .iter()
        // SAFETY: callers pass descriptors they own and keep open across the call
        .map(|&fd| PollFd::new(unsafe { BorrowedFd::borrow_raw(fd) }, PollFlags::POLLIN))
        .collect();

    let timeout = match timeout {
        None => PollTimeout::NONE,
        Some(d) => {
            let ms = d.as_millis().min(i32::MAX as u128) as i32;
            PollTimeout::try_from(ms).unwrap_or(PollTimeout::NONE)
        }
    };

    match poll(&mut pollfds, timeout) {
        Ok(_) => {}
        Err(Errno::EINTR) => return Ok(vec![false; fds.len()]),
        Err(e) => return Err(LauncherError::Syscall(format!("poll failed: {}", e))),
    }

    let readable = PollFlags::POLLIN | PollFlags::POLLHUP | PollFlags::POLLERR;
    Ok(pollfds
        .iter()
        .map(|p| p.revents().is_some_and(|r| r.intersects(readable)))
        .collect())
}
