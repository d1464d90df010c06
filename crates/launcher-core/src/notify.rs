//! Startup-notification collaborator
//!
//! The graphical startup-notification protocol lives outside the launcher. The
//! spawner and broker only pass the opaque token through and report begin/end.

use log::debug;
use nix::unistd::Pid;

/// Receives startup-notification begin/end events for launches carrying a token
pub trait StartupNotifier {
    /// A launch with `token` is about to fork `program`
    fn notify_startup_begin(&mut self, token: &str, program: &str);

    /// The launch finished: `Some(pid)` on success, `None` to cancel the notification
    fn notify_startup_end(&mut self, token: &str, pid: Option<Pid>);
}

/// Notifier that only logs
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl StartupNotifier for LogNotifier {
    fn notify_startup_begin(&mut self, token: &str, program: &str) {
        debug!("startup begin: token={} program={}", token, program);
    }

    fn notify_startup_end(&mut self, token: &str, pid: Option<Pid>) {
        match pid {
            Some(pid) => debug!("startup end: token={} pid={}", token, pid),
            None => debug!("startup cancelled: token={}", token),
        }
    }
}
