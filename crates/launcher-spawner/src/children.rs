//! Launched children and the channel that asked for each one

use std::collections::HashMap;
use std::io::Write;

use launcher_core::util::describe_exit_status;
use launcher_proto::{ControlMessage, write_message};
use log::{debug, warn};
use nix::unistd::Pid;

/// Maps live child pids to the channel their CHILD_DIED notice goes to.
///
/// A pid is present from the successful exec handshake until its death has been
/// reported, and is reported at most once.
#[derive(Debug)]
pub struct ChildRegistry<W: Write> {
    children: HashMap<Pid, W>,
}

impl<W: Write> Default for ChildRegistry<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> ChildRegistry<W> {
    pub fn new() -> Self {
        Self {
            children: HashMap::new(),
        }
    }

    /// Track `pid`. A recycled pid replaces the stale record, which is returned.
    pub fn insert(&mut self, pid: Pid, channel: W) -> Option<W> {
        let previous = self.children.insert(pid, channel);
        if previous.is_some() {
            warn!("pid {} registered twice, dropping the stale record", pid);
        }
        previous
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.children.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn pids(&self) -> impl Iterator<Item = Pid> + '_ {
        self.children.keys().copied()
    }

    /// Report the death of `pid` and forget it.
    ///
    /// Returns false for pids that were never registered (or already reported).
    /// A dead owner channel is logged; the record is removed either way.
    pub fn notify_death(&mut self, pid: Pid, status: i32) -> bool {
        let Some(mut channel) = self.children.remove(&pid) else {
            debug!("reaped untracked pid {} ({})", pid, describe_exit_status(status));
            return false;
        };

        debug!("child {} {}", pid, describe_exit_status(status));
        let notice = ControlMessage::ChildDied {
            pid: pid.as_raw(),
            status,
        };
        if let Err(e) = write_message(&mut channel, &notice).and_then(|()| Ok(channel.flush()?)) {
            debug!("could not deliver death of {} to its owner: {}", pid, e);
        }
        true
    }
}
