//! Control link from the broker to its spawner

use std::os::fd::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use launcher_core::{LauncherError, Result};
use launcher_proto::{ControlMessage, read_message, write_message};
use log::debug;
use nix::fcntl::{FcntlArg, FdFlag, fcntl};

/// One request/reply channel to a spawner
pub trait SpawnerLink {
    fn send(&mut self, message: &ControlMessage) -> Result<()>;

    /// Block until the next message. A closed link is `ChannelClosed`.
    fn recv(&mut self) -> Result<ControlMessage>;
}

/// Link over a unix stream, either connected to the spawner socket or
/// inherited from a supervising spawner
#[derive(Debug)]
pub struct StreamLink {
    stream: UnixStream,
}

impl StreamLink {
    pub fn new(stream: UnixStream) -> Self {
        Self { stream }
    }

    pub fn connect(path: &Path) -> Result<Self> {
        let stream = UnixStream::connect(path)?;
        debug!("connected to spawner at {}", path.display());
        Ok(Self::new(stream))
    }

    /// Adopt the socket a supervising spawner passed as `fd`
    pub fn from_inherited_fd(fd: RawFd) -> Result<Self> {
        // Refuse descriptors that are not open instead of adopting garbage
        fcntl(fd, FcntlArg::F_GETFD)
            .map_err(|e| LauncherError::InvalidConfig(format!("inherited fd {}: {}", fd, e)))?;
        fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
        // SAFETY: the fd is open and nothing else in this process owns it
        let stream = unsafe { UnixStream::from_raw_fd(fd) };
        debug!("adopted spawner link on fd {}", fd);
        Ok(Self::new(stream))
    }
}

impl SpawnerLink for StreamLink {
    fn send(&mut self, message: &ControlMessage) -> Result<()> {
        write_message(&mut self.stream, message)
    }

    fn recv(&mut self) -> Result<ControlMessage> {
        read_message(&mut self.stream)?.ok_or(LauncherError::ChannelClosed)
    }
}

impl AsRawFd for StreamLink {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}
