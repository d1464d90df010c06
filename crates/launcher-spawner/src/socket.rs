//! Control socket rendezvous

use std::fs;
use std::io::ErrorKind;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use launcher_core::Result;
use launcher_core::socket::{accept_pending, bind_private_socket};
use launcher_proto::{ControlMessage, write_message};
use log::{debug, info};

/// The spawner's listening socket. The socket file is removed on drop.
#[derive(Debug)]
pub struct ControlSocket {
    listener: UnixListener,
    path: PathBuf,
}

impl ControlSocket {
    /// Take over `path`.
    ///
    /// A spawner still answering at `path` is asked to terminate and given
    /// `grace` to shut down before the file is replaced.
    pub fn bind(path: &Path, grace: Duration) -> Result<Self> {
        if probe_and_terminate(path) {
            info!("asked the running spawner at {} to shut down", path.display());
            thread::sleep(grace);
        }
        let listener = bind_private_socket(path)?;
        debug!("control socket listening at {}", path.display());
        Ok(Self {
            listener,
            path: path.to_path_buf(),
        })
    }

    pub fn accept(&self) -> Result<Option<UnixStream>> {
        accept_pending(&self.listener)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for ControlSocket {
    fn drop(&mut self) {
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("removed {}", self.path.display()),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => debug!("could not remove {}: {}", self.path.display(), e),
        }
    }
}

impl AsRawFd for ControlSocket {
    fn as_raw_fd(&self) -> RawFd {
        self.listener.as_raw_fd()
    }
}

/// Connect to whatever listens at `path` and send TERMINATE. Returns whether a
/// peer answered.
fn probe_and_terminate(path: &Path) -> bool {
    let Ok(mut stream) = UnixStream::connect(path) else {
        return false;
    };
    if let Err(e) = write_message(&mut stream, &ControlMessage::Terminate) {
        debug!("stale socket probe: {}", e);
    }
    true
}
