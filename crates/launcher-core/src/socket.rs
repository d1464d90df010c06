//! Owner-only Unix listening sockets

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;

use log::{debug, warn};

use crate::{LauncherError, Result};

const BIND_ATTEMPTS: usize = 10;

/// Bind a non-blocking listener at `path`, readable and writable by the owner only.
///
/// Missing parent directories are created with mode 0700. Whatever sits at `path`
/// is unlinked first; callers that care about a live previous owner must probe
/// before calling this.
pub fn bind_private_socket(path: &Path) -> Result<UnixListener> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(parent)?;
    }

    match fs::remove_file(path) {
        Ok(()) => debug!("removed stale socket {}", path.display()),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }

    let mut last_error = None;
    let mut listener = None;
    for _ in 0..BIND_ATTEMPTS {
        match UnixListener::bind(path) {
            Ok(l) => {
                listener = Some(l);
                break;
            }
            Err(e) => {
                warn!("bind {} failed: {}", path.display(), e);
                last_error = Some(e);
            }
        }
    }
    let listener = listener.ok_or_else(|| {
        LauncherError::Syscall(format!(
            "could not bind socket {}: {}",
            path.display(),
            last_error.map(|e| e.to_string()).unwrap_or_default()
        ))
    })?;

    if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(0o600)) {
        let _ = fs::remove_file(path);
        return Err(LauncherError::Syscall(format!(
            "wrong permissions of socket {}: {}",
            path.display(),
            e
        )));
    }
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accept one pending connection, or `None` when none is waiting.
///
/// The accepted stream is switched back to blocking mode.
pub fn accept_pending(listener: &UnixListener) -> Result<Option<UnixStream>> {
    loop {
        match listener.accept() {
            Ok((stream, _)) => {
                stream.set_nonblocking(false)?;
                return Ok(Some(stream));
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(None),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileTypeExt;

    #[test]
    fn binds_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("sock");
        let _listener = bind_private_socket(&path).unwrap();

        let meta = fs::metadata(&path).unwrap();
        assert!(meta.file_type().is_socket());
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
        let parent = fs::metadata(path.parent().unwrap()).unwrap();
        assert_eq!(parent.permissions().mode() & 0o777, 0o700);
    }

    #[test]
    fn replaces_stale_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        fs::write(&path, "stale").unwrap();
        let _listener = bind_private_socket(&path).unwrap();
        assert!(fs::metadata(&path).unwrap().file_type().is_socket());
    }

    #[test]
    fn accept_without_pending_connection() {
        let dir = tempfile::tempdir().unwrap();
        let listener = bind_private_socket(&dir.path().join("sock")).unwrap();
        assert!(accept_pending(&listener).unwrap().is_none());
    }

    #[test]
    fn accept_returns_blocking_stream() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let listener = bind_private_socket(&path).unwrap();
        let _client = UnixStream::connect(&path).unwrap();
        let mut accepted = None;
        for _ in 0..100 {
            accepted = accept_pending(&listener).unwrap();
            if accepted.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(5));
        }
        assert!(accepted.is_some());
    }
}
