//! Error types for launcher operations

use std::io;
use thiserror::Error;

/// Result type for launcher operations
pub type Result<T> = std::result::Result<T, LauncherError>;

/// Errors that can occur while spawning, brokering or talking the control protocol
#[derive(Error, Debug)]
pub enum LauncherError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Syscall error: {0}")]
    Syscall(String),

    /// Malformed framing or payload from a peer. The connection is dead.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// pipe/socket/fork failure while launching
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Exec failed: {0}")]
    ExecFailed(String),

    /// The control channel to the spawner is gone
    #[error("Control channel closed")]
    ChannelClosed,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Unknown request: {0}")]
    UnknownRequest(String),
}

impl LauncherError {
    /// Whether this error ends the broker's event loop. `Protocol` only
    /// reaches the loop from reading the spawner link.
    pub fn is_fatal_for_broker(&self) -> bool {
        matches!(self, LauncherError::ChannelClosed | LauncherError::Protocol(_))
    }
}

impl From<nix::Error> for LauncherError {
    fn from(err: nix::Error) -> Self {
        LauncherError::Syscall(err.desc().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = LauncherError::ChannelClosed;
        assert_eq!(err.to_string(), "Control channel closed");
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let launcher_err = LauncherError::from(io_err);
        assert!(launcher_err.to_string().contains("IO error"));
    }

    #[test]
    fn test_error_from_nix() {
        let err = LauncherError::from(nix::Error::EAGAIN);
        assert!(matches!(err, LauncherError::Syscall(_)));
    }

    #[test]
    fn fatal_errors_for_broker() {
        assert!(LauncherError::ChannelClosed.is_fatal_for_broker());
        assert!(LauncherError::Protocol("short read".into()).is_fatal_for_broker());
        assert!(!LauncherError::ExecFailed("nope".into()).is_fatal_for_broker());
        assert!(!LauncherError::ResourceExhausted("pipe".into()).is_fatal_for_broker());
    }

    #[test]
    fn test_protocol_error_message() {
        let err = LauncherError::Protocol("bad header".to_string());
        assert!(err.to_string().contains("bad header"));
    }
}
