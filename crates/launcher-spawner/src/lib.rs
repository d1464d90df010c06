//! launcher-spawner: owns fork/exec for the launcher
//!
//! The spawner listens on a control socket, launches programs on request with a
//! status-pipe handshake that tells fork failure, exec failure and success apart,
//! and reports each child's death back to whoever asked for it.
//!
//! # Example
//!
//! ```ignore
//! use launcher_spawner::{SpawnerConfig, SpawnerState};
//!
//! let config = SpawnerConfig::default().broker("launcher-ctl", vec!["broker".into()]);
//! let mut spawner = SpawnerState::new(config)?;
//! spawner.start_broker()?;
//! spawner.run()?;
//! ```

pub mod children;
pub mod exec;
pub mod signals;
pub mod socket;
pub mod spawner;

pub use children::ChildRegistry;
pub use exec::{
    ExecConfig, ExecFailure, ExecHandshake, ExecOutcome, FailureKind, ProtectionHandshake,
};
pub use signals::{DeathPipe, reap_terminated};
pub use socket::ControlSocket;
pub use spawner::{
    BROKER_FD_ARG, BrokerCommand, LoopControl, SPAWNER_SOCKET_NAME, SpawnerConfig, SpawnerState,
};

#[cfg(test)]
pub mod test_support {
    use std::sync::{Mutex, MutexGuard, OnceLock};

    /// Tests that fork or touch SIGCHLD disposition run one at a time
    pub fn serial_guard() -> MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .unwrap_or_else(|poison| poison.into_inner())
    }
}
