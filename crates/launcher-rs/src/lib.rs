//! launcher-rs: process launcher for a desktop session
//!
//! Two processes share the work. The spawner owns fork/exec and reports child
//! deaths; the broker queues launch requests from callers, hands them to the
//! spawner one at a time, waits for services to register and keeps idle
//! workers around for reuse.
//!
//! # Example
//!
//! ```ignore
//! use launcher_rs::{BrokerServer, ServerConfig, StreamLink};
//!
//! let link = StreamLink::connect(&spawner_socket)?;
//! let mut server = BrokerServer::new(ServerConfig::default(), link)?;
//! server.run()?;
//! ```

pub mod server;

// Re-export sub-crate types for convenience
pub use launcher_broker::{
    ActivationPolicy, Broker, BrokerConfig, LaunchOutcome, LaunchRequest, LocalRegistry,
    RequestStatus, ResolvedCommand, SpawnerLink, StreamLink,
};
pub use launcher_core::{self as core, LauncherError, Result, util};
pub use launcher_proto::{ControlMessage, ExecRequest, ExecVariant, read_message, write_message};
pub use launcher_spawner::{LoopControl, SPAWNER_SOCKET_NAME, SpawnerConfig, SpawnerState};

pub use server::{
    BROKER_SOCKET_NAME, BrokerServer, CallerReply, CallerRequest, ServerConfig,
    WORKER_SOCKET_NAME,
};
