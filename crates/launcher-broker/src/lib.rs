//! launcher-broker: launch requests from submission to completion
//!
//! The broker sits between callers and one spawner. Requests wait in a FIFO
//! queue and go to the spawner one at a time; each is then tracked until it
//! reaches a terminal status and its caller has been answered exactly once.
//!
//! - [`LaunchRequest`]: the per-request state machine
//! - [`RequestQueue`]: FIFO of requests not yet sent
//! - [`WorkerPool`]: idle workers, matched by capability and evicted when stale
//! - [`SpawnerLink`]: transport to the spawner, faked in tests
//! - [`ServiceRegistry`]: which service names currently have an owner
//! - [`Broker`]: ties them together

pub mod broker;
pub mod link;
pub mod pool;
pub mod queue;
pub mod registry;
pub mod request;

pub use broker::{Broker, BrokerConfig, ResolvedCommand, WorkerWait};
pub use link::{SpawnerLink, StreamLink};
pub use pool::{ANY_PROTOCOL, CapabilityKey, IdleWorker, WorkerConnection, WorkerPool};
pub use queue::RequestQueue;
pub use registry::{LocalRegistry, ServiceRegistry};
pub use request::{
    ActivationPolicy, LaunchOutcome, LaunchRequest, Reply, RequestStatus, matches_pending,
};
