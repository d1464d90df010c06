//! launcher-core: shared types for the launcher crates
//!
//! - Error type and Result alias
//! - Exit-status normalization and environment override helpers
//! - Runtime socket path resolution and owner-only socket binding
//! - The single readiness wait used by both event loops
//! - The startup-notification collaborator trait

pub mod error;
pub mod notify;
pub mod poll;
pub mod socket;
pub mod util;

pub use error::{LauncherError, Result};
pub use notify::{LogNotifier, StartupNotifier};
