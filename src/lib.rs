//! Sentinel monitor supervisor library
//!
//! Spawns the per-user monitoring subprocess, classifies its output into a
//! lifecycle state machine, and publishes status to the host UI.

pub mod classifier;
pub mod config;
pub mod error;
pub mod ipc;
pub mod launcher;
pub mod lifecycle;
pub mod platform;
pub mod privilege;
pub mod publisher;
pub mod state_machine;
pub mod supervisor;
pub mod terminate;

// Public exports
pub use config::SupervisorConfig;
pub use error::SupervisorError;
pub use publisher::{OutputLine, StatusSnapshot, SubscriptionId};
pub use state_machine::{ExitReport, Status, StreamKind};
pub use supervisor::{CommandOutcome, Supervisor};
