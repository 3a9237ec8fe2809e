//! Rollgate rollouts — the strategy engine and rollback coordinator.
//!
//! This crate decides how far a new version is exposed at each tick and
//! reverts it when a health gate fails. It supports rolling updates
//! (batch-by-batch), canary deployments (traffic-percentage steps), and
//! blue-green switches (standby pool, atomic flip, grace period).
//!
//! # Components
//!
//! - **`strategy`** — Validation of strategy parameters against a target group
//! - **`engine`** — Pure per-strategy step logic (`next_action`)
//! - **`controller`** — Applies engine decisions to the registry, one tick at a time
//! - **`rollback`** — Restores the last-known-good version
//! - **`runner`** — The long-lived control loop per deployment

pub mod artifact;
pub mod controller;
pub mod engine;
pub mod error;
pub mod retry;
pub mod rollback;
pub mod runner;
pub mod strategy;

pub use artifact::{ArtifactCatalog, OpenCatalog, RetainedCatalog};
pub use controller::{CommandOutcome, Controller, Rollout, TickOutcome};
pub use engine::{Exposure, GateDecision, NextAction};
pub use error::{RolloutError, RolloutResult};
pub use retry::RetryPolicy;
pub use rollback::{RollbackCoordinator, RollbackReport};
pub use runner::{COMMAND_QUEUE, Command, QueueError, RolloutHandle, spawn_rollout};
