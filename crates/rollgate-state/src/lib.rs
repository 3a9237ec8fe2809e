//! rollgate-state — embedded state store for Rollgate.
//!
//! Backed by [redb](https://docs.rs/redb), persists target groups,
//! deployments, per-deployment strategy progress, and the cohort snapshot
//! history so that a restarted daemon can resume every rollout at the step
//! it had reached.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Snapshot keys (`{deployment_id}:{seq:010}`) sort in evaluation order.
//! Invariants that span records (one active deployment per group, revision
//! checks on groups) are enforced inside a single write transaction.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
