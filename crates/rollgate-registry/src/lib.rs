//! rollgate-registry — the fleet of target groups and their versions.
//!
//! Every mutation is a compare-and-swap against the group's revision
//! counter. A caller that lost a race gets `RegistryError::Conflict` and is
//! expected to re-read the group and retry; the registry itself never
//! retries. Different groups never contend.

pub mod registry;

pub use registry::{RegistryError, assign_version, RegistryResult, TargetRegistry};
