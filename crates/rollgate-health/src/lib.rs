//! rollgate-health — health evaluation for rollout cohorts.
//!
//! The evaluator pulls aggregated metrics for the instances currently on
//! the candidate version and renders a three-way verdict:
//!
//! ```text
//! HealthEvaluator
//!   ├── MetricsSource::query_metrics(cohort, window)  (bounded by a timeout)
//!   ├── classify(sample, thresholds) → Pass | Fail | Inconclusive
//!   └── CohortSnapshot (immutable, persisted by the controller)
//! ```
//!
//! `Inconclusive` covers warm-up (too few samples), timeouts, and an
//! unreachable metrics collaborator. Callers hold on it; they never promote
//! or roll back because of it.

pub mod evaluator;
pub mod remote;
pub mod source;

pub use evaluator::{classify, HealthError, HealthEvaluator};
pub use remote::HttpMetricsSource;
pub use source::{
    MetricsError, MetricsSample, MetricsSource, ScriptedMetricsSource, StaticMetricsSource,
};
