//! Cohort evaluation and verdict classification.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, warn};

use rollgate_core::{HealthThresholds, InstanceId};
use rollgate_registry::{RegistryError, TargetRegistry};
use rollgate_state::{CohortMetrics, CohortSnapshot, HealthTag, Verdict};

use crate::source::{MetricsSample, MetricsSource};

/// Default bound on a single metrics query.
pub const DEFAULT_EVALUATION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum HealthError {
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),
}

/// Classify a metrics sample against thresholds.
///
/// `unhealthy_tagged` is the number of cohort instances the registry marks
/// unhealthy; it only counts once the sample is large enough to judge.
pub fn classify(
    sample: &MetricsSample,
    thresholds: &HealthThresholds,
    unhealthy_tagged: usize,
) -> (Verdict, Option<String>) {
    if sample.sample_count < thresholds.min_sample_size {
        return (
            Verdict::Inconclusive,
            Some(format!(
                "{} samples, {} required",
                sample.sample_count, thresholds.min_sample_size
            )),
        );
    }

    let mut breaches = Vec::new();
    if sample.error_rate > thresholds.error_rate_max {
        breaches.push(format!(
            "error rate {:.4} > {:.4}",
            sample.error_rate, thresholds.error_rate_max
        ));
    }
    if sample.latency_p95_ms > thresholds.latency_p95_max_ms {
        breaches.push(format!(
            "p95 latency {}ms > {}ms",
            sample.latency_p95_ms, thresholds.latency_p95_max_ms
        ));
    }
    if unhealthy_tagged > 0 {
        breaches.push(format!("{unhealthy_tagged} cohort instance(s) tagged unhealthy"));
    }

    if breaches.is_empty() {
        (Verdict::Pass, None)
    } else {
        (Verdict::Fail, Some(breaches.join("; ")))
    }
}

/// Renders verdicts for cohorts of a target group.
#[derive(Clone)]
pub struct HealthEvaluator {
    source: Arc<dyn MetricsSource>,
    registry: TargetRegistry,
    thresholds: HealthThresholds,
    timeout: Duration,
}

impl HealthEvaluator {
    pub fn new(
        source: Arc<dyn MetricsSource>,
        registry: TargetRegistry,
        thresholds: HealthThresholds,
    ) -> Self {
        Self {
            source,
            registry,
            thresholds,
            timeout: DEFAULT_EVALUATION_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn thresholds(&self) -> &HealthThresholds {
        &self.thresholds
    }

    /// Evaluate a cohort against the evaluator's default thresholds.
    pub async fn evaluate(
        &self,
        group_id: &str,
        cohort: &[InstanceId],
    ) -> Result<CohortSnapshot, HealthError> {
        self.evaluate_with(group_id, cohort, &self.thresholds).await
    }

    /// Evaluate a cohort against explicit thresholds.
    ///
    /// Only an unknown group or instance is an error; collaborator failures
    /// and timeouts come back as an inconclusive snapshot.
    pub async fn evaluate_with(
        &self,
        group_id: &str,
        cohort: &[InstanceId],
        thresholds: &HealthThresholds,
    ) -> Result<CohortSnapshot, HealthError> {
        let group = self.registry.snapshot(group_id)?;
        let mut unhealthy_tagged = 0;
        for iid in cohort {
            let inst = group.instance(iid).ok_or_else(|| RegistryError::UnknownInstance {
                group: group_id.to_string(),
                instance: iid.clone(),
            })?;
            if inst.health == HealthTag::Unhealthy {
                unhealthy_tagged += 1;
            }
        }

        let recorded_at = rollgate_core::epoch_secs();
        let snapshot = |metrics: Option<CohortMetrics>, verdict: Verdict, note: Option<String>| {
            CohortSnapshot {
                deployment_id: String::new(),
                seq: 0,
                group_id: group_id.to_string(),
                step: String::new(),
                cohort: cohort.to_vec(),
                metrics,
                verdict,
                note,
                recorded_at,
            }
        };

        if cohort.is_empty() {
            return Ok(snapshot(None, Verdict::Inconclusive, Some("empty cohort".to_string())));
        }

        let query = self
            .source
            .query_metrics(cohort, thresholds.evaluation_window());
        let sample = match tokio::time::timeout(self.timeout, query).await {
            Ok(Ok(sample)) => sample,
            Ok(Err(e)) => {
                warn!(group = %group_id, error = %e, "metrics query failed, verdict inconclusive");
                return Ok(snapshot(None, Verdict::Inconclusive, Some(e.to_string())));
            }
            Err(_) => {
                warn!(group = %group_id, timeout = ?self.timeout, "metrics query timed out");
                return Ok(snapshot(
                    None,
                    Verdict::Inconclusive,
                    Some(format!("evaluation timed out after {:?}", self.timeout)),
                ));
            }
        };

        let (verdict, note) = classify(&sample, thresholds, unhealthy_tagged);
        debug!(
            group = %group_id,
            cohort = cohort.len(),
            error_rate = sample.error_rate,
            p95_ms = sample.latency_p95_ms,
            samples = sample.sample_count,
            ?verdict,
            "cohort evaluated"
        );

        let metrics = CohortMetrics {
            error_rate: sample.error_rate,
            latency_p95_ms: sample.latency_p95_ms,
            sample_count: sample.sample_count,
            observed_at: sample.timestamp,
            custom: sample.custom,
        };
        Ok(snapshot(Some(metrics), verdict, note))
    }
}
