//! Metrics collaborator seam and in-process sources.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use rollgate_core::InstanceId;

/// Aggregated metrics for a set of instances over a window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSample {
    /// Error rate as a fraction (0.0–1.0).
    pub error_rate: f64,
    pub latency_p95_ms: u64,
    pub sample_count: u64,
    /// Unix timestamp of the sample.
    pub timestamp: u64,
    #[serde(default)]
    pub custom: Option<f64>,
}

impl MetricsSample {
    /// A sample well within the default thresholds.
    pub fn healthy() -> Self {
        Self {
            error_rate: 0.001,
            latency_p95_ms: 40,
            sample_count: 1_000,
            timestamp: rollgate_core::epoch_secs(),
            custom: None,
        }
    }

    /// A sample breaching the default error-rate threshold.
    pub fn failing() -> Self {
        Self {
            error_rate: 0.4,
            ..Self::healthy()
        }
    }

    /// A sample with no traffic yet.
    pub fn warming_up() -> Self {
        Self {
            sample_count: 0,
            ..Self::healthy()
        }
    }
}

/// Failures talking to the metrics collaborator.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("metrics collaborator unreachable: {0}")]
    Unreachable(String),

    #[error("malformed metrics response: {0}")]
    Decode(String),
}

/// Source of cohort metrics.
#[async_trait]
pub trait MetricsSource: Send + Sync {
    async fn query_metrics(
        &self,
        instance_ids: &[InstanceId],
        window: Duration,
    ) -> Result<MetricsSample, MetricsError>;
}

/// Reports the same sample for every query.
#[derive(Debug, Clone)]
pub struct StaticMetricsSource {
    sample: MetricsSample,
}

impl StaticMetricsSource {
    pub fn new(sample: MetricsSample) -> Self {
        Self { sample }
    }
}

#[async_trait]
impl MetricsSource for StaticMetricsSource {
    async fn query_metrics(
        &self,
        _instance_ids: &[InstanceId],
        _window: Duration,
    ) -> Result<MetricsSample, MetricsError> {
        Ok(MetricsSample {
            timestamp: rollgate_core::epoch_secs(),
            ..self.sample.clone()
        })
    }
}

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Scripted {
    Sample(MetricsSample),
    Error(String),
    /// Never answer within any sane timeout.
    Hang,
}

/// Replays a queue of responses, then falls back to a fixed sample.
///
/// Records every queried cohort so tests can assert what was evaluated.
#[derive(Debug)]
pub struct ScriptedMetricsSource {
    script: Mutex<VecDeque<Scripted>>,
    fallback: MetricsSample,
    queries: Mutex<Vec<Vec<InstanceId>>>,
}

impl Default for ScriptedMetricsSource {
    fn default() -> Self {
        Self::new(MetricsSample::healthy())
    }
}

impl ScriptedMetricsSource {
    pub fn new(fallback: MetricsSample) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            fallback,
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: Scripted) -> &Self {
        lock(&self.script).push_back(response);
        self
    }

    pub fn push_pass(&self) -> &Self {
        self.push(Scripted::Sample(MetricsSample::healthy()))
    }

    pub fn push_fail(&self) -> &Self {
        self.push(Scripted::Sample(MetricsSample::failing()))
    }

    pub fn push_inconclusive(&self) -> &Self {
        self.push(Scripted::Sample(MetricsSample::warming_up()))
    }

    pub fn push_error(&self) -> &Self {
        self.push(Scripted::Error("connection refused".to_string()))
    }

    pub fn push_hang(&self) -> &Self {
        self.push(Scripted::Hang)
    }

    /// Cohorts queried so far, oldest first.
    pub fn queries(&self) -> Vec<Vec<InstanceId>> {
        lock(&self.queries).clone()
    }
}

#[async_trait]
impl MetricsSource for ScriptedMetricsSource {
    async fn query_metrics(
        &self,
        instance_ids: &[InstanceId],
        _window: Duration,
    ) -> Result<MetricsSample, MetricsError> {
        lock(&self.queries).push(instance_ids.to_vec());
        let next = lock(&self.script).pop_front();
        match next {
            Some(Scripted::Sample(sample)) => Ok(sample),
            Some(Scripted::Error(msg)) => Err(MetricsError::Unreachable(msg)),
            Some(Scripted::Hang) => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(MetricsError::Unreachable("hung".to_string()))
            }
            None => Ok(self.fallback.clone()),
        }
    }
}

/// Lock a mutex, recovering the data if a panicking holder poisoned it.
fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_replays_then_falls_back() {
        let source = ScriptedMetricsSource::default();
        source.push_fail().push_error();

        let ids = vec!["a".to_string()];
        let first = source.query_metrics(&ids, Duration::from_secs(60)).await.unwrap();
        assert_eq!(first.error_rate, MetricsSample::failing().error_rate);

        let second = source.query_metrics(&ids, Duration::from_secs(60)).await;
        assert!(matches!(second, Err(MetricsError::Unreachable(_))));

        let third = source.query_metrics(&ids, Duration::from_secs(60)).await.unwrap();
        assert_eq!(third.sample_count, MetricsSample::healthy().sample_count);
        assert_eq!(source.queries().len(), 3);
    }

    #[tokio::test]
    async fn static_source_restamps_timestamp() {
        let source = StaticMetricsSource::new(MetricsSample {
            timestamp: 0,
            ..MetricsSample::healthy()
        });
        let sample = source.query_metrics(&[], Duration::from_secs(1)).await.unwrap();
        assert!(sample.timestamp > 0);
    }

    #[test]
    fn sample_decodes_without_custom() {
        let sample: MetricsSample = serde_json::from_str(
            r#"{"error_rate":0.01,"latency_p95_ms":120,"sample_count":300,"timestamp":1700000000}"#,
        )
        .unwrap();
        assert_eq!(sample.latency_p95_ms, 120);
        assert!(sample.custom.is_none());
    }
}
