//! Strategy parameters and their validation against a target group.

use rollgate_core::{BatchSize, GateConfig, StrategyKind};
use rollgate_state::TargetGroup;

use crate::error::{RolloutError, RolloutResult};

/// Reject strategy and gate parameters no rollout could honour.
pub fn validate(strategy: &StrategyKind, gate: &GateConfig) -> RolloutResult<()> {
    match strategy {
        StrategyKind::Rolling(cfg) => match cfg.batch {
            BatchSize::Count(0) => {
                return Err(RolloutError::Config("batch size must be positive".into()));
            }
            BatchSize::Percent(p) if p == 0 || p > 100 => {
                return Err(RolloutError::Config(format!(
                    "batch percent must be within 1..=100, got {p}"
                )));
            }
            _ => {}
        },
        StrategyKind::Canary(cfg) => {
            if cfg.steps.is_empty() {
                return Err(RolloutError::Config("canary needs at least one step".into()));
            }
            if cfg.steps.iter().any(|&p| p == 0 || p > 100) {
                return Err(RolloutError::Config(format!(
                    "canary steps must be within 1..=100, got {:?}",
                    cfg.steps
                )));
            }
            if cfg.steps.windows(2).any(|w| w[0] >= w[1]) {
                return Err(RolloutError::Config(format!(
                    "canary steps must be strictly increasing, got {:?}",
                    cfg.steps
                )));
            }
            if cfg.steps.last() != Some(&100) {
                return Err(RolloutError::Config(format!(
                    "last canary step must be 100, got {:?}",
                    cfg.steps
                )));
            }
        }
        StrategyKind::BlueGreen(_) => {}
    }

    if let Some(thresholds) = &gate.thresholds {
        thresholds.validate().map_err(RolloutError::Config)?;
    }
    Ok(())
}

/// Check that `group` can be moved to `desired` and return its current version.
pub fn baseline_version(group: &TargetGroup, desired: &str) -> RolloutResult<String> {
    if desired.is_empty() {
        return Err(RolloutError::Config("desired version must not be empty".into()));
    }
    if group.instances.is_empty() {
        return Err(RolloutError::Config(format!(
            "group {} has no instances",
            group.id
        )));
    }
    if !group.standby.is_empty() || group.traffic.is_some() {
        return Err(RolloutError::Config(format!(
            "group {} still carries a standby pool or traffic split",
            group.id
        )));
    }
    let current = group.uniform_version().ok_or_else(|| {
        RolloutError::Config(format!(
            "group {} runs mixed versions {:?}",
            group.id,
            group.versions().values().collect::<std::collections::BTreeSet<_>>()
        ))
    })?;
    if current == desired {
        return Err(RolloutError::Config(format!(
            "group {} already runs {desired}",
            group.id
        )));
    }
    Ok(current.to_string())
}

/// Batches a rolling update of `total` instances takes.
pub fn batch_count(total: usize, batch: &BatchSize) -> u32 {
    total.div_ceil(batch.resolve(total)) as u32
}

/// Instances that carry the new version at a canary step of `percent`.
///
/// Rounded up so any non-zero step exposes at least one instance.
pub fn canary_instance_count(total: usize, percent: u8) -> usize {
    (total * percent as usize).div_ceil(100).min(total)
}

const GREEN_SUFFIX: &str = "-green";

/// The standby counterpart of a live instance id.
///
/// Pools alternate between `<id>` and `<id>-green`, so consecutive
/// blue-green rollouts do not grow the ids.
pub fn standby_id(id: &str) -> String {
    match id.strip_suffix(GREEN_SUFFIX) {
        Some(blue) => blue.to_string(),
        None => format!("{id}{GREEN_SUFFIX}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::{CanaryConfig, HealthThresholds, RollingConfig};

    fn ids(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("web-{i}")).collect()
    }

    fn canary(steps: &[u8]) -> StrategyKind {
        StrategyKind::Canary(CanaryConfig {
            steps: steps.to_vec(),
        })
    }

    #[test]
    fn canary_steps_must_increase_to_100() {
        let gate = GateConfig::default();
        assert!(validate(&canary(&[5, 25, 50, 100]), &gate).is_ok());
        assert!(validate(&canary(&[100]), &gate).is_ok());
        assert!(validate(&canary(&[]), &gate).is_err());
        assert!(validate(&canary(&[25, 10, 100]), &gate).is_err());
        assert!(validate(&canary(&[25, 25, 100]), &gate).is_err());
        assert!(validate(&canary(&[10, 50]), &gate).is_err());
        assert!(validate(&canary(&[0, 100]), &gate).is_err());
    }

    #[test]
    fn rolling_batch_must_be_positive() {
        let gate = GateConfig::default();
        let rolling = |batch| StrategyKind::Rolling(RollingConfig { batch });
        assert!(validate(&rolling(BatchSize::Count(2)), &gate).is_ok());
        assert!(validate(&rolling(BatchSize::Count(0)), &gate).is_err());
        assert!(validate(&rolling(BatchSize::Percent(0)), &gate).is_err());
        assert!(validate(&rolling(BatchSize::Percent(101)), &gate).is_err());
    }

    #[test]
    fn bad_threshold_override_rejected() {
        let gate = GateConfig {
            thresholds: Some(HealthThresholds {
                error_rate_max: 2.0,
                ..Default::default()
            }),
            ..Default::default()
        };
        assert!(validate(&StrategyKind::default(), &gate).is_err());
    }

    #[test]
    fn baseline_requires_uniform_different_version() {
        let group = TargetGroup::new("web", "v1", &ids(3));
        assert_eq!(baseline_version(&group, "v2").unwrap(), "v1");
        assert!(baseline_version(&group, "v1").is_err());
        assert!(baseline_version(&group, "").is_err());

        let mut mixed = group.clone();
        mixed.instances[0].version = "v0".into();
        let err = baseline_version(&mixed, "v2").unwrap_err();
        assert!(err.to_string().contains("mixed"));

        let empty = TargetGroup::new("web", "v1", &[]);
        assert!(baseline_version(&empty, "v2").is_err());
    }

    #[test]
    fn batch_and_canary_counts() {
        assert_eq!(batch_count(10, &BatchSize::Count(2)), 5);
        assert_eq!(batch_count(10, &BatchSize::Count(3)), 4);
        assert_eq!(batch_count(10, &BatchSize::Percent(50)), 2);
        assert_eq!(canary_instance_count(10, 5), 1);
        assert_eq!(canary_instance_count(10, 25), 3);
        assert_eq!(canary_instance_count(10, 50), 5);
        assert_eq!(canary_instance_count(10, 100), 10);
    }

    #[test]
    fn standby_ids_alternate() {
        assert_eq!(standby_id("web-0"), "web-0-green");
        assert_eq!(standby_id("web-0-green"), "web-0");
    }
}
