//! `rollgate deploy`: assemble a start request and submit it.

use std::path::Path;

use anyhow::{Context, bail};

use rollgate_api::{DeploymentView, StartRequest};
use rollgate_core::{BatchSize, GateConfig, RollgateConfig, StrategyKind};

use crate::client::ApiClient;
use crate::commands::{Exit, render, settle};

/// Strategy flags as given on the command line.
#[derive(Debug, Default)]
pub struct StrategyArgs {
    pub strategy: String,
    pub batch_size: Option<u32>,
    pub batch_percent: Option<u8>,
    pub steps: Option<Vec<u8>>,
    pub max_inconclusive_ticks: Option<u32>,
}

/// Resolve the strategy, starting from the config file's defaults.
///
/// Range checks are left to the daemon, which rejects bad parameters
/// with `invalid_config`.
pub fn build_strategy(
    args: &StrategyArgs,
    config: Option<&RollgateConfig>,
) -> anyhow::Result<StrategyKind> {
    let defaults = RollgateConfig::default();
    let config = config.unwrap_or(&defaults);
    let mut strategy = match config.strategy(&args.strategy) {
        Some(strategy) => strategy,
        None => bail!(
            "unknown strategy `{}` (expected rolling, blue-green or canary)",
            args.strategy
        ),
    };

    let batch = match (args.batch_size, args.batch_percent) {
        (Some(_), Some(_)) => bail!("--batch-size and --batch-percent are mutually exclusive"),
        (Some(n), None) => Some(BatchSize::Count(n)),
        (None, Some(p)) => Some(BatchSize::Percent(p)),
        (None, None) => None,
    };

    match &mut strategy {
        StrategyKind::Rolling(rolling) => {
            if let Some(batch) = batch {
                rolling.batch = batch;
            }
        }
        _ if batch.is_some() => bail!("batch flags only apply to the rolling strategy"),
        _ => {}
    }
    match &mut strategy {
        StrategyKind::Canary(canary) => {
            if let Some(steps) = &args.steps {
                canary.steps = steps.clone();
            }
        }
        _ if args.steps.is_some() => bail!("--steps only applies to the canary strategy"),
        _ => {}
    }
    Ok(strategy)
}

/// Gate for the request. `None` lets the daemon apply its own default.
pub fn build_gate(args: &StrategyArgs, config: Option<&RollgateConfig>) -> Option<GateConfig> {
    let mut gate = config.map(RollgateConfig::gate);
    if let Some(max) = args.max_inconclusive_ticks {
        gate.get_or_insert_with(GateConfig::default).max_inconclusive_ticks = max;
    }
    gate
}

pub async fn run(
    client: &ApiClient,
    group: &str,
    version: &str,
    args: &StrategyArgs,
    config_path: Option<&Path>,
    format: &str,
) -> anyhow::Result<Exit> {
    let config = config_path
        .map(|p| {
            RollgateConfig::from_file(p).with_context(|| format!("loading {}", p.display()))
        })
        .transpose()?;

    let req = StartRequest {
        group_id: group.to_string(),
        version: version.to_string(),
        strategy: build_strategy(args, config.as_ref())?,
        gate: build_gate(args, config.as_ref()),
    };
    let body = serde_json::to_value(&req)?;
    let view = match settle(client.post::<DeploymentView>("/deployments", Some(&body)).await?) {
        Ok(view) => view,
        Err(exit) => return Ok(exit),
    };

    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&view)?);
    } else {
        print!("{}", render(&view));
    }
    Ok(Exit::Success)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollgate_core::{CanaryConfig, RollingConfig};

    fn args(strategy: &str) -> StrategyArgs {
        StrategyArgs {
            strategy: strategy.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_without_config() {
        let strategy = build_strategy(&args("canary"), None).unwrap();
        assert_eq!(strategy, StrategyKind::Canary(CanaryConfig::default()));
        assert!(build_gate(&args("canary"), None).is_none());
    }

    #[test]
    fn flags_override_config_defaults() {
        let config = RollgateConfig::from_toml_str(
            "[canary]\nsteps = [10, 100]\n[rolling]\nbatch = { percent = 20 }\n[controller]\nmax_inconclusive_ticks = 5\n",
        )
        .unwrap();

        let canary = build_strategy(&args("canary"), Some(&config)).unwrap();
        assert_eq!(canary, StrategyKind::Canary(CanaryConfig { steps: vec![10, 100] }));

        let mut rolling = args("rolling");
        let from_file = build_strategy(&rolling, Some(&config)).unwrap();
        assert_eq!(
            from_file,
            StrategyKind::Rolling(RollingConfig { batch: BatchSize::Percent(20) })
        );
        rolling.batch_size = Some(2);
        let flagged = build_strategy(&rolling, Some(&config)).unwrap();
        assert_eq!(
            flagged,
            StrategyKind::Rolling(RollingConfig { batch: BatchSize::Count(2) })
        );

        assert_eq!(build_gate(&rolling, Some(&config)).unwrap().max_inconclusive_ticks, 5);
        rolling.max_inconclusive_ticks = Some(1);
        assert_eq!(build_gate(&rolling, Some(&config)).unwrap().max_inconclusive_ticks, 1);
    }

    #[test]
    fn blue_green_accepts_both_spellings() {
        assert_eq!(build_strategy(&args("blue-green"), None).unwrap().name(), "blue-green");
        assert_eq!(build_strategy(&args("blue_green"), None).unwrap().name(), "blue-green");
    }

    #[test]
    fn misplaced_flags_are_rejected() {
        assert!(build_strategy(&args("linear"), None).is_err());

        let mut canary_batch = args("canary");
        canary_batch.batch_size = Some(2);
        assert!(build_strategy(&canary_batch, None).is_err());

        let mut rolling_steps = args("rolling");
        rolling_steps.steps = Some(vec![50, 100]);
        assert!(build_strategy(&rolling_steps, None).is_err());

        let mut both = args("rolling");
        both.batch_size = Some(2);
        both.batch_percent = Some(20);
        assert!(build_strategy(&both, None).is_err());
    }
}
