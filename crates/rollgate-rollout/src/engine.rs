//! Strategy engine — pure step logic for every rollout strategy.
//!
//! Nothing here touches the registry or the clock. Given a deployment, its
//! persisted progress and (optionally) the latest verdict, the engine says
//! what should happen next. The controller carries it out.

use rollgate_core::{InstanceId, StrategyKind};
use rollgate_state::{BlueGreenPhase, CohortSnapshot, Deployment, Progress, StrategyState, Verdict};

use crate::strategy::{batch_count, canary_instance_count, standby_id};

/// A change to the target group that widens exposure of the new version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Exposure {
    /// Rolling: move the next batch of live instances to the new version.
    Batch {
        /// 1-based batch number.
        index: u32,
        total: u32,
        instance_ids: Vec<InstanceId>,
    },
    /// Canary: route `percent` of traffic to the new version and move the
    /// matching share of instances.
    Canary {
        index: usize,
        percent: u8,
        instance_ids: Vec<InstanceId>,
    },
    /// Blue-green: bring up a standby pool on the new version.
    ProvisionStandby { instance_ids: Vec<InstanceId> },
    /// Blue-green: swap the standby pool in for the live one.
    Flip,
    /// Blue-green: hold the old pool for one more evaluated tick.
    Grace { remaining: u32 },
    /// Blue-green: remove the old pool.
    Decommission,
}

impl Exposure {
    /// Whether the exposure has to pass a health gate before the next one.
    pub fn needs_evaluation(&self) -> bool {
        !matches!(self, Exposure::Decommission)
    }

    /// Human label used in snapshots, logs and failure reports.
    pub fn label(&self) -> String {
        match self {
            Exposure::Batch { index, total, .. } => format!("batch {index}/{total}"),
            Exposure::Canary { percent, .. } => format!("canary {percent}%"),
            Exposure::ProvisionStandby { .. } => "standby provisioned".to_string(),
            Exposure::Flip => "traffic flipped".to_string(),
            Exposure::Grace { remaining } => format!("grace ({remaining} left)"),
            Exposure::Decommission => "decommission".to_string(),
        }
    }
}

/// Outcome of running a verdict through the health gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateDecision {
    Open,
    Hold,
    Fail { reason: String },
}

/// What the controller should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextAction {
    Expose(Exposure),
    /// Keep the current exposure and evaluate again next tick.
    Hold,
    /// Every step is applied and the last one passed.
    Complete,
    Rollback { reason: String },
}

/// Progress of a deployment that has not exposed anything yet.
///
/// The gate starts open: there is no prior exposure to wait on.
pub fn initial_state(deployment: &Deployment) -> StrategyState {
    let progress = match deployment.strategy {
        StrategyKind::Rolling(_) => Progress::Rolling { batches_applied: 0 },
        StrategyKind::BlueGreen(_) => Progress::BlueGreen {
            phase: BlueGreenPhase::Idle,
        },
        StrategyKind::Canary(_) => Progress::Canary {
            step_index: None,
            percent: 0,
        },
    };
    StrategyState {
        deployment_id: deployment.id.clone(),
        progress,
        gate_open: true,
        inconclusive_ticks: 0,
        ticks: 0,
    }
}

/// Decide the next action.
///
/// With a snapshot, its verdict is first run through the gate (updating
/// the inconclusive counter in `state`). Without one, the current gate
/// state decides.
pub fn next_action(
    deployment: &Deployment,
    state: &mut StrategyState,
    snapshot: Option<&CohortSnapshot>,
) -> NextAction {
    if let Some(snapshot) = snapshot {
        match gate(state, snapshot.verdict, deployment.gate.max_inconclusive_ticks) {
            GateDecision::Open => {}
            GateDecision::Hold => return NextAction::Hold,
            GateDecision::Fail { reason } => {
                let reason = match &snapshot.note {
                    Some(note) if snapshot.verdict == Verdict::Fail => format!("{reason}: {note}"),
                    _ => reason,
                };
                return NextAction::Rollback { reason };
            }
        }
    }
    if !state.gate_open {
        return NextAction::Hold;
    }
    match next_exposure(deployment, state) {
        Some(exposure) => NextAction::Expose(exposure),
        None => NextAction::Complete,
    }
}

/// Run a verdict through the gate of the current exposure.
pub fn gate(state: &mut StrategyState, verdict: Verdict, max_inconclusive: u32) -> GateDecision {
    match verdict {
        Verdict::Pass => {
            state.gate_open = true;
            state.inconclusive_ticks = 0;
            GateDecision::Open
        }
        Verdict::Inconclusive => {
            state.inconclusive_ticks += 1;
            if state.inconclusive_ticks > max_inconclusive {
                GateDecision::Fail {
                    reason: format!(
                        "{} consecutive inconclusive verdicts (limit {max_inconclusive})",
                        state.inconclusive_ticks
                    ),
                }
            } else {
                GateDecision::Hold
            }
        }
        Verdict::Fail => GateDecision::Fail {
            reason: "health gate failed".to_string(),
        },
    }
}

/// The exposure after the current one, or `None` when the strategy is done.
pub fn next_exposure(deployment: &Deployment, state: &StrategyState) -> Option<Exposure> {
    let ids = &deployment.instance_ids;
    match (&deployment.strategy, &state.progress) {
        (StrategyKind::Rolling(cfg), Progress::Rolling { batches_applied }) => {
            let total = batch_count(ids.len(), &cfg.batch);
            if *batches_applied >= total {
                return None;
            }
            let size = cfg.batch.resolve(ids.len());
            let start = *batches_applied as usize * size;
            let end = (start + size).min(ids.len());
            Some(Exposure::Batch {
                index: batches_applied + 1,
                total,
                instance_ids: ids[start..end].to_vec(),
            })
        }
        (StrategyKind::Canary(cfg), Progress::Canary { step_index, .. }) => {
            let index = step_index.map_or(0, |i| i + 1);
            let percent = *cfg.steps.get(index)?;
            let count = canary_instance_count(ids.len(), percent);
            Some(Exposure::Canary {
                index,
                percent,
                instance_ids: ids[..count].to_vec(),
            })
        }
        (StrategyKind::BlueGreen(_), Progress::BlueGreen { phase }) => match phase {
            BlueGreenPhase::Idle => Some(Exposure::ProvisionStandby {
                instance_ids: ids.iter().map(|id| standby_id(id)).collect(),
            }),
            BlueGreenPhase::StandbyProvisioned => Some(Exposure::Flip),
            BlueGreenPhase::Flipped { grace_remaining } if *grace_remaining > 0 => {
                Some(Exposure::Grace {
                    remaining: *grace_remaining,
                })
            }
            BlueGreenPhase::Flipped { .. } => Some(Exposure::Decommission),
            BlueGreenPhase::Decommissioned => None,
        },
        // Progress of another strategy: nothing sensible to expose.
        _ => None,
    }
}

/// Record that `exposure` was applied. Closes the gate unless the exposure
/// needs no evaluation.
pub fn record_exposure(deployment: &Deployment, state: &mut StrategyState, exposure: &Exposure) {
    match (&mut state.progress, exposure) {
        (Progress::Rolling { batches_applied }, Exposure::Batch { index, .. }) => {
            *batches_applied = *index;
        }
        (Progress::Canary { step_index, percent }, Exposure::Canary { index, percent: p, .. }) => {
            *step_index = Some(*index);
            *percent = *p;
        }
        (Progress::BlueGreen { phase }, Exposure::ProvisionStandby { .. }) => {
            *phase = BlueGreenPhase::StandbyProvisioned;
        }
        (Progress::BlueGreen { phase }, Exposure::Flip) => {
            let grace_remaining = match &deployment.strategy {
                StrategyKind::BlueGreen(cfg) => cfg.grace_ticks,
                _ => 0,
            };
            *phase = BlueGreenPhase::Flipped { grace_remaining };
        }
        (Progress::BlueGreen { phase }, Exposure::Grace { remaining }) => {
            *phase = BlueGreenPhase::Flipped {
                grace_remaining: remaining.saturating_sub(1),
            };
        }
        (Progress::BlueGreen { phase }, Exposure::Decommission) => {
            *phase = BlueGreenPhase::Decommissioned;
        }
        _ => {}
    }
    state.gate_open = !exposure.needs_evaluation();
    state.inconclusive_ticks = 0;
}

/// Instances currently carrying the new version, the ones a verdict is about.
pub fn cohort(deployment: &Deployment, state: &StrategyState) -> Vec<InstanceId> {
    let ids = &deployment.instance_ids;
    match (&deployment.strategy, &state.progress) {
        (StrategyKind::Rolling(cfg), Progress::Rolling { batches_applied }) => {
            let exposed = (*batches_applied as usize * cfg.batch.resolve(ids.len())).min(ids.len());
            ids[..exposed].to_vec()
        }
        (StrategyKind::Canary(_), Progress::Canary { percent, .. }) => {
            ids[..canary_instance_count(ids.len(), *percent)].to_vec()
        }
        (StrategyKind::BlueGreen(_), Progress::BlueGreen { phase }) => match phase {
            BlueGreenPhase::Idle => Vec::new(),
            _ => ids.iter().map(|id| standby_id(id)).collect(),
        },
        _ => Vec::new(),
    }
}

/// Label of the step the deployment currently sits at.
pub fn current_step(deployment: &Deployment, state: &StrategyState) -> String {
    match (&deployment.strategy, &state.progress) {
        (StrategyKind::Rolling(cfg), Progress::Rolling { batches_applied }) => format!(
            "batch {batches_applied}/{}",
            batch_count(deployment.instance_ids.len(), &cfg.batch)
        ),
        (_, Progress::Canary { percent, .. }) => format!("canary {percent}%"),
        (_, Progress::BlueGreen { phase }) => match phase {
            BlueGreenPhase::Idle => "not started".to_string(),
            BlueGreenPhase::StandbyProvisioned => "standby provisioned".to_string(),
            BlueGreenPhase::Flipped { .. } => "traffic flipped".to_string(),
            BlueGreenPhase::Decommissioned => "decommission".to_string(),
        },
        _ => "unknown".to_string(),
    }
}
