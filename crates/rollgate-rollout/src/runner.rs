//! Per-deployment control loop.
//!
//! Each active deployment gets one task that ticks on a fixed interval and
//! serves operator commands between ticks. Commands never interleave with
//! a tick in flight.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::controller::{CommandOutcome, Controller, Rollout, TickOutcome};
use crate::error::RolloutResult;

/// Operator command delivered to a running loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Pause,
    Resume,
    Abort,
}

impl Command {
    pub fn name(self) -> &'static str {
        match self {
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Abort => "abort",
        }
    }
}

type Reply = oneshot::Sender<RolloutResult<CommandOutcome>>;

/// Commands a loop holds before refusing more.
pub const COMMAND_QUEUE: usize = 16;

/// Why a command was not queued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueError {
    /// The loop is busy with a tick and its queue is full.
    Full,
    /// The loop has exited.
    Closed,
}

/// Handle to a running rollout loop.
pub struct RolloutHandle {
    deployment_id: String,
    commands: mpsc::Sender<(Command, Reply)>,
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl RolloutHandle {
    pub fn deployment_id(&self) -> &str {
        &self.deployment_id
    }

    /// Queue a command without waiting for room in the queue.
    pub fn send(
        &self,
        command: Command,
    ) -> Result<oneshot::Receiver<RolloutResult<CommandOutcome>>, QueueError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        match self.commands.try_send((command, reply_tx)) {
            Ok(()) => Ok(reply_rx),
            Err(mpsc::error::TrySendError::Full(_)) => Err(QueueError::Full),
            Err(mpsc::error::TrySendError::Closed(_)) => Err(QueueError::Closed),
        }
    }

    /// Whether the loop has exited (deployment terminal or stopped).
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Ask the loop to stop after the current tick and wait for it.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            warn!(deployment = %self.deployment_id, error = %e, "rollout loop panicked");
        }
    }
}

/// Spawn the control loop for `rollout`.
pub fn spawn_rollout(
    controller: Arc<Controller>,
    rollout: Rollout,
    tick_interval: Duration,
) -> RolloutHandle {
    let (commands, command_rx) = mpsc::channel(COMMAND_QUEUE);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let deployment_id = rollout.id().to_string();

    let task = tokio::spawn(run_rollout_loop(
        controller,
        rollout,
        tick_interval,
        command_rx,
        shutdown_rx,
    ));

    RolloutHandle {
        deployment_id,
        commands,
        shutdown_tx,
        task,
    }
}

async fn run_rollout_loop(
    controller: Arc<Controller>,
    mut rollout: Rollout,
    tick_interval: Duration,
    mut commands: mpsc::Receiver<(Command, Reply)>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(
        deployment = %rollout.id(),
        step = %rollout.step(),
        interval = ?tick_interval,
        "rollout loop started"
    );

    loop {
        tokio::select! {
            _ = interval.tick() => {
                match controller.tick(&mut rollout).await {
                    Ok(TickOutcome::Idle) => {}
                    Ok(outcome) => debug!(deployment = %rollout.id(), ?outcome, "tick"),
                    Err(e) => warn!(
                        deployment = %rollout.id(),
                        error = %e,
                        "tick failed, retrying next tick"
                    ),
                }
            }
            received = commands.recv() => {
                let Some((command, reply)) = received else {
                    break;
                };
                let result = match command {
                    Command::Pause => controller.pause(&mut rollout),
                    Command::Resume => controller.resume(&mut rollout),
                    Command::Abort => controller.abort(&mut rollout).await,
                };
                debug!(deployment = %rollout.id(), command = command.name(), ?result, "command handled");
                // The caller may have stopped waiting.
                let _ = reply.send(result);
            }
            _ = shutdown.changed() => {
                debug!(deployment = %rollout.id(), "rollout loop shutting down");
                break;
            }
        }

        if rollout.deployment.is_terminal() {
            info!(
                deployment = %rollout.id(),
                status = rollout.deployment.status.label(),
                "rollout loop finished"
            );
            break;
        }
    }
}
