pub mod control;
pub mod deploy;
pub mod status;

use std::process::ExitCode;

use rollgate_api::handlers::ApiResponse;
use rollgate_api::DeploymentView;
use rollgate_rollout::CommandOutcome;
use rollgate_state::DeploymentStatus;

/// Process exit status of a CLI invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    Success = 0,
    /// Invalid arguments, rejected configuration, or any other error.
    Failure = 1,
    /// The target group already has an active deployment.
    ActiveDeployment = 2,
    /// The operation hit a deployment that had already finished.
    Terminal = 3,
}

impl From<Exit> for ExitCode {
    fn from(exit: Exit) -> Self {
        ExitCode::from(exit as u8)
    }
}

/// Exit status for an API error code.
pub fn exit_for_code(code: Option<&str>) -> Exit {
    match code {
        Some("active_deployment") => Exit::ActiveDeployment,
        _ => Exit::Failure,
    }
}

/// Exit status for a pause/resume/abort result.
pub fn exit_for_outcome(outcome: CommandOutcome, status: DeploymentStatus) -> Exit {
    match (outcome, status) {
        (CommandOutcome::Terminal, _) => Exit::Terminal,
        (_, DeploymentStatus::Failed) => Exit::Failure,
        _ => Exit::Success,
    }
}

/// Take the payload out of an API response, or report the error.
pub fn settle<T>(resp: ApiResponse<T>) -> Result<T, Exit> {
    match (resp.success, resp.data) {
        (true, Some(data)) => Ok(data),
        _ => {
            eprintln!(
                "error: {}",
                resp.error.as_deref().unwrap_or("request failed")
            );
            Err(exit_for_code(resp.code.as_deref()))
        }
    }
}

/// Human summary of a deployment, one field per line.
pub fn render(view: &DeploymentView) -> String {
    let d = &view.deployment;
    let mut out = format!(
        "deployment  {}\ngroup       {}\nversion     {} -> {}\nstrategy    {}\nstatus      {}\nstep        {}\n",
        d.id,
        d.group_id,
        d.previous_version,
        d.desired_version,
        d.strategy.name(),
        d.status.label(),
        view.step,
    );
    if let Some(snap) = &view.latest_snapshot {
        let verdict = format!("{:?}", snap.verdict).to_lowercase();
        match &snap.note {
            Some(note) => out.push_str(&format!("verdict     {verdict} ({note})\n")),
            None => out.push_str(&format!("verdict     {verdict}\n")),
        }
    }
    if let Some(failure) = &d.failure {
        out.push_str(&format!("failure     {}: {}\n", failure.step, failure.reason));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_map_to_exit_status() {
        assert_eq!(exit_for_code(Some("active_deployment")), Exit::ActiveDeployment);
        assert_eq!(exit_for_code(Some("invalid_config")), Exit::Failure);
        assert_eq!(exit_for_code(Some("not_found")), Exit::Failure);
        assert_eq!(exit_for_code(None), Exit::Failure);
    }

    #[test]
    fn outcomes_map_to_exit_status() {
        use CommandOutcome::*;
        assert_eq!(exit_for_outcome(Applied, DeploymentStatus::Paused), Exit::Success);
        assert_eq!(exit_for_outcome(Unchanged, DeploymentStatus::Paused), Exit::Success);
        assert_eq!(exit_for_outcome(InProgress, DeploymentStatus::InProgress), Exit::Success);
        assert_eq!(exit_for_outcome(Terminal, DeploymentStatus::Succeeded), Exit::Terminal);
        assert_eq!(exit_for_outcome(Applied, DeploymentStatus::Failed), Exit::Failure);
    }

    #[test]
    fn settle_reports_failures() {
        let ok = ApiResponse {
            success: true,
            data: Some(7),
            error: None,
            code: None,
        };
        assert_eq!(settle(ok), Ok(7));

        let conflict: ApiResponse<u32> = ApiResponse {
            success: false,
            data: None,
            error: Some("busy".into()),
            code: Some("active_deployment".into()),
        };
        assert_eq!(settle(conflict), Err(Exit::ActiveDeployment));
    }
}
