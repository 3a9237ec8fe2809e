//! pause, resume and abort.

use rollgate_api::OpResult;

use crate::client::ApiClient;
use crate::commands::{Exit, exit_for_outcome, render, settle};

pub async fn run(client: &ApiClient, op: &str, id: &str, format: &str) -> anyhow::Result<Exit> {
    let resp = client.post::<OpResult>(&format!("/deployments/{id}/{op}"), None).await?;
    let result = match settle(resp) {
        Ok(result) => result,
        Err(exit) => return Ok(exit),
    };

    let status = result.deployment.deployment.status;
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        let outcome = serde_json::to_value(result.outcome)?;
        println!("{op}: {}", outcome.as_str().unwrap_or("unknown"));
        print!("{}", render(&result.deployment));
    }
    Ok(exit_for_outcome(result.outcome, status))
}
