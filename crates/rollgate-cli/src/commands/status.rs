use rollgate_api::DeploymentView;

use crate::client::ApiClient;
use crate::commands::{Exit, render, settle};

/// Show one deployment, or all of them when no id is given.
pub async fn run(client: &ApiClient, id: Option<&str>, format: &str) -> anyhow::Result<Exit> {
    let views = match id {
        Some(id) => match settle(client.get::<DeploymentView>(&format!("/deployments/{id}")).await?) {
            Ok(view) => vec![view],
            Err(exit) => return Ok(exit),
        },
        None => match settle(client.get::<Vec<DeploymentView>>("/deployments").await?) {
            Ok(views) => views,
            Err(exit) => return Ok(exit),
        },
    };

    if format == "json" {
        match (id, views.as_slice()) {
            (Some(_), [view]) => println!("{}", serde_json::to_string_pretty(view)?),
            _ => println!("{}", serde_json::to_string_pretty(&views)?),
        }
        return Ok(Exit::Success);
    }

    if views.is_empty() {
        println!("no deployments");
    }
    for (i, view) in views.iter().enumerate() {
        if i > 0 {
            println!();
        }
        print!("{}", render(view));
    }
    Ok(Exit::Success)
}
