//! Assembly of the Rollgate daemon from its configuration.
//!
//! Kept apart from `main.rs` so integration tests can build the same
//! router the binary serves.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, error, info};

use rollgate_api::{Orchestrator, OrchestratorSettings, build_router};
use rollgate_core::config::{ArtifactsConfig, GroupSeed, MetricsConfig, MetricsSourceKind};
use rollgate_core::RollgateConfig;
use rollgate_health::{
    HealthEvaluator, HttpMetricsSource, MetricsSample, MetricsSource, StaticMetricsSource,
};
use rollgate_registry::{RegistryError, TargetRegistry};
use rollgate_rollout::{
    ArtifactCatalog, Controller, OpenCatalog, RetainedCatalog, RetryPolicy, RollbackCoordinator,
};
use rollgate_state::{StateStore, TargetGroup};

/// Build the metrics collaborator named in the config.
pub fn metrics_source(config: &MetricsConfig) -> anyhow::Result<Arc<dyn MetricsSource>> {
    match config.source {
        MetricsSourceKind::Http => {
            let endpoint = config
                .endpoint
                .as_deref()
                .context("metrics.endpoint is required for the http source")?;
            let source = HttpMetricsSource::new(endpoint)
                .with_context(|| format!("invalid metrics endpoint {endpoint}"))?;
            info!(%endpoint, "using http metrics source");
            Ok(Arc::new(source))
        }
        MetricsSourceKind::Static => {
            info!(
                error_rate = config.static_error_rate,
                p95_ms = config.static_latency_p95_ms,
                "using static metrics source"
            );
            Ok(Arc::new(StaticMetricsSource::new(MetricsSample {
                error_rate: config.static_error_rate,
                latency_p95_ms: config.static_latency_p95_ms,
                sample_count: config.static_sample_count,
                timestamp: 0,
                custom: None,
            })))
        }
    }
}

pub fn artifact_catalog(config: &ArtifactsConfig) -> Arc<dyn ArtifactCatalog> {
    match &config.retained {
        Some(versions) => Arc::new(RetainedCatalog::new(versions.iter().cloned())),
        None => Arc::new(OpenCatalog),
    }
}

/// Register configured groups the registry does not know yet.
///
/// Existing groups are left alone: their versions reflect past rollouts.
pub fn seed_groups(registry: &TargetRegistry, seeds: &[GroupSeed]) -> anyhow::Result<usize> {
    let mut seeded = 0;
    for seed in seeds {
        match registry.get_group(&seed.id) {
            Ok(_) => debug!(group = %seed.id, "group already registered, seed skipped"),
            Err(RegistryError::NotFound(_)) => {
                let group = TargetGroup::new(&seed.id, &seed.version, &seed.resolved_instance_ids());
                registry
                    .register(&group)
                    .with_context(|| format!("seeding group {}", seed.id))?;
                info!(group = %seed.id, version = %seed.version, "group seeded");
                seeded += 1;
            }
            Err(e) => return Err(e).with_context(|| format!("reading group {}", seed.id)),
        }
    }
    Ok(seeded)
}

/// Wire the store, registry, evaluator, rollback coordinator and
/// orchestrator together.
pub fn assemble(config: &RollgateConfig, store: StateStore) -> anyhow::Result<Arc<Orchestrator>> {
    config.validate()?;
    let controller_cfg = &config.controller;

    let registry = TargetRegistry::new(store.clone());
    seed_groups(&registry, &config.groups)?;

    let evaluator = HealthEvaluator::new(
        metrics_source(&config.metrics)?,
        registry.clone(),
        config.health.clone(),
    )
    .with_timeout(controller_cfg.evaluation_timeout()?);

    let retry = RetryPolicy {
        attempts: controller_cfg.conflict_retries.max(1),
        backoff: controller_cfg.conflict_backoff()?,
    };
    let rollback = RollbackCoordinator::new(
        registry.clone(),
        artifact_catalog(&config.artifacts),
        retry,
    );
    let controller = Controller::new(store, registry, evaluator, rollback, retry);

    let settings = OrchestratorSettings {
        tick_interval: controller_cfg.tick_interval()?,
        abort_timeout: controller_cfg.abort_timeout()?,
        default_gate: config.gate(),
    };
    Ok(Arc::new(Orchestrator::new(Arc::new(controller), settings)))
}

/// Run the daemon until Ctrl-C.
pub async fn serve(config: RollgateConfig) -> anyhow::Result<()> {
    info!("Rollgate daemon starting");

    let data_dir = &config.daemon.data_dir;
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("creating data dir {}", data_dir.display()))?;
    let db_path = data_dir.join("rollgate.redb");
    let store = StateStore::open(&db_path)
        .with_context(|| format!("opening state store {}", db_path.display()))?;
    info!(path = ?db_path, "state store opened");

    let orchestrator = assemble(&config, store)?;
    let resumed = orchestrator.recover().await?;
    info!(resumed, "active deployments resumed");

    let router = build_router(orchestrator.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], config.daemon.port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, "API server listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!(error = %e, "failed to listen for Ctrl-C");
            }
            info!("shutdown signal received");
        })
        .await?;

    // Loops stop between ticks; progress is already persisted.
    orchestrator.shutdown().await;
    info!("Rollgate daemon stopped");
    Ok(())
}
