// SPDX-License-Identifier: Apache-2.0

//! The `serve` path: bootstrap-when-empty, first model load, HTTP serving,
//! subprocess supervision, and graceful shutdown. The listening socket does
//! not open until a model is in memory; `/api/v1/health` can therefore never
//! report `degraded` merely because startup raced a client.

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

use tripcast_registry::{scan, train_bootstrap, RegistryConfig, TrainOptions};
use tripcast_server::{build_router, ApiConfig, AppState, ModelService};

use crate::children::{self, ChildSpec};
use crate::CliError;

pub struct ServeOptions {
    pub api_port: u16,
    pub api: ApiConfig,
    pub registry: RegistryConfig,
    pub disable_subprocesses: bool,
    pub dashboard_port: u16,
    pub tracking_ui_port: u16,
}

pub fn run_serve(opts: ServeOptions) -> Result<(), CliError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| CliError::Generic(format!("failed to start runtime: {e}")))?;
    runtime.block_on(serve(opts))
}

async fn serve(opts: ServeOptions) -> Result<(), CliError> {
    std::fs::create_dir_all(opts.registry.experiment_dir()).map_err(|e| {
        CliError::Config(format!(
            "registry root {} is unreachable: {e}",
            opts.registry.root.display()
        ))
    })?;

    let service = Arc::new(ModelService::new(opts.registry.clone()));
    ensure_initial_model(&opts.registry).await?;
    let model = service
        .reload()
        .await
        .map_err(|_| CliError::NoModel("no model could be loaded at startup".to_string()))?;
    info!(model_version = %model.version(), rmse = model.rmse, "initial model loaded");

    let state = AppState::new(service.clone(), opts.api.clone());
    let app = build_router(state.clone());

    // Accept only after the first model is in memory.
    let addr = SocketAddr::from(([0, 0, 0, 0], opts.api_port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| CliError::Config(format!("failed to bind {addr}: {e}")))?;
    info!(%addr, "tripcast api listening");

    let (stop_tx, _stop_rx) = watch::channel(false);

    let mut child_tasks = Vec::new();
    if opts.disable_subprocesses {
        info!("subprocess supervision disabled");
    } else {
        for spec in [
            children::dashboard_spec(opts.dashboard_port),
            children::tracking_ui_spec(opts.tracking_ui_port),
        ] {
            child_tasks.push(tokio::spawn(supervise_logged(spec, stop_tx.subscribe())));
        }
    }

    if !opts.api.refresh_interval.is_zero() {
        spawn_refresh_loop(
            service.clone(),
            opts.api.refresh_interval,
            stop_tx.subscribe(),
        );
    }

    let shutdown_state = state.clone();
    let grace = opts.api.shutdown_grace;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = wait_for_shutdown_signal().await {
                warn!("shutdown signal handler failed: {err}");
            }
            info!("shutdown signal received; draining in-flight requests");
            shutdown_state.begin_shutdown();
            tokio::time::sleep(grace).await;
        })
        .await
        .map_err(|e| CliError::Generic(format!("server failed: {e}")))?;

    // Children get the polite-then-forced treatment after HTTP is down.
    let _ = stop_tx.send(true);
    for task in child_tasks {
        let _ = task.await;
    }
    info!("tripcast stopped");
    Ok(())
}

/// When the registry holds no valid artifact, run bootstrap training and
/// insist the produced artifact actually loads. A bootstrap that leaves a
/// corrupt artifact behind is a startup failure, not a success.
async fn ensure_initial_model(registry: &RegistryConfig) -> Result<(), CliError> {
    let probe_cfg = registry.clone();
    let has_model = tokio::task::spawn_blocking(move || scan(&probe_cfg).has_valid_candidate())
        .await
        .map_err(|e| CliError::Generic(format!("registry probe failed: {e}")))?;
    if has_model {
        return Ok(());
    }

    info!("registry holds no valid model; running bootstrap training");
    let train_cfg = registry.clone();
    let report =
        tokio::task::spawn_blocking(move || train_bootstrap(&train_cfg, &TrainOptions::default()))
            .await
            .map_err(|e| CliError::Generic(format!("bootstrap task failed: {e}")))?
            .map_err(|e| CliError::NoModel(format!("bootstrap training failed: {e}")))?;
    info!(
        run_id = %report.run_id,
        rmse = report.rmse,
        "bootstrap training produced a verified model"
    );
    Ok(())
}

async fn supervise_logged(spec: ChildSpec, stop: watch::Receiver<bool>) {
    let name = spec.name.clone();
    let final_state = children::supervise(spec, stop).await;
    info!(name = %name, ?final_state, "subprocess supervision ended");
}

fn spawn_refresh_loop(
    service: Arc<ModelService>,
    interval: std::time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match service.reload().await {
                        Ok(model) => {
                            info!(model_version = %model.version(), "periodic model refresh");
                        }
                        Err(_) => {
                            // Keep serving with the model we have.
                            warn!("periodic refresh found no loadable model; keeping current");
                        }
                    }
                }
                _ = stop.changed() => return,
            }
        }
    });
}

async fn wait_for_shutdown_signal() -> Result<(), String> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())
            .map_err(|e| format!("failed to register SIGTERM handler: {e}"))?;
        let mut sigint = signal(SignalKind::interrupt())
            .map_err(|e| format!("failed to register SIGINT handler: {e}"))?;
        tokio::select! {
            _ = sigterm.recv() => {}
            _ = sigint.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| format!("failed to register ctrl-c handler: {e}"))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::tempdir;

    fn registry_at(root: PathBuf) -> RegistryConfig {
        RegistryConfig {
            root,
            ..RegistryConfig::default()
        }
    }

    #[tokio::test]
    async fn ensure_initial_model_bootstraps_an_empty_registry() {
        let tmp = tempdir().expect("tempdir");
        let registry = registry_at(tmp.path().to_path_buf());
        std::fs::create_dir_all(registry.experiment_dir()).expect("mkdir");

        ensure_initial_model(&registry).await.expect("bootstrap");
        assert!(scan(&registry).has_valid_candidate());
    }

    #[tokio::test]
    async fn ensure_initial_model_leaves_existing_registries_alone() {
        let tmp = tempdir().expect("tempdir");
        let registry = registry_at(tmp.path().to_path_buf());
        train_bootstrap(&registry, &TrainOptions::default()).expect("seed model");
        let before = scan(&registry);

        ensure_initial_model(&registry).await.expect("no-op");
        let after = scan(&registry);
        assert_eq!(before.candidates.len(), after.candidates.len());
    }
}
