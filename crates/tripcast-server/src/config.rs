// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use tripcast_model::BoundingBox;

pub const CONFIG_SCHEMA_VERSION: &str = "1";

/// Runtime knobs for the HTTP surface and prediction service.
#[derive(Debug, Clone, Serialize)]
pub struct ApiConfig {
    pub predict_timeout: Duration,
    pub health_timeout: Duration,
    pub refresh_interval: Duration,
    pub shutdown_grace: Duration,
    pub bounding_box: BoundingBox,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            predict_timeout: Duration::from_millis(2000),
            health_timeout: Duration::from_millis(1000),
            refresh_interval: Duration::from_millis(300_000),
            shutdown_grace: Duration::from_millis(10_000),
            bounding_box: BoundingBox::default(),
        }
    }
}

pub fn validate_api_config(api: &ApiConfig) -> Result<(), String> {
    if api.predict_timeout.is_zero() || api.health_timeout.is_zero() {
        return Err("request timeouts must be > 0".to_string());
    }
    if api.shutdown_grace.is_zero() {
        return Err("shutdown grace period must be > 0".to_string());
    }
    let bbox = &api.bounding_box;
    if bbox.min_lat >= bbox.max_lat || bbox.min_lon >= bbox.max_lon {
        return Err("bounding box must describe a non-empty area".to_string());
    }
    Ok(())
}

#[derive(Debug, Clone, Default, Deserialize)]
struct RuntimeStartupConfigFile {
    api_port: Option<u16>,
    registry_root: Option<PathBuf>,
    experiment_id: Option<String>,
    model_name: Option<String>,
}

/// Startup configuration resolved with precedence
/// `CLI > ENV > config file > defaults`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeStartupConfig {
    pub api_port: u16,
    pub registry_root: PathBuf,
    pub experiment_id: String,
    pub model_name: String,
}

const DEFAULT_API_PORT: u16 = 8000;
const DEFAULT_REGISTRY_ROOT: &str = "./data/mlruns";
const DEFAULT_EXPERIMENT_ID: &str = "1";
const DEFAULT_MODEL_NAME: &str = "models";

pub fn effective_config_payload(
    startup: &RuntimeStartupConfig,
    api: &ApiConfig,
) -> Result<serde_json::Value, String> {
    let startup_json =
        serde_json::to_value(startup).map_err(|err| format!("serialize startup config: {err}"))?;
    let api_json =
        serde_json::to_value(api).map_err(|err| format!("serialize api config: {err}"))?;
    Ok(serde_json::json!({
        "schema_version": 1,
        "kind": "tripcast_effective_config_v1",
        "startup": startup_json,
        "api": api_json
    }))
}

#[allow(clippy::too_many_arguments)]
fn resolve_runtime_startup_config(
    file_cfg: RuntimeStartupConfigFile,
    cli_api_port: Option<u16>,
    cli_registry_root: Option<&Path>,
    env_api_port: Option<u16>,
    env_registry_root: Option<PathBuf>,
    env_experiment_id: Option<String>,
    env_model_name: Option<String>,
) -> Result<RuntimeStartupConfig, String> {
    let api_port = cli_api_port
        .or(env_api_port)
        .or(file_cfg.api_port)
        .unwrap_or(DEFAULT_API_PORT);

    let registry_root = cli_registry_root
        .map(Path::to_path_buf)
        .or(env_registry_root)
        .or(file_cfg.registry_root)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_REGISTRY_ROOT));

    let experiment_id = env_experiment_id
        .or(file_cfg.experiment_id)
        .unwrap_or_else(|| DEFAULT_EXPERIMENT_ID.to_string());

    let model_name = env_model_name
        .or(file_cfg.model_name)
        .unwrap_or_else(|| DEFAULT_MODEL_NAME.to_string());

    if registry_root.as_os_str().is_empty() {
        return Err("runtime config registry_root must not be empty".to_string());
    }
    if experiment_id.trim().is_empty() || model_name.trim().is_empty() {
        return Err("runtime config experiment_id/model_name must not be empty".to_string());
    }

    Ok(RuntimeStartupConfig {
        api_port,
        registry_root,
        experiment_id,
        model_name,
    })
}

fn parse_runtime_startup_config_file(path: &Path) -> Result<RuntimeStartupConfigFile, String> {
    let text = std::fs::read_to_string(path).map_err(|err| {
        format!(
            "failed reading runtime config file {}: {err}",
            path.display()
        )
    })?;
    match path.extension().and_then(|v| v.to_str()) {
        Some("json") => serde_json::from_str(&text)
            .map_err(|err| format!("invalid runtime config json {}: {err}", path.display())),
        Some("yaml") | Some("yml") => serde_yaml::from_str(&text)
            .map_err(|err| format!("invalid runtime config yaml {}: {err}", path.display())),
        Some("toml") => toml::from_str(&text)
            .map_err(|err| format!("invalid runtime config toml {}: {err}", path.display())),
        _ => Err(format!(
            "unsupported runtime config extension for {} (expected .json/.yaml/.yml/.toml)",
            path.display()
        )),
    }
}

pub fn load_runtime_startup_config(
    config_path: Option<&Path>,
    cli_api_port: Option<u16>,
    cli_registry_root: Option<&Path>,
) -> Result<RuntimeStartupConfig, String> {
    let file_cfg = if let Some(path) = config_path {
        parse_runtime_startup_config_file(path)?
    } else {
        RuntimeStartupConfigFile::default()
    };
    let env_api_port = match std::env::var("API_PORT") {
        Ok(raw) => Some(
            raw.parse::<u16>()
                .map_err(|e| format!("invalid API_PORT {raw:?}: {e}"))?,
        ),
        Err(_) => None,
    };
    resolve_runtime_startup_config(
        file_cfg,
        cli_api_port,
        cli_registry_root,
        env_api_port,
        std::env::var("MODEL_REGISTRY_ROOT").ok().map(PathBuf::from),
        std::env::var("EXPERIMENT_ID").ok(),
        std::env::var("MODEL_NAME").ok(),
    )
}
