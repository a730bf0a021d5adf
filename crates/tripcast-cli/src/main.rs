// SPDX-License-Identifier: Apache-2.0

mod children;
mod supervisor;

use clap::{Parser, Subcommand};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::ExitCode as ProcessExitCode;
use std::time::Duration;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use tripcast_core::{ExitCode, MachineError};
use tripcast_model::BoundingBox;
use tripcast_registry::{scan, train_bootstrap, RegistryConfig, TrainOptions};
use tripcast_server::{
    effective_config_payload, load_runtime_startup_config, validate_api_config, ApiConfig,
    RuntimeStartupConfig,
};

#[derive(Parser)]
#[command(name = "tripcast", version, about = "Taxi trip duration prediction service")]
struct Cli {
    /// Startup config file (.json/.yaml/.yml/.toml); CLI and env override it.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor: bootstrap when empty, load the best model, serve
    /// HTTP, and babysit the auxiliary subprocesses. The default command.
    Serve {
        #[arg(long)]
        port: Option<u16>,
        #[arg(long)]
        registry_root: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        print_effective_config: bool,
        #[arg(long, default_value_t = false)]
        validate_config: bool,
    },
    /// Run bootstrap training once and exit.
    Train {
        #[arg(long)]
        registry_root: Option<PathBuf>,
        #[arg(long, default_value_t = 2048)]
        samples: usize,
        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
    /// Print the ranked registry scan and exit. Exit code 3 when no valid
    /// candidate exists.
    Scan {
        #[arg(long)]
        registry_root: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

#[derive(Debug)]
pub enum CliError {
    Config(String),
    NoModel(String),
    Generic(String),
}

impl CliError {
    const fn exit_code(&self) -> ExitCode {
        match self {
            Self::Config(_) => ExitCode::Config,
            Self::NoModel(_) => ExitCode::NoModel,
            Self::Generic(_) => ExitCode::Generic,
        }
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) | Self::NoModel(msg) | Self::Generic(msg) => write!(f, "{msg}"),
        }
    }
}

fn main() -> ProcessExitCode {
    init_tracing();
    match run() {
        Ok(()) => ProcessExitCode::from(ExitCode::Success as u8),
        Err(err) => {
            let exit = err.exit_code();
            if env_bool("TRIPCAST_LOG_JSON", false) {
                let envelope = MachineError::new(exit.as_str(), &err.to_string());
                eprintln!(
                    "{}",
                    serde_json::to_string(&envelope).unwrap_or_else(|_| err.to_string())
                );
            } else {
                eprintln!("tripcast: {err}");
            }
            ProcessExitCode::from(exit as u8)
        }
    }
}

fn run() -> Result<(), CliError> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Commands::Serve {
        port: None,
        registry_root: None,
        print_effective_config: false,
        validate_config: false,
    });

    match command {
        Commands::Serve {
            port,
            registry_root,
            print_effective_config,
            validate_config,
        } => {
            let startup = resolve_startup(cli.config.as_deref(), port, registry_root.as_deref())?;
            let api = api_config_from_env()?;
            let registry = registry_from_startup(&startup)?;
            if validate_config {
                info!("configuration validated");
                return Ok(());
            }
            if print_effective_config {
                let payload = effective_config_payload(&startup, &api)
                    .map_err(CliError::Generic)?;
                println!(
                    "{}",
                    serde_json::to_string_pretty(&payload)
                        .map_err(|err| CliError::Generic(format!("render config: {err}")))?
                );
                return Ok(());
            }
            supervisor::run_serve(supervisor::ServeOptions {
                api_port: startup.api_port,
                api,
                registry,
                disable_subprocesses: env_bool("DISABLE_SUBPROCESSES", false),
                dashboard_port: env_u16("DASHBOARD_PORT", 8506)?,
                tracking_ui_port: env_u16("TRACKING_UI_PORT", 5000)?,
            })
        }
        Commands::Train {
            registry_root,
            samples,
            seed,
        } => {
            let startup = resolve_startup(cli.config.as_deref(), None, registry_root.as_deref())?;
            let registry = registry_from_startup(&startup)?;
            let report = train_bootstrap(&registry, &TrainOptions { samples, seed })
                .map_err(|e| CliError::Generic(e.to_string()))?;
            println!(
                "{}",
                serde_json::json!({
                    "run_id": report.run_id,
                    "rmse": report.rmse,
                    "mae": report.mae,
                    "r2_score": report.r2_score,
                    "model_dir": report.model_dir,
                })
            );
            Ok(())
        }
        Commands::Scan {
            registry_root,
            json,
        } => {
            let startup = resolve_startup(cli.config.as_deref(), None, registry_root.as_deref())?;
            let registry = registry_from_startup(&startup)?;
            let result = scan(&registry);
            if json {
                let rows: Vec<_> = result
                    .candidates
                    .iter()
                    .map(|c| {
                        serde_json::json!({
                            "run_id": c.run_id,
                            "path": c.path,
                            "rmse": c.rmse,
                            "trained_at": c.trained_at,
                            "valid": c.valid,
                        })
                    })
                    .collect();
                println!(
                    "{}",
                    serde_json::to_string_pretty(&rows)
                        .map_err(|err| CliError::Generic(format!("render scan: {err}")))?
                );
            } else {
                for c in &result.candidates {
                    let rmse = c
                        .rmse
                        .map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
                    println!(
                        "run={} rmse={} valid={} path={}",
                        c.run_id,
                        rmse,
                        c.valid,
                        c.path.display()
                    );
                }
            }
            if result.has_valid_candidate() {
                Ok(())
            } else {
                Err(CliError::NoModel(
                    "no valid model artifact found in the registry".to_string(),
                ))
            }
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if env_bool("TRIPCAST_LOG_JSON", false) {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

/// The project root is derived from the executable's location, never the
/// current working directory: subprocesses get launched from arbitrary
/// directories and relative paths broke exactly this way before.
fn project_root() -> Result<PathBuf, CliError> {
    let exe = env::current_exe()
        .map_err(|e| CliError::Config(format!("cannot resolve executable path: {e}")))?;
    let dir = exe
        .parent()
        .ok_or_else(|| CliError::Config("executable has no parent directory".to_string()))?;
    Ok(dir.to_path_buf())
}

fn resolve_startup(
    config_path: Option<&Path>,
    cli_port: Option<u16>,
    cli_registry_root: Option<&Path>,
) -> Result<RuntimeStartupConfig, CliError> {
    load_runtime_startup_config(config_path, cli_port, cli_registry_root).map_err(CliError::Config)
}

fn registry_from_startup(startup: &RuntimeStartupConfig) -> Result<RegistryConfig, CliError> {
    let root = if startup.registry_root.is_absolute() {
        startup.registry_root.clone()
    } else {
        project_root()?.join(&startup.registry_root)
    };
    Ok(RegistryConfig {
        root,
        experiment_id: startup.experiment_id.clone(),
        model_name: startup.model_name.clone(),
    })
}

fn api_config_from_env() -> Result<ApiConfig, CliError> {
    let mut api = ApiConfig {
        predict_timeout: env_duration_ms("PREDICTION_TIMEOUT_MS", 2000)?,
        health_timeout: env_duration_ms("HEALTH_TIMEOUT_MS", 1000)?,
        refresh_interval: env_duration_ms("MODEL_REFRESH_INTERVAL_MS", 300_000)?,
        shutdown_grace: env_duration_ms("SHUTDOWN_GRACE_MS", 10_000)?,
        ..ApiConfig::default()
    };
    if let Ok(raw) = env::var("BOUNDING_BOX") {
        api.bounding_box = BoundingBox::parse(&raw).map_err(CliError::Config)?;
    }
    validate_api_config(&api).map_err(CliError::Config)?;
    Ok(api)
}

fn env_bool(name: &str, default: bool) -> bool {
    env::var(name)
        .ok()
        .and_then(|v| match v.as_str() {
            "1" | "true" | "TRUE" | "yes" | "YES" => Some(true),
            "0" | "false" | "FALSE" | "no" | "NO" => Some(false),
            _ => None,
        })
        .unwrap_or(default)
}

fn env_u16(name: &str, default: u16) -> Result<u16, CliError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u16>()
            .map_err(|e| CliError::Config(format!("invalid {name} {raw:?}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_duration_ms(name: &str, default_ms: u64) -> Result<Duration, CliError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| CliError::Config(format!("invalid {name} {raw:?}: {e}"))),
        Err(_) => Ok(Duration::from_millis(default_ms)),
    }
}
