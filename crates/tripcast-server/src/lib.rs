#![forbid(unsafe_code)]

pub mod config;
pub mod http;
pub mod service;

pub use config::{
    effective_config_payload, load_runtime_startup_config, validate_api_config, ApiConfig,
    RuntimeStartupConfig,
};
pub use http::{build_router, AppState, RequestMetrics};
pub use service::{ModelService, PredictError, Prediction};

pub const CRATE_NAME: &str = "tripcast-server";
