use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Unit the predictor's raw output is expressed in. Declared by the
/// training pipeline in `metadata.json`; authoritative when present.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DurationUnit {
    Seconds,
    Minutes,
}

/// Sidecar descriptor stored next to every predictor blob. Unknown fields
/// are tolerated so newer trainers can annotate freely.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    pub rmse: f64,
    pub trained_at: DateTime<Utc>,
    pub feature_order: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<DurationUnit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mae: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r2_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictor_sha256: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorError(pub String);

impl fmt::Display for DescriptorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid model descriptor: {}", self.0)
    }
}

impl std::error::Error for DescriptorError {}

impl ModelDescriptor {
    pub fn validate(&self) -> Result<(), DescriptorError> {
        if !self.rmse.is_finite() || self.rmse < 0.0 {
            return Err(DescriptorError(format!(
                "rmse must be a finite non-negative number, got {}",
                self.rmse
            )));
        }
        if self.feature_order.is_empty() {
            return Err(DescriptorError("feature_order must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Resolved locations of one run's artifact tree:
/// `<root>/<experiment_id>/<run_id>/artifacts/<model_name>/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPaths {
    pub run_dir: PathBuf,
    pub model_dir: PathBuf,
    pub predictor: PathBuf,
    pub metadata: PathBuf,
}

#[must_use]
pub fn artifact_paths(
    root: &Path,
    experiment_id: &str,
    run_id: &str,
    model_name: &str,
) -> ArtifactPaths {
    let run_dir = root.join(experiment_id).join(run_id);
    let model_dir = run_dir.join("artifacts").join(model_name);
    ArtifactPaths {
        predictor: model_dir.join("predictor.json"),
        metadata: model_dir.join("metadata.json"),
        run_dir,
        model_dir,
    }
}
