use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use tripcast_core::sha256_hex;
use tripcast_model::{
    artifact_paths, load_predictor, DurationUnit, ModelDescriptor, Predictor,
};

use crate::RegistryConfig;

/// One run directory observed during a scan. Runs missing either the
/// predictor blob or the metadata sidecar never become candidates; runs
/// whose metadata is present but unusable are kept with `valid = false` so
/// the `scan` subcommand can show why they were passed over.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub run_id: String,
    pub path: PathBuf,
    pub rmse: Option<f64>,
    pub trained_at: Option<DateTime<Utc>>,
    pub valid: bool,
    pub descriptor: Option<ModelDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScanResult {
    pub candidates: Vec<Candidate>,
}

impl ScanResult {
    pub fn valid(&self) -> impl Iterator<Item = &Candidate> {
        self.candidates.iter().filter(|c| c.valid)
    }

    #[must_use]
    pub fn has_valid_candidate(&self) -> bool {
        self.candidates.iter().any(|c| c.valid)
    }
}

/// A deserialized predictor plus the provenance the service reports for it.
/// Replaced atomically on reload; never mutated in place.
pub struct LoadedModel {
    pub predictor: Box<dyn Predictor>,
    pub run_id: String,
    pub rmse: f64,
    pub unit: Option<DurationUnit>,
    pub model_type: Option<String>,
    pub feature_order: Vec<String>,
    pub loaded_at: DateTime<Utc>,
}

impl LoadedModel {
    /// Short run identifier reported as `model_version`.
    #[must_use]
    pub fn version(&self) -> String {
        self.run_id.chars().take(8).collect()
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("run_id", &self.run_id)
            .field("rmse", &self.rmse)
            .field("unit", &self.unit)
            .field("predictor_kind", &self.predictor.kind())
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NoModelAvailable;

impl fmt::Display for NoModelAvailable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "no valid model artifact is available in the registry")
    }
}

impl std::error::Error for NoModelAvailable {}

/// Enumerates and ranks run directories one level below the experiment dir.
/// Every I/O failure downgrades the affected candidate; none aborts the
/// scan. Two scans over an unchanged tree return identical results.
#[must_use]
pub fn scan(cfg: &RegistryConfig) -> ScanResult {
    let experiment_dir = cfg.experiment_dir();
    let entries = match fs::read_dir(&experiment_dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(
                experiment_dir = %experiment_dir.display(),
                error = %e,
                "registry experiment directory is not readable; treating as empty"
            );
            return ScanResult::default();
        }
    };

    let mut candidates = Vec::new();
    for entry in entries {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable registry entry");
                continue;
            }
        };
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if !is_dir {
            continue;
        }
        let run_id = entry.file_name().to_string_lossy().to_string();
        if let Some(candidate) = probe_run(cfg, &run_id) {
            candidates.push(candidate);
        }
    }

    candidates.sort_by(rank);
    ScanResult { candidates }
}

/// Incomplete runs (blob or metadata missing) are skipped without comment;
/// half-written trees are routine while training is in flight.
fn probe_run(cfg: &RegistryConfig, run_id: &str) -> Option<Candidate> {
    let paths = artifact_paths(&cfg.root, &cfg.experiment_id, run_id, &cfg.model_name);
    if !paths.predictor.is_file() || !paths.metadata.is_file() {
        debug!(run_id, "skipping incomplete run");
        return None;
    }

    let mut candidate = Candidate {
        run_id: run_id.to_string(),
        path: paths.model_dir.clone(),
        rmse: None,
        trained_at: None,
        valid: false,
        descriptor: None,
    };

    let raw = match fs::read(&paths.metadata) {
        Ok(raw) => raw,
        Err(e) => {
            warn!(run_id, error = %e, "metadata unreadable; candidate invalid");
            return Some(candidate);
        }
    };
    let descriptor: ModelDescriptor = match serde_json::from_slice(&raw) {
        Ok(descriptor) => descriptor,
        Err(e) => {
            warn!(run_id, error = %e, "metadata unparseable; candidate invalid");
            return Some(candidate);
        }
    };
    if let Err(e) = descriptor.validate() {
        warn!(run_id, error = %e, "metadata rejected; candidate invalid");
        candidate.trained_at = Some(descriptor.trained_at);
        return Some(candidate);
    }
    if let Some(expected) = descriptor.predictor_sha256.as_deref() {
        match fs::read(&paths.predictor) {
            Ok(blob) => {
                let actual = sha256_hex(&blob);
                if actual != expected {
                    warn!(run_id, expected = %expected, actual = %actual, "predictor checksum mismatch; candidate invalid");
                    candidate.rmse = Some(descriptor.rmse);
                    candidate.trained_at = Some(descriptor.trained_at);
                    return Some(candidate);
                }
            }
            Err(e) => {
                warn!(run_id, error = %e, "predictor unreadable; candidate invalid");
                return Some(candidate);
            }
        }
    }

    candidate.rmse = Some(descriptor.rmse);
    candidate.trained_at = Some(descriptor.trained_at);
    candidate.valid = true;
    candidate.descriptor = Some(descriptor);
    Some(candidate)
}

/// Ranking: best error metric first, newer training wins ties, run id as a
/// deterministic last resort. Invalid candidates sink to the bottom.
fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    match (a.valid, b.valid) {
        (true, false) => return Ordering::Less,
        (false, true) => return Ordering::Greater,
        (false, false) => return a.run_id.cmp(&b.run_id),
        (true, true) => {}
    }
    let rmse_a = a.rmse.unwrap_or(f64::INFINITY);
    let rmse_b = b.rmse.unwrap_or(f64::INFINITY);
    rmse_a
        .partial_cmp(&rmse_b)
        .unwrap_or(Ordering::Equal)
        .then_with(|| b.trained_at.cmp(&a.trained_at))
        .then_with(|| a.run_id.cmp(&b.run_id))
}

/// Scans, then deserializes candidates in rank order until one loads.
/// A candidate whose blob fails to deserialize is demoted, not fatal;
/// `select_best` fails only when nothing in the registry loads.
pub fn select_best(cfg: &RegistryConfig) -> Result<LoadedModel, NoModelAvailable> {
    let result = scan(cfg);
    for candidate in result.valid() {
        let descriptor = match candidate.descriptor.as_ref() {
            Some(descriptor) => descriptor,
            None => continue,
        };
        let predictor_path = candidate.path.join("predictor.json");
        match load_predictor(&predictor_path) {
            Ok(predictor) => {
                let model = LoadedModel {
                    predictor,
                    run_id: candidate.run_id.clone(),
                    rmse: descriptor.rmse,
                    unit: descriptor.unit,
                    model_type: descriptor.model_type.clone(),
                    feature_order: descriptor.feature_order.clone(),
                    loaded_at: Utc::now(),
                };
                info!(
                    run_id = %model.run_id,
                    rmse = model.rmse,
                    kind = model.predictor.kind(),
                    "model selected"
                );
                return Ok(model);
            }
            Err(e) => {
                warn!(
                    run_id = %candidate.run_id,
                    error = %e,
                    "candidate failed to deserialize; trying next"
                );
            }
        }
    }
    Err(NoModelAvailable)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn candidate(run_id: &str, rmse: f64, ts: i64, valid: bool) -> Candidate {
        Candidate {
            run_id: run_id.to_string(),
            path: PathBuf::from("/tmp").join(run_id),
            rmse: Some(rmse),
            trained_at: Some(Utc.timestamp_opt(ts, 0).unwrap()),
            valid,
            descriptor: None,
        }
    }

    #[test]
    fn rank_prefers_lower_rmse() {
        let mut list = vec![candidate("b", 6.85, 100, true), candidate("a", 6.62, 50, true)];
        list.sort_by(rank);
        assert_eq!(list[0].run_id, "a");
    }

    #[test]
    fn rank_breaks_rmse_ties_with_newer_training() {
        let mut list = vec![candidate("old", 5.0, 100, true), candidate("new", 5.0, 200, true)];
        list.sort_by(rank);
        assert_eq!(list[0].run_id, "new");
    }

    #[test]
    fn rank_falls_back_to_run_id() {
        let mut list = vec![candidate("zzz", 5.0, 100, true), candidate("aaa", 5.0, 100, true)];
        list.sort_by(rank);
        assert_eq!(list[0].run_id, "aaa");
    }

    #[test]
    fn invalid_candidates_sink() {
        let mut list = vec![candidate("bad", 1.0, 100, false), candidate("good", 9.0, 100, true)];
        list.sort_by(rank);
        assert_eq!(list[0].run_id, "good");
        assert!(!list[1].valid);
    }
}
