// SPDX-License-Identifier: Apache-2.0

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use tracing::warn;

use tripcast_model::{
    build_features, BoundingBox, DurationUnit, FeatureVector, PredictorFault, TripRequest,
    ValidationError,
};
use tripcast_registry::{select_best, LoadedModel, NoModelAvailable, RegistryConfig};

const MAX_DURATION_MINUTES: f64 = 600.0;

/// Owns the single mutable resource of the whole service: the currently
/// loaded model. Many concurrent readers, one writer on reload; readers
/// clone the `Arc` and drop the guard before running inference, so a swap
/// never waits on in-flight predictions and an old model lives exactly as
/// long as its last reader.
pub struct ModelService {
    registry: RegistryConfig,
    slot: RwLock<Option<Arc<LoadedModel>>>,
    started_at: Instant,
}

/// Everything the prediction hot path can fail with. None of these evict
/// the loaded model or panic the process.
#[derive(Debug)]
pub enum PredictError {
    NotInitialized,
    Validation(ValidationError),
    Predictor(PredictorFault),
}

impl fmt::Display for PredictError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotInitialized => write!(f, "no model loaded"),
            Self::Validation(e) => write!(f, "{e}"),
            Self::Predictor(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for PredictError {}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub predicted_duration_minutes: f64,
    pub confidence_score: f64,
    pub model_version: String,
    pub prediction_timestamp: DateTime<Utc>,
    pub features_used: FeatureVector,
}

impl ModelService {
    #[must_use]
    pub fn new(registry: RegistryConfig) -> Self {
        Self {
            registry,
            slot: RwLock::new(None),
            started_at: Instant::now(),
        }
    }

    /// The current model, if any. Used by health and model-info endpoints.
    pub async fn current(&self) -> Option<Arc<LoadedModel>> {
        self.slot.read().await.clone()
    }

    #[must_use]
    pub fn uptime_seconds(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }

    /// Re-runs the registry scan and swaps the slot. The scan and
    /// deserialization happen on the blocking pool outside the critical
    /// section; the write lock is held only for the pointer swap. When the
    /// registry has nothing loadable the existing model stays in place.
    pub async fn reload(&self) -> Result<Arc<LoadedModel>, NoModelAvailable> {
        let registry = self.registry.clone();
        let loaded = tokio::task::spawn_blocking(move || select_best(&registry))
            .await
            .map_err(|e| {
                warn!(error = %e, "registry scan task failed");
                NoModelAvailable
            })??;
        let model = Arc::new(loaded);
        *self.slot.write().await = Some(model.clone());
        Ok(model)
    }

    /// The hot path: validate, build features, run the cached predictor.
    pub async fn predict(
        &self,
        req: &TripRequest,
        bbox: &BoundingBox,
    ) -> Result<Prediction, PredictError> {
        let model = self
            .current()
            .await
            .ok_or(PredictError::NotInitialized)?;
        let features = build_features(req, bbox).map_err(PredictError::Validation)?;
        let raw = model
            .predictor
            .predict(&features.as_array())
            .map_err(PredictError::Predictor)?;

        let minutes = to_minutes(raw, model.unit, &model.run_id);
        Ok(Prediction {
            predicted_duration_minutes: round2(minutes.clamp(0.0, MAX_DURATION_MINUTES)),
            confidence_score: confidence_score(&features),
            model_version: model.version(),
            prediction_timestamp: Utc::now(),
            features_used: features,
        })
    }
}

/// The training pipeline is not consistent about output units across model
/// families. The metadata declaration is authoritative; without one we fall
/// back to the documented heuristic and say so in the log.
fn to_minutes(raw: f64, unit: Option<DurationUnit>, run_id: &str) -> f64 {
    match unit {
        Some(DurationUnit::Minutes) => raw,
        Some(DurationUnit::Seconds) => raw / 60.0,
        None => {
            warn!(
                run_id,
                raw, "model metadata does not declare a duration unit; applying >60-is-seconds heuristic"
            );
            if raw > 60.0 {
                raw / 60.0
            } else {
                raw
            }
        }
    }
}

/// Fixed confidence heuristic (not a calibrated probability). Computed in
/// integer milli-units so the three-decimal wire values are exact:
/// 0.85 × 0.95 must surface as 0.808, not 0.807.
fn confidence_score(features: &FeatureVector) -> f64 {
    let mut millis: i64 = 850;
    if features.distance_km > 50.0 {
        millis = (millis * 9 + 5) / 10;
    }
    if features.is_rush_hour == 1 {
        millis = (millis * 95 + 50) / 100;
    }
    millis as f64 / 1000.0
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(distance_km: f64, is_rush_hour: u8) -> FeatureVector {
        FeatureVector {
            distance_km,
            passenger_count: 1,
            vendor_id: 1,
            hour_of_day: 12,
            day_of_week: 2,
            month: 3,
            is_weekend: 0,
            is_rush_hour,
        }
    }

    #[test]
    fn confidence_baseline_is_850() {
        assert_eq!(confidence_score(&features(5.0, 0)), 0.850);
    }

    #[test]
    fn confidence_rush_hour_is_exactly_808() {
        assert_eq!(confidence_score(&features(5.0, 1)), 0.808);
    }

    #[test]
    fn confidence_long_trip_is_765() {
        assert_eq!(confidence_score(&features(60.0, 0)), 0.765);
    }

    #[test]
    fn confidence_long_rush_trip_is_727() {
        assert_eq!(confidence_score(&features(60.0, 1)), 0.727);
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        for d in [0.0, 10.0, 51.0, 199.0] {
            for rush in [0, 1] {
                let c = confidence_score(&features(d, rush));
                assert!((0.0..=1.0).contains(&c));
            }
        }
    }

    #[test]
    fn declared_minutes_pass_through() {
        assert_eq!(to_minutes(45.0, Some(DurationUnit::Minutes), "r"), 45.0);
    }

    #[test]
    fn declared_seconds_convert() {
        assert_eq!(to_minutes(900.0, Some(DurationUnit::Seconds), "r"), 15.0);
    }

    #[test]
    fn heuristic_treats_large_values_as_seconds() {
        assert_eq!(to_minutes(90.0, None, "r"), 1.5);
        assert_eq!(to_minutes(45.0, None, "r"), 45.0);
        assert_eq!(to_minutes(60.0, None, "r"), 60.0);
    }

    #[test]
    fn round2_rounds_to_two_decimals() {
        assert_eq!(round2(4.3178), 4.32);
        assert_eq!(round2(0.0), 0.0);
    }
}
