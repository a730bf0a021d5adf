use chrono::Utc;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::fmt;
use std::fs;
use std::path::PathBuf;
use tracing::info;

use tripcast_core::sha256_hex;
use tripcast_model::{
    artifact_paths, haversine_km, load_predictor, DurationUnit, ModelDescriptor,
    PredictorPayload, FEATURE_COUNT, FEATURE_ORDER,
};

use crate::RegistryConfig;

/// One-shot training used when the registry is empty at startup, so the
/// service is functional from first start. Fits a least-squares linear
/// predictor on synthetic city trips; real training pipelines replace its
/// output the moment they publish a better run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainOptions {
    pub samples: usize,
    pub seed: u64,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            samples: 2048,
            seed: 42,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainReport {
    pub run_id: String,
    pub rmse: f64,
    pub mae: f64,
    pub r2_score: f64,
    pub model_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrainError {
    Io(String),
    Numeric(String),
    Verify(String),
}

impl fmt::Display for TrainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "bootstrap training I/O failed: {msg}"),
            Self::Numeric(msg) => write!(f, "bootstrap training diverged: {msg}"),
            Self::Verify(msg) => {
                write!(f, "bootstrap artifact failed load verification: {msg}")
            }
        }
    }
}

impl std::error::Error for TrainError {}

/// Trains, writes a fresh run into the registry, and load-verifies the
/// artifact before reporting success. An artifact that cannot be read back
/// is deleted and reported as failure; a bootstrap that "succeeds" with an
/// unloadable model would leave the service permanently degraded.
pub fn train_bootstrap(
    cfg: &RegistryConfig,
    opts: &TrainOptions,
) -> Result<TrainReport, TrainError> {
    let mut rng = StdRng::seed_from_u64(opts.seed);
    let samples = opts.samples.max(64);
    let (rows, targets) = synthesize_trips(&mut rng, samples);

    let split = (rows.len() * 4) / 5;
    let (weights, intercept) = fit_least_squares(&rows[..split], &targets[..split])?;
    let (rmse, mae, r2_score) =
        holdout_metrics(&rows[split..], &targets[split..], &weights, intercept);

    let run_id = uuid::Uuid::new_v4().simple().to_string();
    let paths = artifact_paths(&cfg.root, &cfg.experiment_id, &run_id, &cfg.model_name);
    fs::create_dir_all(&paths.model_dir)
        .map_err(|e| TrainError::Io(format!("{}: {e}", paths.model_dir.display())))?;

    let payload = PredictorPayload::Linear {
        weights: weights.to_vec(),
        intercept,
    };
    let blob = serde_json::to_vec_pretty(&payload)
        .map_err(|e| TrainError::Io(format!("serialize predictor: {e}")))?;
    fs::write(&paths.predictor, &blob)
        .map_err(|e| TrainError::Io(format!("{}: {e}", paths.predictor.display())))?;

    let descriptor = ModelDescriptor {
        rmse,
        trained_at: Utc::now(),
        feature_order: FEATURE_ORDER.iter().map(|s| (*s).to_string()).collect(),
        unit: Some(DurationUnit::Minutes),
        model_type: Some("LinearRegression".to_string()),
        mae: Some(mae),
        r2_score: Some(r2_score),
        predictor_sha256: Some(sha256_hex(&blob)),
    };
    let metadata = serde_json::to_vec_pretty(&descriptor)
        .map_err(|e| TrainError::Io(format!("serialize metadata: {e}")))?;
    fs::write(&paths.metadata, metadata)
        .map_err(|e| TrainError::Io(format!("{}: {e}", paths.metadata.display())))?;

    if let Err(e) = load_predictor(&paths.predictor) {
        let _ = fs::remove_dir_all(&paths.run_dir);
        return Err(TrainError::Verify(e.to_string()));
    }

    info!(
        run_id = %run_id,
        rmse,
        mae,
        r2 = r2_score,
        samples,
        "bootstrap training complete"
    );
    Ok(TrainReport {
        run_id,
        rmse,
        mae,
        r2_score,
        model_dir: paths.model_dir,
    })
}

/// Plausible city trips: endpoints drawn inside the default operating box,
/// duration driven by distance with rush-hour and weekend adjustments plus
/// bounded noise.
fn synthesize_trips(
    rng: &mut StdRng,
    samples: usize,
) -> (Vec<[f64; FEATURE_COUNT]>, Vec<f64>) {
    let mut rows = Vec::with_capacity(samples);
    let mut targets = Vec::with_capacity(samples);
    for _ in 0..samples {
        let pickup_lat = rng.gen_range(40.60..40.85);
        let pickup_lon = rng.gen_range(-74.02..-73.75);
        let dropoff_lat = rng.gen_range(40.60..40.85);
        let dropoff_lon = rng.gen_range(-74.02..-73.75);
        let distance_km = haversine_km(pickup_lat, pickup_lon, dropoff_lat, dropoff_lon);

        let passenger_count = rng.gen_range(1..=6) as f64;
        let vendor_id = rng.gen_range(1..=2) as f64;
        let hour_of_day = rng.gen_range(0..24) as f64;
        let day_of_week = rng.gen_range(0..7) as f64;
        let month = rng.gen_range(1..=12) as f64;
        let is_weekend = if day_of_week >= 5.0 { 1.0 } else { 0.0 };
        let is_rush_hour = if matches!(hour_of_day as u32, 7..=9 | 17..=19) {
            1.0
        } else {
            0.0
        };

        let noise = rng.gen_range(-2.5..2.5);
        let duration_min = (4.0 + 3.1 * distance_km + 3.5 * is_rush_hour
            - 1.2 * is_weekend
            + 0.2 * passenger_count
            + noise)
            .max(1.0);

        rows.push([
            distance_km,
            passenger_count,
            vendor_id,
            hour_of_day,
            day_of_week,
            month,
            is_weekend,
            is_rush_hour,
        ]);
        targets.push(duration_min);
    }
    (rows, targets)
}

/// Ordinary least squares via the normal equations, with a small ridge term
/// for numeric stability. The last solved coefficient is the intercept.
fn fit_least_squares(
    rows: &[[f64; FEATURE_COUNT]],
    targets: &[f64],
) -> Result<([f64; FEATURE_COUNT], f64), TrainError> {
    const DIM: usize = FEATURE_COUNT + 1;
    let mut xtx = [[0.0f64; DIM]; DIM];
    let mut xty = [0.0f64; DIM];

    for (row, &target) in rows.iter().zip(targets.iter()) {
        let mut extended = [1.0f64; DIM];
        extended[..FEATURE_COUNT].copy_from_slice(row);
        for i in 0..DIM {
            for j in 0..DIM {
                xtx[i][j] += extended[i] * extended[j];
            }
            xty[i] += extended[i] * target;
        }
    }
    for (i, diag) in xtx.iter_mut().enumerate() {
        diag[i] += 1e-6;
    }

    let solution = solve_linear_system(&mut xtx, &mut xty)
        .ok_or_else(|| TrainError::Numeric("singular normal equations".to_string()))?;
    if solution.iter().any(|v| !v.is_finite()) {
        return Err(TrainError::Numeric("non-finite coefficients".to_string()));
    }

    let mut weights = [0.0f64; FEATURE_COUNT];
    weights.copy_from_slice(&solution[..FEATURE_COUNT]);
    Ok((weights, solution[FEATURE_COUNT]))
}

/// Gaussian elimination with partial pivoting over the (small, dense)
/// normal-equation system.
fn solve_linear_system<const N: usize>(
    matrix: &mut [[f64; N]; N],
    rhs: &mut [f64; N],
) -> Option<[f64; N]> {
    for col in 0..N {
        let pivot = (col..N).max_by(|&a, &b| {
            matrix[a][col]
                .abs()
                .partial_cmp(&matrix[b][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if matrix[pivot][col].abs() < 1e-12 {
            return None;
        }
        matrix.swap(col, pivot);
        rhs.swap(col, pivot);

        for row in (col + 1)..N {
            let factor = matrix[row][col] / matrix[col][col];
            for k in col..N {
                matrix[row][k] -= factor * matrix[col][k];
            }
            rhs[row] -= factor * rhs[col];
        }
    }

    let mut solution = [0.0f64; N];
    for col in (0..N).rev() {
        let mut acc = rhs[col];
        for k in (col + 1)..N {
            acc -= matrix[col][k] * solution[k];
        }
        solution[col] = acc / matrix[col][col];
    }
    Some(solution)
}

fn holdout_metrics(
    rows: &[[f64; FEATURE_COUNT]],
    targets: &[f64],
    weights: &[f64; FEATURE_COUNT],
    intercept: f64,
) -> (f64, f64, f64) {
    let n = rows.len().max(1) as f64;
    let mean_target = targets.iter().sum::<f64>() / n;

    let mut sq_err = 0.0;
    let mut abs_err = 0.0;
    let mut sq_total = 0.0;
    for (row, &target) in rows.iter().zip(targets.iter()) {
        let mut predicted = intercept;
        for (weight, value) in weights.iter().zip(row.iter()) {
            predicted += weight * value;
        }
        let err = predicted - target;
        sq_err += err * err;
        abs_err += err.abs();
        sq_total += (target - mean_target) * (target - mean_target);
    }

    let rmse = (sq_err / n).sqrt();
    let mae = abs_err / n;
    let r2 = if sq_total > 0.0 { 1.0 - sq_err / sq_total } else { 0.0 };
    (rmse, mae, r2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn least_squares_recovers_a_planted_linear_model() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut rows = Vec::new();
        let mut targets = Vec::new();
        for _ in 0..512 {
            let mut row = [0.0f64; FEATURE_COUNT];
            for value in &mut row {
                *value = rng.gen_range(-5.0..5.0);
            }
            // y = 2*x0 - x3 + 0.5, noiseless.
            targets.push(2.0 * row[0] - row[3] + 0.5);
            rows.push(row);
        }
        let (weights, intercept) = fit_least_squares(&rows, &targets).expect("fit");
        assert!((weights[0] - 2.0).abs() < 1e-3);
        assert!((weights[3] + 1.0).abs() < 1e-3);
        assert!((intercept - 0.5).abs() < 1e-3);
    }

    #[test]
    fn solve_rejects_singular_system() {
        let mut matrix = [[1.0, 1.0], [1.0, 1.0]];
        let mut rhs = [1.0, 2.0];
        assert!(solve_linear_system(&mut matrix, &mut rhs).is_none());
    }

    #[test]
    fn synthetic_trips_stay_in_feature_bounds() {
        let mut rng = StdRng::seed_from_u64(42);
        let (rows, targets) = synthesize_trips(&mut rng, 256);
        for (row, target) in rows.iter().zip(targets.iter()) {
            assert!((0.0..=200.0).contains(&row[0]), "distance {}", row[0]);
            assert!((1.0..=6.0).contains(&row[1]));
            assert!(row[3] < 24.0);
            assert!(*target >= 1.0);
        }
    }

    #[test]
    fn holdout_metrics_are_zero_for_perfect_fit() {
        let rows = vec![[1.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0]; 4];
        let targets = vec![3.0; 4];
        let weights = [3.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0];
        let (rmse, mae, r2) = holdout_metrics(&rows, &targets, &weights, 0.0);
        assert!(rmse.abs() < 1e-12);
        assert!(mae.abs() < 1e-12);
        // Constant targets leave no variance to explain.
        assert_eq!(r2, 0.0);
    }
}
