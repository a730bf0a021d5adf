use std::collections::HashMap;
use std::fs;
use std::sync::Arc;

use tempfile::tempdir;
use tokio::task::JoinSet;

use tripcast_model::{artifact_paths, BoundingBox, TripRequest, FEATURE_ORDER};
use tripcast_registry::RegistryConfig;
use tripcast_server::ModelService;

fn registry_at(root: &std::path::Path) -> RegistryConfig {
    RegistryConfig {
        root: root.to_path_buf(),
        ..RegistryConfig::default()
    }
}

fn write_model(cfg: &RegistryConfig, run_id: &str, rmse: f64) {
    let paths = artifact_paths(&cfg.root, &cfg.experiment_id, run_id, &cfg.model_name);
    fs::create_dir_all(&paths.model_dir).expect("mkdir");
    let mut weights = vec![0.0; FEATURE_ORDER.len()];
    weights[0] = 3.0;
    fs::write(
        &paths.predictor,
        serde_json::to_vec(&serde_json::json!({
            "type": "linear",
            "weights": weights,
            "intercept": 2.0,
        }))
        .expect("blob"),
    )
    .expect("write predictor");
    fs::write(
        &paths.metadata,
        serde_json::to_vec(&serde_json::json!({
            "rmse": rmse,
            "trained_at": "2024-03-01T09:00:00Z",
            "feature_order": FEATURE_ORDER,
            "unit": "minutes",
        }))
        .expect("metadata"),
    )
    .expect("write metadata");
}

fn request() -> TripRequest {
    TripRequest {
        pickup_latitude: 40.7580,
        pickup_longitude: -73.9855,
        dropoff_latitude: 40.7614,
        dropoff_longitude: -73.9776,
        passenger_count: 1,
        vendor_id: 1,
        pickup_datetime: "2024-03-14T12:00:00".to_string(),
    }
}

/// 100 concurrent predictions interleaved with a reload that swaps in a
/// better model: every response must be well-formed and reference exactly
/// one of the two versions, never a torn mixture.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_predictions_across_reload_never_tear() {
    let tmp = tempdir().expect("tempdir");
    let cfg = registry_at(tmp.path());
    write_model(&cfg, "old-aaaa-11111111", 6.5);

    let service = Arc::new(ModelService::new(cfg.clone()));
    service.reload().await.expect("initial reload");

    let mut tasks = JoinSet::new();
    for i in 0..100u32 {
        let worker_service = service.clone();
        tasks.spawn(async move {
            if i % 10 == 3 {
                tokio::task::yield_now().await;
            }
            worker_service
                .predict(&request(), &BoundingBox::default())
                .await
                .expect("predict")
        });
        if i == 50 {
            write_model(&cfg, "new-bbbb-22222222", 5.0);
            service.reload().await.expect("mid-flight reload");
        }
    }

    let mut version_counts: HashMap<String, usize> = HashMap::new();
    while let Some(joined) = tasks.join_next().await {
        let prediction = joined.expect("task");
        assert!(prediction.predicted_duration_minutes >= 0.0);
        assert!(prediction.predicted_duration_minutes <= 600.0);
        assert!((0.0..=1.0).contains(&prediction.confidence_score));
        *version_counts.entry(prediction.model_version).or_insert(0) += 1;
    }

    let total: usize = version_counts.values().sum();
    assert_eq!(total, 100);
    for version in version_counts.keys() {
        assert!(
            version == "old-aaaa" || version == "new-bbbb",
            "version {version} is neither the old nor the new model"
        );
    }
}

/// A runtime reload that finds nothing loadable keeps the existing model.
#[tokio::test]
async fn failed_reload_keeps_the_current_model() {
    let tmp = tempdir().expect("tempdir");
    let cfg = registry_at(tmp.path());
    write_model(&cfg, "survivor-99999", 6.0);

    let service = Arc::new(ModelService::new(cfg.clone()));
    service.reload().await.expect("initial reload");

    fs::remove_dir_all(cfg.experiment_dir()).expect("wipe registry");
    assert!(service.reload().await.is_err());

    let current = service.current().await.expect("model still loaded");
    assert_eq!(current.version(), "survivor");
    let prediction = service
        .predict(&request(), &BoundingBox::default())
        .await
        .expect("predict still works");
    assert_eq!(prediction.model_version, "survivor");
}

/// The old model object stays alive for readers that grabbed it before the
/// swap, then drops with its last reference.
#[tokio::test]
async fn old_model_outlives_swap_for_held_references() {
    let tmp = tempdir().expect("tempdir");
    let cfg = registry_at(tmp.path());
    write_model(&cfg, "first-gen-0000", 6.0);

    let service = Arc::new(ModelService::new(cfg.clone()));
    let first = service.reload().await.expect("first reload");

    write_model(&cfg, "second-gen-000", 5.0);
    let second = service.reload().await.expect("second reload");
    assert_ne!(first.run_id, second.run_id);

    // The pre-swap handle still predicts with the old weights.
    let features = [1.0, 1.0, 1.0, 12.0, 2.0, 6.0, 0.0, 0.0];
    assert!(first.predictor.predict(&features).is_ok());
    assert_eq!(
        service.current().await.expect("current").run_id,
        second.run_id
    );
}
