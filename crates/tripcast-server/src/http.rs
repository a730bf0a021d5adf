// SPDX-License-Identifier: Apache-2.0

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{error, info};

use tripcast_model::TripRequest;

use crate::config::ApiConfig;
use crate::service::{ModelService, PredictError};

#[derive(Clone)]
pub struct AppState {
    pub service: Arc<ModelService>,
    pub api: Arc<ApiConfig>,
    pub metrics: Arc<RequestMetrics>,
    pub request_id_seed: Arc<AtomicU64>,
    pub accepting_requests: Arc<AtomicBool>,
}

impl AppState {
    #[must_use]
    pub fn new(service: Arc<ModelService>, api: ApiConfig) -> Self {
        Self {
            service,
            api: Arc::new(api),
            metrics: Arc::new(RequestMetrics::default()),
            request_id_seed: Arc::new(AtomicU64::new(1)),
            accepting_requests: Arc::new(AtomicBool::new(true)),
        }
    }

    pub fn begin_shutdown(&self) {
        self.accepting_requests.store(false, Ordering::Relaxed);
    }
}

/// Per-route request counts and latencies, kept in process for the
/// operator's benefit. Not an observability layer; just enough to answer
/// "what has this pod been doing".
#[derive(Default)]
pub struct RequestMetrics {
    counts: Mutex<HashMap<(String, u16), u64>>,
    latency_ns: Mutex<HashMap<String, Vec<u64>>>,
}

impl RequestMetrics {
    pub async fn observe_request(&self, route: &str, status: StatusCode, latency: Duration) {
        let mut counts = self.counts.lock().await;
        *counts
            .entry((route.to_string(), status.as_u16()))
            .or_insert(0) += 1;
        drop(counts);
        let mut latency_map = self.latency_ns.lock().await;
        latency_map
            .entry(route.to_string())
            .or_default()
            .push(latency.as_nanos() as u64);
    }

    pub async fn count_for(&self, route: &str, status: u16) -> u64 {
        let counts = self.counts.lock().await;
        counts.get(&(route.to_string(), status)).copied().unwrap_or(0)
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing_handler))
        .route("/api/v1/predict", post(predict_handler))
        .route("/api/v1/health", get(health_handler))
        .route("/api/v1/health/model", get(model_info_handler))
        .route("/api/v1/model-info", get(model_info_handler))
        .route("/api/v1/model/reload", post(reload_handler))
        .with_state(state)
}

fn api_error(status: StatusCode, error_kind: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"error_kind": error_kind, "message": message})),
    )
        .into_response()
}

fn make_request_id(state: &AppState) -> String {
    format!(
        "req-{:016x}",
        state.request_id_seed.fetch_add(1, Ordering::Relaxed)
    )
}

fn propagated_request_id(headers: &HeaderMap, state: &AppState) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(ToString::to_string)
        .unwrap_or_else(|| make_request_id(state))
}

fn with_request_id(mut resp: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        resp.headers_mut().insert("x-request-id", value);
    }
    resp
}

fn is_draining(state: &AppState) -> bool {
    !state.accepting_requests.load(Ordering::Relaxed)
}

async fn landing_handler(State(state): State<AppState>) -> impl IntoResponse {
    let started = Instant::now();
    let model_loaded = state.service.current().await.is_some();
    let resp = Json(json!({
        "service": "tripcast",
        "version": env!("CARGO_PKG_VERSION"),
        "model_loaded": model_loaded,
        "endpoints": {
            "predict": "/api/v1/predict",
            "health": "/api/v1/health",
            "model_info": "/api/v1/health/model",
            "reload": "/api/v1/model/reload"
        }
    }))
    .into_response();
    state
        .metrics
        .observe_request("/", StatusCode::OK, started.elapsed())
        .await;
    resp
}

async fn predict_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let started = Instant::now();
    let request_id = propagated_request_id(&headers, &state);
    let route = "/api/v1/predict";

    if is_draining(&state) {
        let resp = api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "ServiceStopping",
            "server is shutting down; refusing new requests",
        );
        state
            .metrics
            .observe_request(route, StatusCode::SERVICE_UNAVAILABLE, started.elapsed())
            .await;
        return with_request_id(resp, &request_id);
    }

    let is_json = headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("application/json"));
    if !is_json {
        let resp = api_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            "UnsupportedMediaType",
            "content-type must be application/json",
        );
        state
            .metrics
            .observe_request(route, StatusCode::UNSUPPORTED_MEDIA_TYPE, started.elapsed())
            .await;
        return with_request_id(resp, &request_id);
    }

    // Parsed by hand so a missing field is a 400 with our envelope, not a
    // framework rejection.
    let request: TripRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            let resp = api_error(StatusCode::BAD_REQUEST, "InvalidRequest", &e.to_string());
            state
                .metrics
                .observe_request(route, StatusCode::BAD_REQUEST, started.elapsed())
                .await;
            return with_request_id(resp, &request_id);
        }
    };

    let outcome = timeout(
        state.api.predict_timeout,
        state.service.predict(&request, &state.api.bounding_box),
    )
    .await;

    let resp = match outcome {
        Err(_) => api_error(
            StatusCode::GATEWAY_TIMEOUT,
            "Timeout",
            "prediction exceeded its deadline",
        ),
        Ok(Ok(prediction)) => {
            info!(
                request_id = %request_id,
                model_version = %prediction.model_version,
                duration_min = prediction.predicted_duration_minutes,
                distance_km = prediction.features_used.distance_km,
                "prediction served"
            );
            (StatusCode::OK, Json(prediction)).into_response()
        }
        Ok(Err(PredictError::Validation(e))) => {
            api_error(StatusCode::BAD_REQUEST, e.kind(), &e.to_string())
        }
        Ok(Err(PredictError::NotInitialized)) => api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "NoModelAvailable",
            "no model is loaded; try again after training completes",
        ),
        Ok(Err(PredictError::Predictor(fault))) => {
            error!(request_id = %request_id, fault = %fault, "predictor fault");
            api_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "PredictorFault",
                "prediction failed",
            )
        }
    };
    let status = resp.status();
    state
        .metrics
        .observe_request(route, status, started.elapsed())
        .await;
    with_request_id(resp, &request_id)
}

async fn health_handler(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let request_id = make_request_id(&state);
    let route = "/api/v1/health";

    let outcome = timeout(state.api.health_timeout, async {
        let model_loaded = state.service.current().await.is_some();
        Json(json!({
            "status": if model_loaded { "healthy" } else { "degraded" },
            "model_loaded": model_loaded,
            "uptime_seconds": state.service.uptime_seconds(),
        }))
        .into_response()
    })
    .await;

    let resp = outcome.unwrap_or_else(|_| {
        api_error(
            StatusCode::GATEWAY_TIMEOUT,
            "Timeout",
            "health check exceeded its deadline",
        )
    });
    let status = resp.status();
    state
        .metrics
        .observe_request(route, status, started.elapsed())
        .await;
    with_request_id(resp, &request_id)
}

async fn model_info_handler(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let request_id = make_request_id(&state);
    let route = "/api/v1/health/model";

    let outcome = timeout(state.api.health_timeout, state.service.current()).await;
    let resp = match outcome {
        Err(_) => api_error(
            StatusCode::GATEWAY_TIMEOUT,
            "Timeout",
            "model info exceeded its deadline",
        ),
        Ok(Some(model)) => Json(json!({
            "model_version": model.version(),
            "rmse": model.rmse,
            "loaded_at": model.loaded_at,
            "feature_order": model.feature_order,
        }))
        .into_response(),
        Ok(None) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no_model"})),
        )
            .into_response(),
    };
    let status = resp.status();
    state
        .metrics
        .observe_request(route, status, started.elapsed())
        .await;
    with_request_id(resp, &request_id)
}

async fn reload_handler(State(state): State<AppState>) -> Response {
    let started = Instant::now();
    let request_id = make_request_id(&state);
    let route = "/api/v1/model/reload";

    let resp = match state.service.reload().await {
        Ok(model) => {
            info!(request_id = %request_id, model_version = %model.version(), "model reloaded");
            Json(json!({
                "status": "reloaded",
                "model_version": model.version(),
                "rmse": model.rmse,
                "loaded_at": model.loaded_at,
                "feature_order": model.feature_order,
            }))
            .into_response()
        }
        Err(_) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"error": "no_model"})),
        )
            .into_response(),
    };
    let status = resp.status();
    state
        .metrics
        .observe_request(route, status, started.elapsed())
        .await;
    with_request_id(resp, &request_id)
}
