#![forbid(unsafe_code)]

pub mod artifact;
pub mod features;
pub mod predictor;
pub mod request;

pub use artifact::{artifact_paths, ArtifactPaths, DurationUnit, ModelDescriptor};
pub use features::{build_features, haversine_km, FeatureVector, FEATURE_COUNT, FEATURE_ORDER};
pub use predictor::{
    load_predictor, Predictor, PredictorFault, PredictorFormat, PredictorLoadError,
    PredictorPayload,
};
pub use request::{BoundingBox, TripRequest, ValidationError};

pub const CRATE_NAME: &str = "tripcast-model";
