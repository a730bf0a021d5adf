use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

use crate::features::FEATURE_COUNT;

/// A trained regression model, reduced to the one contract the service
/// needs. Implementations are produced by format-specific deserializers;
/// raw blobs never leave this module.
pub trait Predictor: Send + Sync + fmt::Debug {
    /// Predicts a trip duration from a dense feature vector. The unit of the
    /// result is declared by the artifact's metadata, not by the predictor.
    fn predict(&self, features: &[f64; FEATURE_COUNT]) -> Result<f64, PredictorFault>;

    fn kind(&self) -> &'static str;
}

/// The underlying predictor misbehaved on a single request. Does not evict
/// the loaded model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PredictorFault(pub String);

impl fmt::Display for PredictorFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "predictor fault: {}", self.0)
    }
}

impl std::error::Error for PredictorFault {}

/// Why a predictor blob could not be turned into a [`Predictor`]. The
/// scanner demotes the candidate on any of these; none of them abort a scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PredictorLoadError {
    Io(String),
    UnrecognizedFormat(String),
    Malformed(String),
}

impl fmt::Display for PredictorLoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(msg) => write!(f, "predictor read failed: {msg}"),
            Self::UnrecognizedFormat(path) => {
                write!(f, "unrecognized predictor format: {path}")
            }
            Self::Malformed(msg) => write!(f, "malformed predictor blob: {msg}"),
        }
    }
}

impl std::error::Error for PredictorLoadError {}

/// Supported serialization formats, recognized by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictorFormat {
    Json,
}

impl PredictorFormat {
    #[must_use]
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

/// Serialized predictor payload. Tagged so future model families extend the
/// enum without touching existing blobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PredictorPayload {
    Linear { weights: Vec<f64>, intercept: f64 },
    Forest { trees: Vec<Tree> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tree {
    pub nodes: Vec<TreeNode>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TreeNode {
    Leaf {
        value: f64,
    },
    Split {
        feature: usize,
        threshold: f64,
        left: usize,
        right: usize,
    },
}

impl PredictorPayload {
    /// Validates structural invariants and produces the runtime predictor.
    pub fn into_predictor(self) -> Result<Box<dyn Predictor>, PredictorLoadError> {
        match self {
            Self::Linear { weights, intercept } => {
                if weights.len() != FEATURE_COUNT {
                    return Err(PredictorLoadError::Malformed(format!(
                        "linear model expects {FEATURE_COUNT} weights, got {}",
                        weights.len()
                    )));
                }
                if !intercept.is_finite() || weights.iter().any(|w| !w.is_finite()) {
                    return Err(PredictorLoadError::Malformed(
                        "linear model has non-finite coefficients".to_string(),
                    ));
                }
                let mut fixed = [0.0; FEATURE_COUNT];
                fixed.copy_from_slice(&weights);
                Ok(Box::new(LinearPredictor {
                    weights: fixed,
                    intercept,
                }))
            }
            Self::Forest { trees } => {
                if trees.is_empty() {
                    return Err(PredictorLoadError::Malformed(
                        "forest model has no trees".to_string(),
                    ));
                }
                for (tree_idx, tree) in trees.iter().enumerate() {
                    validate_tree(tree).map_err(|msg| {
                        PredictorLoadError::Malformed(format!("tree {tree_idx}: {msg}"))
                    })?;
                }
                Ok(Box::new(ForestPredictor { trees }))
            }
        }
    }
}

/// Child indices must point strictly forward so evaluation terminates on any
/// accepted tree.
fn validate_tree(tree: &Tree) -> Result<(), String> {
    if tree.nodes.is_empty() {
        return Err("empty node list".to_string());
    }
    for (idx, node) in tree.nodes.iter().enumerate() {
        match node {
            TreeNode::Leaf { value } => {
                if !value.is_finite() {
                    return Err(format!("node {idx} has non-finite leaf value"));
                }
            }
            TreeNode::Split {
                feature,
                threshold,
                left,
                right,
            } => {
                if *feature >= FEATURE_COUNT {
                    return Err(format!("node {idx} splits on unknown feature {feature}"));
                }
                if !threshold.is_finite() {
                    return Err(format!("node {idx} has non-finite threshold"));
                }
                if *left <= idx || *right <= idx || *left >= tree.nodes.len()
                    || *right >= tree.nodes.len()
                {
                    return Err(format!("node {idx} has out-of-order child indices"));
                }
            }
        }
    }
    Ok(())
}

/// Loads and validates a predictor blob, dispatching on the recognized
/// format.
pub fn load_predictor(path: &Path) -> Result<Box<dyn Predictor>, PredictorLoadError> {
    let format = PredictorFormat::from_path(path)
        .ok_or_else(|| PredictorLoadError::UnrecognizedFormat(path.display().to_string()))?;
    let bytes = std::fs::read(path)
        .map_err(|e| PredictorLoadError::Io(format!("{}: {e}", path.display())))?;
    match format {
        PredictorFormat::Json => {
            let payload: PredictorPayload = serde_json::from_slice(&bytes)
                .map_err(|e| PredictorLoadError::Malformed(e.to_string()))?;
            payload.into_predictor()
        }
    }
}

#[derive(Debug)]
struct LinearPredictor {
    weights: [f64; FEATURE_COUNT],
    intercept: f64,
}

impl Predictor for LinearPredictor {
    fn predict(&self, features: &[f64; FEATURE_COUNT]) -> Result<f64, PredictorFault> {
        let mut acc = self.intercept;
        for (weight, value) in self.weights.iter().zip(features.iter()) {
            acc += weight * value;
        }
        if acc.is_finite() {
            Ok(acc)
        } else {
            Err(PredictorFault("non-finite linear output".to_string()))
        }
    }

    fn kind(&self) -> &'static str {
        "linear"
    }
}

#[derive(Debug)]
struct ForestPredictor {
    trees: Vec<Tree>,
}

impl ForestPredictor {
    fn eval_tree(tree: &Tree, features: &[f64; FEATURE_COUNT]) -> Result<f64, PredictorFault> {
        let mut idx = 0usize;
        loop {
            match &tree.nodes[idx] {
                TreeNode::Leaf { value } => return Ok(*value),
                TreeNode::Split {
                    feature,
                    threshold,
                    left,
                    right,
                } => {
                    let value = features.get(*feature).copied().ok_or_else(|| {
                        PredictorFault(format!("split on missing feature {feature}"))
                    })?;
                    idx = if value <= *threshold { *left } else { *right };
                }
            }
        }
    }
}

impl Predictor for ForestPredictor {
    fn predict(&self, features: &[f64; FEATURE_COUNT]) -> Result<f64, PredictorFault> {
        let mut sum = 0.0;
        for tree in &self.trees {
            sum += Self::eval_tree(tree, features)?;
        }
        let mean = sum / self.trees.len() as f64;
        if mean.is_finite() {
            Ok(mean)
        } else {
            Err(PredictorFault("non-finite forest output".to_string()))
        }
    }

    fn kind(&self) -> &'static str {
        "forest"
    }
}
