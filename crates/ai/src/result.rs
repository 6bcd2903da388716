use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Probability assigned to one output class.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassProbability {
    pub label: String,
    pub probability: f64,
}

/// Result of classifying one recording.
///
/// Opaque to the job pipeline: it is attached to a job as-is and returned to
/// callers once the job is `processed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceResult {
    /// Predicted class (one of the model's classes).
    pub label: String,

    /// Probability of the predicted class, in \[0, 1\].
    pub confidence: f64,

    /// Averaged probability for every class, in model order.
    pub probabilities: Vec<ClassProbability>,

    /// Positive-class probability for binary sigmoid models.
    pub raw_probability: Option<f64>,

    /// Number of windows the recording was split into.
    pub windows: usize,

    pub model_name: String,
    pub model_version: String,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum InferenceError {
    #[error("model unavailable: {0}")]
    ModelUnavailable(String),

    #[error("shape mismatch: expected {expected}, found {found}")]
    ShapeMismatch { expected: String, found: String },

    #[error("inference failed: {0}")]
    InferenceFailed(String),
}
