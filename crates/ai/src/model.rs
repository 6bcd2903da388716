//! Serialized classifier artifact and its frozen, inference-only form.
//!
//! The artifact is a JSON document holding the architecture and trained
//! weights of a small feed-forward network over per-channel signal features
//! (see [`crate::features`]). Loading validates every dimension up front so a
//! loaded [`EegModel`] can never fail on shape during a forward pass.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::features::FEATURES_PER_CHANNEL;
use crate::result::InferenceError;

/// Seed used when an artifact does not declare one.
pub const DEFAULT_SEED: u64 = 42;

fn default_seed() -> u64 {
    DEFAULT_SEED
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model artifact not readable at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("model artifact is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("model artifact is inconsistent: {0}")]
    Invalid(String),
}

impl ModelError {
    fn invalid(msg: impl Into<String>) -> Self {
        Self::Invalid(msg.into())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Linear,
    Relu,
    Tanh,
    Sigmoid,
    Softmax,
}

impl Activation {
    fn apply(&self, values: &mut [f64]) {
        match self {
            Activation::Linear => {}
            Activation::Relu => values.iter_mut().for_each(|v| *v = v.max(0.0)),
            Activation::Tanh => values.iter_mut().for_each(|v| *v = v.tanh()),
            Activation::Sigmoid => values.iter_mut().for_each(|v| *v = sigmoid(*v)),
            Activation::Softmax => {
                let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
                let mut sum = 0.0;
                for v in values.iter_mut() {
                    *v = (*v - max).exp();
                    sum += *v;
                }
                values.iter_mut().for_each(|v| *v /= sum);
            }
        }
    }
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let e = x.exp();
        e / (1.0 + e)
    }
}

/// One network layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Layer {
    /// Fully connected layer. `weights` is `[outputs][inputs]`.
    Dense {
        weights: Vec<Vec<f64>>,
        bias: Vec<f64>,
        activation: Activation,
    },
    /// Identity at inference time; only meaningful while training.
    Dropout { rate: f64 },
}

/// Per-feature z-normalisation statistics captured at training time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureNorm {
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

/// On-disk model artifact (architecture + trained weights).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelArtifact {
    pub name: String,
    pub version: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Channel count the network was trained on.
    pub channels: usize,
    /// Samples per classification window.
    pub window_samples: usize,
    /// Output classes. Binary models with a single sigmoid unit score `classes[1]`.
    pub classes: Vec<String>,
    pub feature_norm: FeatureNorm,
    pub layers: Vec<Layer>,
}

impl ModelArtifact {
    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Synthetic reference artifact for tests and local development.
    ///
    /// Weights come from a SplitMix64 stream seeded with `seed`, so the same
    /// arguments always produce the same artifact.
    pub fn reference(channels: usize, window_samples: usize, seed: u64) -> Self {
        let inputs = channels * FEATURES_PER_CHANNEL;
        let hidden = 8;
        let mut rng = SplitMix64::new(seed);

        let mut dense = |outputs: usize, inputs: usize, scale: f64| {
            let weights: Vec<Vec<f64>> = (0..outputs)
                .map(|_| (0..inputs).map(|_| (rng.next_unit() - 0.5) * scale).collect())
                .collect();
            let bias: Vec<f64> = (0..outputs).map(|_| (rng.next_unit() - 0.5) * 0.1).collect();
            (weights, bias)
        };

        let (w1, b1) = dense(hidden, inputs, 1.0);
        let (w2, b2) = dense(1, hidden, 2.0);

        Self {
            name: "eeg-reference".to_string(),
            version: format!("reference-{seed}"),
            seed,
            channels,
            window_samples,
            classes: vec!["non_alcoholic".to_string(), "alcoholic".to_string()],
            feature_norm: FeatureNorm {
                mean: vec![0.0; inputs],
                std: vec![4.0; inputs],
            },
            layers: vec![
                Layer::Dense {
                    weights: w1,
                    bias: b1,
                    activation: Activation::Tanh,
                },
                Layer::Dropout { rate: 0.25 },
                Layer::Dense {
                    weights: w2,
                    bias: b2,
                    activation: Activation::Sigmoid,
                },
            ],
        }
    }
}

/// Small deterministic generator (SplitMix64); the only randomness in the crate.
#[derive(Debug, Clone)]
pub struct SplitMix64 {
    state: u64,
}

impl SplitMix64 {
    pub fn new(seed: u64) -> Self {
        Self { state: seed }
    }

    pub fn next_u64(&mut self) -> u64 {
        self.state = self.state.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut z = self.state;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^ (z >> 31)
    }

    /// Uniform value in `[0, 1)`.
    pub fn next_unit(&mut self) -> f64 {
        (self.next_u64() >> 11) as f64 / (1u64 << 53) as f64
    }
}

/// A validated, frozen classifier.
///
/// Immutable once built: it is shared read-only between all concurrent
/// inferences through a [`crate::ModelHandle`].
#[derive(Debug, Clone)]
pub struct EegModel {
    name: String,
    version: String,
    seed: u64,
    channels: usize,
    window_samples: usize,
    classes: Vec<String>,
    feature_norm: FeatureNorm,
    layers: Vec<Layer>,
    trainable: bool,
}

impl EegModel {
    /// Validate an artifact and freeze it for inference.
    pub fn from_artifact(artifact: ModelArtifact) -> Result<Self, ModelError> {
        validate(&artifact)?;

        Ok(Self {
            name: artifact.name,
            version: artifact.version,
            seed: artifact.seed,
            channels: artifact.channels,
            window_samples: artifact.window_samples,
            classes: artifact.classes,
            feature_norm: artifact.feature_norm,
            layers: artifact.layers,
            trainable: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn window_samples(&self) -> usize {
        self.window_samples
    }

    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    pub fn is_trainable(&self) -> bool {
        self.trainable
    }

    pub fn input_width(&self) -> usize {
        self.channels * FEATURES_PER_CHANNEL
    }

    /// Whether the model scores the positive class with a single sigmoid unit.
    pub fn is_binary_sigmoid(&self) -> bool {
        matches!(self.layers.iter().rev().find_map(dense_width), Some(1))
    }

    /// Normalise raw features in place.
    pub fn normalize(&self, features: &mut [f64]) {
        let norm = &self.feature_norm;
        for ((f, mean), std) in features.iter_mut().zip(&norm.mean).zip(&norm.std) {
            *f = (*f - mean) / std;
        }
    }

    /// Forward pass over one normalised feature vector; returns class probabilities.
    pub fn predict(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        if features.len() != self.input_width() {
            return Err(InferenceError::InferenceFailed(format!(
                "feature vector has {} values, model expects {}",
                features.len(),
                self.input_width()
            )));
        }

        let mut activations = features.to_vec();
        for layer in &self.layers {
            match layer {
                Layer::Dense {
                    weights,
                    bias,
                    activation,
                } => {
                    let mut next: Vec<f64> = weights
                        .iter()
                        .zip(bias)
                        .map(|(row, b)| {
                            row.iter().zip(&activations).map(|(w, x)| w * x).sum::<f64>() + b
                        })
                        .collect();
                    activation.apply(&mut next);
                    activations = next;
                }
                // Frozen: dropout is the identity.
                Layer::Dropout { .. } => {}
            }
        }

        let probabilities = if self.is_binary_sigmoid() {
            let p = activations[0];
            vec![1.0 - p, p]
        } else {
            activations
        };

        if probabilities.iter().any(|p| !p.is_finite()) {
            return Err(InferenceError::InferenceFailed(
                "forward pass produced a non-finite output".to_string(),
            ));
        }
        Ok(probabilities)
    }
}

fn dense_width(layer: &Layer) -> Option<usize> {
    match layer {
        Layer::Dense { bias, .. } => Some(bias.len()),
        Layer::Dropout { .. } => None,
    }
}

fn validate(artifact: &ModelArtifact) -> Result<(), ModelError> {
    if artifact.channels == 0 {
        return Err(ModelError::invalid("channels must be > 0"));
    }
    if artifact.window_samples < 2 {
        return Err(ModelError::invalid("window_samples must be >= 2"));
    }
    if artifact.classes.len() < 2 {
        return Err(ModelError::invalid("at least two classes are required"));
    }
    for (i, class) in artifact.classes.iter().enumerate() {
        if class.trim().is_empty() || artifact.classes[..i].contains(class) {
            return Err(ModelError::invalid(format!("invalid or duplicate class '{class}'")));
        }
    }

    let input_width = artifact.channels * FEATURES_PER_CHANNEL;
    let norm = &artifact.feature_norm;
    if norm.mean.len() != input_width || norm.std.len() != input_width {
        return Err(ModelError::invalid(format!(
            "feature_norm must have {input_width} entries"
        )));
    }
    if norm.mean.iter().any(|v| !v.is_finite())
        || norm.std.iter().any(|v| !v.is_finite() || *v <= 0.0)
    {
        return Err(ModelError::invalid(
            "feature_norm must be finite with strictly positive std",
        ));
    }

    let mut width = input_width;
    let mut last_activation = None;
    for (index, layer) in artifact.layers.iter().enumerate() {
        match layer {
            Layer::Dense {
                weights,
                bias,
                activation,
            } => {
                if weights.is_empty() || weights.len() != bias.len() {
                    return Err(ModelError::invalid(format!(
                        "layer {index}: {} weight rows but {} biases",
                        weights.len(),
                        bias.len()
                    )));
                }
                if let Some(row) = weights.iter().find(|row| row.len() != width) {
                    return Err(ModelError::invalid(format!(
                        "layer {index}: expected {width} inputs per unit, found {}",
                        row.len()
                    )));
                }
                let finite = weights.iter().flatten().chain(bias).all(|v| v.is_finite());
                if !finite {
                    return Err(ModelError::invalid(format!(
                        "layer {index}: non-finite parameter"
                    )));
                }
                width = bias.len();
                last_activation = Some(*activation);
            }
            Layer::Dropout { rate } => {
                if !(0.0..1.0).contains(rate) {
                    return Err(ModelError::invalid(format!(
                        "layer {index}: dropout rate must be in [0, 1)"
                    )));
                }
            }
        }
    }

    let classes = artifact.classes.len();
    match (last_activation, width) {
        (None, _) => Err(ModelError::invalid("model has no dense layers")),
        (Some(Activation::Sigmoid), 1) if classes == 2 => Ok(()),
        (Some(Activation::Softmax), w) if w == classes => Ok(()),
        (Some(activation), w) => Err(ModelError::invalid(format!(
            "output layer ({activation:?}, {w} units) does not match {classes} classes"
        ))),
    }
}
