use crate::features::{window_count, window_features};
use crate::model::EegModel;
use crate::result::{ClassProbability, InferenceError, InferenceResult};
use crate::signal::InferenceInput;

/// Classifies a validated recording with a shared model.
///
/// Stateless: the result is a pure function of `(input, model)`. Windows are
/// scored in order and their probabilities averaged, so identical inputs give
/// bit-identical results.
#[derive(Debug, Default, Copy, Clone)]
pub struct InferenceExecutor;

impl InferenceExecutor {
    pub fn new() -> Self {
        Self
    }

    pub fn run(
        &self,
        input: &InferenceInput,
        model: &EegModel,
    ) -> Result<InferenceResult, InferenceError> {
        if input.channel_count() != model.channels() {
            return Err(InferenceError::ShapeMismatch {
                expected: format!("{} channels", model.channels()),
                found: format!("{} channels", input.channel_count()),
            });
        }

        let window = model.window_samples();
        let windows = window_count(input, window);
        if windows == 0 {
            return Err(InferenceError::ShapeMismatch {
                expected: format!("at least {window} samples per channel"),
                found: format!("{} samples", input.sample_count()),
            });
        }

        let classes = model.classes();
        let mut totals = vec![0.0f64; classes.len()];
        let mut features = Vec::with_capacity(model.input_width());

        for index in 0..windows {
            window_features(input, window, index, &mut features);
            model.normalize(&mut features);
            let probabilities = model.predict(&features)?;
            if probabilities.len() != totals.len() {
                return Err(InferenceError::InferenceFailed(format!(
                    "model produced {} outputs for {} classes",
                    probabilities.len(),
                    totals.len()
                )));
            }
            for (total, p) in totals.iter_mut().zip(&probabilities) {
                *total += p;
            }
        }

        let averaged: Vec<f64> = totals.iter().map(|t| t / windows as f64).collect();
        if averaged.iter().any(|p| !p.is_finite()) {
            return Err(InferenceError::InferenceFailed(
                "averaged probabilities are not finite".to_string(),
            ));
        }

        // Ties resolve to the lowest class index.
        let (best, best_p) = averaged
            .iter()
            .copied()
            .enumerate()
            .fold((0, f64::NEG_INFINITY), |acc, (i, p)| if p > acc.1 { (i, p) } else { acc });

        Ok(InferenceResult {
            label: classes[best].clone(),
            confidence: best_p.clamp(0.0, 1.0),
            probabilities: classes
                .iter()
                .zip(&averaged)
                .map(|(label, p)| ClassProbability {
                    label: label.clone(),
                    probability: p.clamp(0.0, 1.0),
                })
                .collect(),
            raw_probability: model.is_binary_sigmoid().then(|| averaged[1].clamp(0.0, 1.0)),
            windows,
            model_name: model.name().to_string(),
            model_version: model.version().to_string(),
        })
    }
}
