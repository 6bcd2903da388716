//! Windowed per-channel signal features.
//!
//! For every channel of a window: log-variance (signal power) and log
//! line-length (mean absolute first difference). Features are laid out
//! channel-major: `[ch0_logvar, ch0_loglen, ch1_logvar, ...]`.

use crate::signal::InferenceInput;

pub const FEATURES_PER_CHANNEL: usize = 2;

/// Floor added before taking logarithms so flat channels stay finite.
const LOG_FLOOR: f64 = 1e-12;

/// Number of complete windows of `window` samples; the remainder is discarded.
pub fn window_count(input: &InferenceInput, window: usize) -> usize {
    if window == 0 {
        return 0;
    }
    input.sample_count() / window
}

/// Write the features of window `index` into `out` (cleared first).
pub fn window_features(input: &InferenceInput, window: usize, index: usize, out: &mut Vec<f64>) {
    out.clear();
    let start = index * window;
    for samples in input.channels() {
        let slice = &samples[start..start + window];
        out.push((variance(slice) + LOG_FLOOR).ln());
        out.push((line_length(slice) + LOG_FLOOR).ln());
    }
}

fn variance(xs: &[f64]) -> f64 {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n
}

fn line_length(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    let total: f64 = xs.windows(2).map(|w| (w[1] - w[0]).abs()).sum();
    total / (xs.len() - 1) as f64
}
