//! Configuration loading and representation.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::debug;

use neuroscreen_ai::SignalSpec;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConfigError {
    #[error("{key}: invalid value '{value}': {reason}")]
    Invalid {
        key: &'static str,
        value: String,
        reason: String,
    },
}

/// Everything the pipeline and its HTTP front need at startup.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    pub model_path: PathBuf,
    /// Durable storage root; `None` keeps jobs and recordings in memory.
    pub data_dir: Option<PathBuf>,
    pub workers: usize,
    pub poll_interval: Duration,
    pub signal: SignalSpec,
    pub max_upload_bytes: usize,
    pub bind_addr: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_path: PathBuf::from("dl_models/eeg_classifier.json"),
            data_dir: None,
            workers: 4,
            poll_interval: Duration::from_millis(100),
            signal: SignalSpec::default(),
            max_upload_bytes: 64 * 1024 * 1024,
            bind_addr: "0.0.0.0:8080".to_string(),
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset or blank keys keep their
    /// defaults; present but malformed values are errors.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let get = |key: &'static str| {
            let value = lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
            if value.is_none() {
                debug!(key, "configuration key not set, using default");
            }
            value
        };

        let model_path = get("NEUROSCREEN_MODEL_PATH").map_or(d.model_path, PathBuf::from);
        let data_dir = get("NEUROSCREEN_DATA_DIR").map(PathBuf::from);
        let workers = parse_positive(get("NEUROSCREEN_WORKERS"), "NEUROSCREEN_WORKERS", d.workers)?;
        let poll_ms = parse_positive(
            get("NEUROSCREEN_POLL_INTERVAL_MS"),
            "NEUROSCREEN_POLL_INTERVAL_MS",
            d.poll_interval.as_millis() as u64,
        )?;
        let expected_channels = parse_positive(
            get("NEUROSCREEN_EXPECTED_CHANNELS"),
            "NEUROSCREEN_EXPECTED_CHANNELS",
            d.signal.expected_channels,
        )?;
        let min_samples = parse_positive(
            get("NEUROSCREEN_MIN_SAMPLES"),
            "NEUROSCREEN_MIN_SAMPLES",
            d.signal.min_samples,
        )?;
        let max_upload_bytes = parse_positive(
            get("NEUROSCREEN_MAX_UPLOAD_BYTES"),
            "NEUROSCREEN_MAX_UPLOAD_BYTES",
            d.max_upload_bytes,
        )?;
        let bind_addr = get("NEUROSCREEN_BIND_ADDR").unwrap_or(d.bind_addr);

        Ok(Self {
            model_path,
            data_dir,
            workers,
            poll_interval: Duration::from_millis(poll_ms),
            signal: SignalSpec {
                expected_channels,
                min_samples,
            },
            max_upload_bytes,
            bind_addr,
        })
    }
}

fn parse_positive<T>(value: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError>
where
    T: FromStr + PartialOrd + Default,
    T::Err: std::fmt::Display,
{
    let Some(value) = value else {
        return Ok(default);
    };
    let parsed = value.parse::<T>().map_err(|e| ConfigError::Invalid {
        key,
        value: value.clone(),
        reason: e.to_string(),
    })?;
    if parsed <= T::default() {
        return Err(ConfigError::Invalid {
            key,
            value,
            reason: "must be greater than zero".to_string(),
        });
    }
    Ok(parsed)
}
