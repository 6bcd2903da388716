//! Decoding and structural validation of uploaded EEG recordings.
//!
//! Three columnar encodings are accepted:
//! - CSV: header row of channel names, one row per time step.
//! - JSON: `{"sample_rate_hz": 256.0, "channels": [{"name": "Fp1", "samples": [..]}]}`.
//! - Parquet: one numeric column per channel, as written by pandas or pyarrow.
//!
//! Everything here is synchronous and side-effect free: a payload either
//! decodes into an [`InferenceInput`] or is rejected with a [`SignalError`].

use std::collections::HashSet;

use arrow_array::cast::AsArray;
use arrow_array::types::Float64Type;
use arrow_array::Array;
use arrow_cast::cast;
use arrow_schema::DataType;
use bytes::Bytes;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Leading columns that carry time information rather than a channel.
const TIME_COLUMNS: &[&str] = &["time", "timestamp", "sample", "sample_index", "t"];

/// Magic bytes at both ends of a Parquet file.
const PARQUET_MAGIC: &[u8] = b"PAR1";

/// Prefix pandas gives the columns it writes for a stored index.
const PANDAS_INDEX_PREFIX: &str = "__index_level_";

/// Why an upload could not be turned into an [`InferenceInput`].
#[derive(Debug, Clone, PartialEq, Error)]
pub enum SignalError {
    #[error("payload is empty")]
    Empty,

    #[error("unsupported file format: {0}")]
    UnsupportedFormat(String),

    #[error("payload is not valid UTF-8 text")]
    NotUtf8,

    #[error("missing header row with channel names")]
    MissingHeader,

    #[error("column {column} has an empty channel name")]
    EmptyChannelName { column: usize },

    #[error("duplicate channel name: {0}")]
    DuplicateChannel(String),

    #[error("line {line}: expected {expected} values, found {found}")]
    Ragged {
        line: usize,
        expected: usize,
        found: usize,
    },

    #[error("line {line}, column {column}: '{value}' is not a number")]
    InvalidNumber {
        line: usize,
        column: usize,
        value: String,
    },

    #[error("channel {0} contains a non-finite value")]
    NonFinite(String),

    #[error("recording has no channels")]
    NoChannels,

    #[error("recording has no samples")]
    NoSamples,

    #[error("channel {channel} has {found} samples, expected {expected}")]
    UnequalLengths {
        channel: String,
        expected: usize,
        found: usize,
    },

    #[error("malformed JSON recording: {0}")]
    Json(String),

    #[error("malformed Parquet recording: {0}")]
    Parquet(String),

    #[error("column {0} is not numeric")]
    NonNumericColumn(String),

    #[error("column {0} has missing values")]
    MissingValues(String),

    #[error("expected {expected} channels, found {found}")]
    ChannelCount { expected: usize, found: usize },

    #[error("recording too short: at least {min} samples per channel required, found {found}")]
    TooShort { min: usize, found: usize },
}

/// Encoding of an uploaded recording.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileFormat {
    Csv,
    Json,
    Parquet,
}

impl FileFormat {
    /// Detect the format from the file name, falling back to sniffing the content.
    pub fn detect(file_name: Option<&str>, bytes: &[u8]) -> Result<Self, SignalError> {
        let ext = file_name
            .and_then(|n| n.rsplit_once('.'))
            .map(|(_, ext)| ext.to_ascii_lowercase());

        match ext.as_deref() {
            Some("csv") | Some("tsv") | Some("txt") => Ok(Self::Csv),
            Some("json") => Ok(Self::Json),
            Some("parquet") | Some("pq") => Ok(Self::Parquet),
            Some(other @ ("edf" | "bdf" | "xlsx")) => {
                Err(SignalError::UnsupportedFormat(other.to_string()))
            }
            _ if bytes.starts_with(PARQUET_MAGIC) => Ok(Self::Parquet),
            _ => {
                let first = bytes.iter().find(|b| !b.is_ascii_whitespace());
                Ok(match first {
                    Some(b'{') => Self::Json,
                    _ => Self::Csv,
                })
            }
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Parquet => "parquet",
        }
    }
}

/// Decoded signal matrix (channels × samples).
///
/// Construction validates structure: at least one channel, unique non-empty
/// names, equal-length channels and finite values only. Deserialization goes
/// through the same checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawInput")]
pub struct InferenceInput {
    channel_names: Vec<String>,
    sample_rate_hz: Option<f64>,
    data: Vec<Vec<f64>>,
}

impl InferenceInput {
    pub fn new(
        channel_names: Vec<String>,
        sample_rate_hz: Option<f64>,
        data: Vec<Vec<f64>>,
    ) -> Result<Self, SignalError> {
        if channel_names.is_empty() || data.is_empty() {
            return Err(SignalError::NoChannels);
        }
        if channel_names.len() != data.len() {
            return Err(SignalError::ChannelCount {
                expected: channel_names.len(),
                found: data.len(),
            });
        }

        let mut seen = HashSet::with_capacity(channel_names.len());
        for (column, name) in channel_names.iter().enumerate() {
            if name.trim().is_empty() {
                return Err(SignalError::EmptyChannelName { column: column + 1 });
            }
            if !seen.insert(name.as_str()) {
                return Err(SignalError::DuplicateChannel(name.clone()));
            }
        }

        let expected = data[0].len();
        if expected == 0 {
            return Err(SignalError::NoSamples);
        }
        for (name, samples) in channel_names.iter().zip(&data) {
            if samples.len() != expected {
                return Err(SignalError::UnequalLengths {
                    channel: name.clone(),
                    expected,
                    found: samples.len(),
                });
            }
            if samples.iter().any(|v| !v.is_finite()) {
                return Err(SignalError::NonFinite(name.clone()));
            }
        }

        let sample_rate_hz = sample_rate_hz.filter(|r| r.is_finite() && *r > 0.0);

        Ok(Self {
            channel_names,
            sample_rate_hz,
            data,
        })
    }

    /// Decode an uploaded payload. `file_name` is only used for format detection.
    pub fn decode(bytes: &[u8], file_name: Option<&str>) -> Result<Self, SignalError> {
        if bytes.iter().all(|b| b.is_ascii_whitespace()) {
            return Err(SignalError::Empty);
        }
        match FileFormat::detect(file_name, bytes)? {
            FileFormat::Csv => decode_csv(bytes),
            FileFormat::Json => decode_json(bytes),
            FileFormat::Parquet => decode_parquet(bytes),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.data.len()
    }

    pub fn sample_count(&self) -> usize {
        self.data.first().map_or(0, Vec::len)
    }

    pub fn channel_names(&self) -> &[String] {
        &self.channel_names
    }

    pub fn sample_rate_hz(&self) -> Option<f64> {
        self.sample_rate_hz
    }

    /// Samples of one channel.
    pub fn channel(&self, index: usize) -> &[f64] {
        &self.data[index]
    }

    pub fn channels(&self) -> impl Iterator<Item = &[f64]> {
        self.data.iter().map(Vec::as_slice)
    }
}

#[derive(Deserialize)]
struct RawInput {
    channel_names: Vec<String>,
    #[serde(default)]
    sample_rate_hz: Option<f64>,
    data: Vec<Vec<f64>>,
}

impl TryFrom<RawInput> for InferenceInput {
    type Error = SignalError;

    fn try_from(raw: RawInput) -> Result<Self, Self::Error> {
        Self::new(raw.channel_names, raw.sample_rate_hz, raw.data)
    }
}

/// Shape requirements enforced at upload time.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignalSpec {
    pub expected_channels: usize,
    pub min_samples: usize,
}

impl Default for SignalSpec {
    fn default() -> Self {
        Self {
            expected_channels: 16,
            min_samples: 256,
        }
    }
}

impl SignalSpec {
    pub fn validate(&self, input: &InferenceInput) -> Result<(), SignalError> {
        if input.channel_count() != self.expected_channels {
            return Err(SignalError::ChannelCount {
                expected: self.expected_channels,
                found: input.channel_count(),
            });
        }
        if input.sample_count() < self.min_samples {
            return Err(SignalError::TooShort {
                min: self.min_samples,
                found: input.sample_count(),
            });
        }
        Ok(())
    }
}

fn decode_csv(bytes: &[u8]) -> Result<InferenceInput, SignalError> {
    let text = std::str::from_utf8(bytes).map_err(|_| SignalError::NotUtf8)?;
    let text = text.strip_prefix('\u{feff}').unwrap_or(text);

    let mut lines = text
        .lines()
        .enumerate()
        .map(|(i, l)| (i + 1, l.trim()))
        .filter(|(_, l)| !l.is_empty());

    let (_, header) = lines.next().ok_or(SignalError::Empty)?;
    let delimiter = pick_delimiter(header);

    let mut names: Vec<String> = header
        .split(delimiter)
        .map(|c| unquote(c).to_string())
        .collect();

    // A header made only of numbers is a headless file.
    if names.iter().all(|n| n.parse::<f64>().is_ok()) {
        return Err(SignalError::MissingHeader);
    }

    let skip_time = names
        .first()
        .is_some_and(|n| TIME_COLUMNS.contains(&n.to_ascii_lowercase().as_str()));
    if skip_time {
        names.remove(0);
    }

    let width = names.len() + usize::from(skip_time);
    let mut data: Vec<Vec<f64>> = vec![Vec::new(); names.len()];

    for (line_no, line) in lines {
        let cells: Vec<&str> = line.split(delimiter).collect();
        if cells.len() != width {
            return Err(SignalError::Ragged {
                line: line_no,
                expected: width,
                found: cells.len(),
            });
        }

        let values = cells.into_iter().enumerate().skip(usize::from(skip_time));
        for (column, cell) in values {
            let cell = unquote(cell);
            let value = cell.parse::<f64>().map_err(|_| SignalError::InvalidNumber {
                line: line_no,
                column: column + 1,
                value: cell.chars().take(32).collect(),
            })?;
            data[column - usize::from(skip_time)].push(value);
        }
    }

    if data.first().is_none_or(Vec::is_empty) {
        return Err(SignalError::NoSamples);
    }

    InferenceInput::new(names, None, data)
}

fn pick_delimiter(header: &str) -> char {
    [',', ';', '\t']
        .into_iter()
        .max_by_key(|d| header.matches(*d).count())
        .unwrap_or(',')
}

fn unquote(cell: &str) -> &str {
    let cell = cell.trim();
    cell.strip_prefix('"')
        .and_then(|c| c.strip_suffix('"'))
        .unwrap_or(cell)
        .trim()
}

#[derive(Debug, Deserialize)]
struct JsonRecording {
    #[serde(default)]
    sample_rate_hz: Option<f64>,
    channels: Vec<JsonChannel>,
}

#[derive(Debug, Deserialize)]
struct JsonChannel {
    name: String,
    samples: Vec<f64>,
}

fn decode_json(bytes: &[u8]) -> Result<InferenceInput, SignalError> {
    let recording: JsonRecording =
        serde_json::from_slice(bytes).map_err(|e| SignalError::Json(e.to_string()))?;

    let (names, data): (Vec<String>, Vec<Vec<f64>>) = recording
        .channels
        .into_iter()
        .map(|c| (c.name.trim().to_string(), c.samples))
        .unzip();

    InferenceInput::new(names, recording.sample_rate_hz, data)
}

fn decode_parquet(bytes: &[u8]) -> Result<InferenceInput, SignalError> {
    let builder = ParquetRecordBatchReaderBuilder::try_new(Bytes::copy_from_slice(bytes))
        .map_err(parquet_error)?;
    let fields: Vec<String> = builder
        .schema()
        .fields()
        .iter()
        .map(|f| f.name().trim().to_string())
        .collect();
    let reader = builder.build().map_err(parquet_error)?;

    let mut names = Vec::new();
    let mut columns = Vec::new();
    for (index, name) in fields.into_iter().enumerate() {
        let lower = name.to_ascii_lowercase();
        let is_time = index == 0 && TIME_COLUMNS.contains(&lower.as_str());
        if is_time || lower.starts_with(PANDAS_INDEX_PREFIX) {
            continue;
        }
        names.push(name);
        columns.push(index);
    }

    let mut data: Vec<Vec<f64>> = vec![Vec::new(); columns.len()];
    for batch in reader {
        let batch = batch.map_err(parquet_error)?;
        for (slot, &index) in columns.iter().enumerate() {
            let column = batch.column(index);
            if !column.data_type().is_numeric() {
                return Err(SignalError::NonNumericColumn(names[slot].clone()));
            }
            if column.null_count() > 0 {
                return Err(SignalError::MissingValues(names[slot].clone()));
            }
            let values = cast(column, &DataType::Float64).map_err(parquet_error)?;
            let values = values
                .as_primitive_opt::<Float64Type>()
                .ok_or_else(|| SignalError::NonNumericColumn(names[slot].clone()))?;
            data[slot].extend_from_slice(values.values());
        }
    }

    InferenceInput::new(names, None, data)
}

fn parquet_error(e: impl std::fmt::Display) -> SignalError {
    SignalError::Parquet(e.to_string())
}
