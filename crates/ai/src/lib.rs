//! `neuroscreen-ai`
//!
//! **Responsibility:** everything between an uploaded recording and a diagnosis.
//!
//! - `signal`: decode and structurally validate uploads into an `InferenceInput`.
//! - `model`: the serialized classifier artifact and its frozen form.
//! - `registry`: lazy, once-per-process model loading shared by all workers.
//! - `executor`: deterministic classification of one recording.
//!
//! This crate knows nothing about jobs or storage.

pub mod executor;
pub mod features;
pub mod model;
pub mod registry;
pub mod result;
pub mod signal;

pub use executor::InferenceExecutor;
pub use model::{EegModel, ModelArtifact, ModelError};
pub use registry::{FileModelLoader, ModelHandle, ModelLoader, ModelRegistry};
pub use result::{ClassProbability, InferenceError, InferenceResult};
pub use signal::{FileFormat, InferenceInput, SignalError, SignalSpec};
