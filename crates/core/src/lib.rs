//! `neuroscreen-core`: shared building blocks for the EEG screening pipeline.
//!
//! This crate contains identifiers and the base error model only (no I/O).

pub mod error;
pub mod id;

pub use error::DomainError;
pub use id::{JobId, RecordingId, SubjectRef};
