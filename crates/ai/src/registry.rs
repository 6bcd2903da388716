//! Process-wide, lazily loaded model.
//!
//! [`ModelRegistry`] is owned explicitly (usually behind an `Arc`) and handed
//! to whoever runs inference. The first successful `get_model` loads the
//! artifact; every later call gets the same [`ModelHandle`] without locking.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Instant;

use tracing::{error, info};

use crate::model::{EegModel, ModelArtifact, ModelError};
use crate::result::InferenceError;

/// Shared, read-only reference to the loaded model.
pub type ModelHandle = Arc<EegModel>;

/// Source of the model artifact.
pub trait ModelLoader: Send + Sync + 'static {
    /// Deserialize, validate and freeze the model. Expensive; called at most
    /// once per successful registry initialisation.
    fn load(&self) -> Result<EegModel, ModelError>;

    /// Human-readable origin, for logs.
    fn describe(&self) -> String;
}

/// Loads a JSON artifact from a fixed path.
#[derive(Debug, Clone)]
pub struct FileModelLoader {
    path: PathBuf,
}

impl FileModelLoader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ModelLoader for FileModelLoader {
    fn load(&self) -> Result<EegModel, ModelError> {
        let bytes = std::fs::read(&self.path).map_err(|source| ModelError::Io {
            path: self.path.display().to_string(),
            source,
        })?;
        let artifact = ModelArtifact::from_json(&bytes)?;
        EegModel::from_artifact(artifact)
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

/// Double-checked lazy holder of the [`ModelHandle`].
///
/// - Fast path: an initialised cell is read without taking any lock.
/// - Slow path: callers serialise on `init_lock`, re-check the cell, and only
///   the first one performs the load.
/// - A failed load leaves the cell empty; the next caller tries again.
pub struct ModelRegistry {
    loader: Box<dyn ModelLoader>,
    cell: OnceLock<ModelHandle>,
    init_lock: Mutex<()>,
    load_attempts: AtomicUsize,
}

impl ModelRegistry {
    pub fn new(loader: impl ModelLoader) -> Self {
        Self {
            loader: Box::new(loader),
            cell: OnceLock::new(),
            init_lock: Mutex::new(()),
            load_attempts: AtomicUsize::new(0),
        }
    }

    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        Self::new(FileModelLoader::new(path))
    }

    /// Get the shared model, loading it on first use.
    pub fn get_model(&self) -> Result<ModelHandle, InferenceError> {
        if let Some(handle) = self.cell.get() {
            return Ok(Arc::clone(handle));
        }

        // The guard protects no data, so a poisoned lock is still usable.
        let _guard = self
            .init_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if let Some(handle) = self.cell.get() {
            return Ok(Arc::clone(handle));
        }

        self.load_attempts.fetch_add(1, Ordering::SeqCst);
        let source = self.loader.describe();
        info!(source = %source, "loading classification model");
        let started = Instant::now();

        match self.loader.load() {
            Ok(model) => {
                info!(
                    source = %source,
                    model = model.name(),
                    version = model.version(),
                    seed = model.seed(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "classification model loaded"
                );
                let handle = Arc::new(model);
                // Only this thread can set the cell while holding the guard.
                let _ = self.cell.set(Arc::clone(&handle));
                Ok(handle)
            }
            Err(e) => {
                error!(source = %source, error = %e, "failed to load classification model");
                Err(InferenceError::ModelUnavailable(e.to_string()))
            }
        }
    }

    /// Whether a model has been loaded successfully.
    pub fn is_loaded(&self) -> bool {
        self.cell.get().is_some()
    }

    /// Number of load operations started so far (successful or not).
    pub fn load_attempts(&self) -> usize {
        self.load_attempts.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("source", &self.loader.describe())
            .field("loaded", &self.is_loaded())
            .field("load_attempts", &self.load_attempts())
            .finish()
    }
}
