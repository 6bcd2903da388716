//! Storage for decoded recordings between upload and inference.

use std::collections::HashMap;
use std::fs;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use neuroscreen_ai::InferenceInput;
use neuroscreen_core::RecordingId;

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RecordingStoreError {
    #[error("storage error: {0}")]
    Storage(String),
}

pub trait RecordingStore: Send + Sync {
    /// Store a validated recording and return its new id.
    fn put(&self, input: InferenceInput) -> Result<RecordingId, RecordingStoreError>;

    fn get(&self, id: RecordingId) -> Result<Option<Arc<InferenceInput>>, RecordingStoreError>;

    /// Remove a recording. Unknown ids are not an error.
    fn delete(&self, id: RecordingId) -> Result<(), RecordingStoreError>;
}

#[derive(Debug, Default)]
pub struct InMemoryRecordingStore {
    recordings: RwLock<HashMap<RecordingId, Arc<InferenceInput>>>,
}

impl InMemoryRecordingStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.recordings.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> RecordingStoreError {
    RecordingStoreError::Storage("recording table poisoned".to_string())
}

impl RecordingStore for InMemoryRecordingStore {
    fn put(&self, input: InferenceInput) -> Result<RecordingId, RecordingStoreError> {
        let id = RecordingId::new();
        self.recordings
            .write()
            .map_err(|_| poisoned())?
            .insert(id, Arc::new(input));
        Ok(id)
    }

    fn get(&self, id: RecordingId) -> Result<Option<Arc<InferenceInput>>, RecordingStoreError> {
        Ok(self
            .recordings
            .read()
            .map_err(|_| poisoned())?
            .get(&id)
            .cloned())
    }

    fn delete(&self, id: RecordingId) -> Result<(), RecordingStoreError> {
        self.recordings.write().map_err(|_| poisoned())?.remove(&id);
        Ok(())
    }
}

/// Keeps each decoded recording as `<dir>/recordings/<id>.json`.
#[derive(Debug)]
pub struct FsRecordingStore {
    dir: PathBuf,
}

impl FsRecordingStore {
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, RecordingStoreError> {
        let dir = dir.as_ref().join("recordings");
        fs::create_dir_all(&dir).map_err(|e| io_error("create", &dir, e))?;
        Ok(Self { dir })
    }

    fn path_for(&self, id: RecordingId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> RecordingStoreError {
    RecordingStoreError::Storage(format!("{action} {}: {e}", path.display()))
}

impl RecordingStore for FsRecordingStore {
    fn put(&self, input: InferenceInput) -> Result<RecordingId, RecordingStoreError> {
        let id = RecordingId::new();
        let path = self.path_for(id);
        let tmp = path.with_extension("json.tmp");

        let file = fs::File::create(&tmp).map_err(|e| io_error("create", &tmp, e))?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, &input)
            .map_err(|e| RecordingStoreError::Storage(format!("serialize recording {id}: {e}")))?;
        writer.flush().map_err(|e| io_error("write", &tmp, e))?;
        drop(writer);

        fs::rename(&tmp, &path).map_err(|e| io_error("rename", &path, e))?;
        Ok(id)
    }

    fn get(&self, id: RecordingId) -> Result<Option<Arc<InferenceInput>>, RecordingStoreError> {
        let path = self.path_for(id);
        let file = match fs::File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(io_error("open", &path, e)),
        };
        let input: InferenceInput = serde_json::from_reader(BufReader::new(file))
            .map_err(|e| RecordingStoreError::Storage(format!("parse {}: {e}", path.display())))?;
        Ok(Some(Arc::new(input)))
    }

    fn delete(&self, id: RecordingId) -> Result<(), RecordingStoreError> {
        let path = self.path_for(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(io_error("remove", &path, e)),
        }
    }
}

impl<S: RecordingStore + ?Sized> RecordingStore for Arc<S> {
    fn put(&self, input: InferenceInput) -> Result<RecordingId, RecordingStoreError> {
        (**self).put(input)
    }

    fn get(&self, id: RecordingId) -> Result<Option<Arc<InferenceInput>>, RecordingStoreError> {
        (**self).get(id)
    }

    fn delete(&self, id: RecordingId) -> Result<(), RecordingStoreError> {
        (**self).delete(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> InferenceInput {
        InferenceInput::new(
            vec!["Fp1".to_string(), "Fp2".to_string()],
            Some(256.0),
            vec![vec![1.0, 2.5, -3.0], vec![0.0, 0.5, 1.0]],
        )
        .unwrap()
    }

    fn exercise(store: &dyn RecordingStore) {
        let id = store.put(input()).unwrap();
        assert_eq!(store.get(id).unwrap().as_deref(), Some(&input()));

        store.delete(id).unwrap();
        assert!(store.get(id).unwrap().is_none());
        // Deleting twice is fine.
        store.delete(id).unwrap();
    }

    #[test]
    fn in_memory_put_get_delete() {
        exercise(&InMemoryRecordingStore::new());
    }

    #[test]
    fn fs_put_get_delete() {
        let dir = tempfile::tempdir().unwrap();
        exercise(&FsRecordingStore::open(dir.path()).unwrap());
    }

    #[test]
    fn fs_recordings_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let id = FsRecordingStore::open(dir.path()).unwrap().put(input()).unwrap();

        let reopened = FsRecordingStore::open(dir.path()).unwrap();
        let loaded = reopened.get(id).unwrap().unwrap();
        assert_eq!(loaded.channel_names(), input().channel_names());
        assert_eq!(loaded.sample_count(), 3);
    }

    #[test]
    fn fs_rejects_a_tampered_recording() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsRecordingStore::open(dir.path()).unwrap();
        let id = store.put(input()).unwrap();
        fs::write(
            store.path_for(id),
            br#"{"channel_names":["Fp1","Fp2"],"sample_rate_hz":256.0,"data":[[1.0,2.0,3.0],[1.0]]}"#,
        )
        .unwrap();

        let err = store.get(id).unwrap_err();
        assert!(err.to_string().contains("channel Fp2 has 1 samples"));
    }
}
