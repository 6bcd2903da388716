//! Durable job store: one JSON document per job.
//!
//! Writes go to a temporary file that is then renamed over the target, so a
//! crash leaves either the old or the new version on disk, never a torn one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::Utc;
use tracing::{info, warn};

use neuroscreen_core::{JobId, SubjectRef};

use super::store::{JobFilter, JobStats, JobStore, JobStoreError, JobTable};
use super::types::{INTERRUPTED_MESSAGE, Job, JobState, JobTransition, RecordingMeta};

#[derive(Debug)]
pub struct FsJobStore {
    dir: PathBuf,
    table: JobTable,
}

impl FsJobStore {
    /// Open (or create) a store under `dir` and load every job found there.
    ///
    /// Pending jobs are queued again in creation order. Jobs left in
    /// `processing` by a previous run are failed: no worker owns them anymore
    /// and they are not retried.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, JobStoreError> {
        let dir = dir.as_ref().join("jobs");
        fs::create_dir_all(&dir).map_err(|e| storage("create job directory", &dir, e))?;

        let mut jobs = Vec::new();
        let entries = fs::read_dir(&dir).map_err(|e| storage("read job directory", &dir, e))?;
        for entry in entries {
            let path = entry.map_err(|e| storage("read job directory", &dir, e))?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_job(&path) {
                Ok(job) => jobs.push(job),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable job file"),
            }
        }
        jobs.sort_by_key(|j| (j.created_at(), j.id()));

        let store = Self {
            dir,
            table: JobTable::default(),
        };

        let mut requeued = 0usize;
        let mut interrupted = 0usize;
        for mut job in jobs {
            match job.state() {
                JobState::Pending => requeued += 1,
                JobState::Processing => {
                    job.apply(JobTransition::Fail(INTERRUPTED_MESSAGE.to_string()), Utc::now())?;
                    store.persist(&job)?;
                    interrupted += 1;
                }
                JobState::Processed | JobState::Failed => {}
            }
            store.table.insert(job)?;
        }

        info!(
            dir = %store.dir.display(),
            requeued,
            interrupted,
            "job store opened"
        );
        Ok(store)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, job_id: JobId) -> PathBuf {
        self.dir.join(format!("{job_id}.json"))
    }

    fn persist(&self, job: &Job) -> Result<(), JobStoreError> {
        let path = self.path_for(job.id());
        let tmp = path.with_extension("json.tmp");
        let bytes = serde_json::to_vec_pretty(job)
            .map_err(|e| JobStoreError::Storage(format!("serialize job {}: {e}", job.id())))?;

        let mut file = fs::File::create(&tmp).map_err(|e| storage("create", &tmp, e))?;
        file.write_all(&bytes)
            .and_then(|_| file.sync_all())
            .map_err(|e| storage("write", &tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| storage("rename", &path, e))
    }

    fn unpersist(&self, job: &Job) -> Result<(), JobStoreError> {
        let path = self.path_for(job.id());
        match fs::remove_file(&path) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(storage("remove", &path, e)),
            _ => Ok(()),
        }
    }
}

fn storage(action: &str, path: &Path, e: std::io::Error) -> JobStoreError {
    JobStoreError::Storage(format!("{action} {}: {e}", path.display()))
}

fn read_job(path: &Path) -> Result<Job, JobStoreError> {
    let bytes = fs::read(path).map_err(|e| storage("read", path, e))?;
    serde_json::from_slice(&bytes)
        .map_err(|e| JobStoreError::Storage(format!("parse {}: {e}", path.display())))
}

impl JobStore for FsJobStore {
    fn create(&self, subject: SubjectRef, recording: RecordingMeta) -> Result<Job, JobStoreError> {
        let job = Job::new(JobId::new(), subject, recording, Utc::now());
        self.persist(&job)?;
        self.table.insert(job.clone())?;
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.table.get(job_id)
    }

    fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError> {
        self.table.transition(job_id, transition, |job| self.persist(job))
    }

    fn fail_unpersisted(&self, job_id: JobId, message: &str) -> Result<Job, JobStoreError> {
        let job = self
            .table
            .transition(job_id, JobTransition::Fail(message.to_string()), |_| Ok(()))?;
        warn!(job_id = %job_id, "job failure kept in memory only");
        Ok(job)
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        self.table.claim_next(|job| self.persist(job))
    }

    fn delete(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.table.remove(job_id, |job| self.unpersist(job))
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        self.table.list(filter)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.table.stats()
    }
}
