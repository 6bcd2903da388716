//! Job storage implementations.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;
use serde::Serialize;

use neuroscreen_core::{JobId, SubjectRef};

use super::types::{Job, JobState, JobTransition, RecordingMeta};

/// Job store abstraction.
///
/// Every state change goes through [`JobStore::transition`], which is atomic
/// per job: two racing transitions on the same job never both succeed.
pub trait JobStore: Send + Sync {
    /// Create a `pending` job and queue it for the workers.
    fn create(&self, subject: SubjectRef, recording: RecordingMeta) -> Result<Job, JobStoreError>;

    /// Get a job by ID.
    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Apply a state transition and return the updated job.
    fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError>;

    /// Fail a `processing` job in memory only.
    ///
    /// Used when the outcome of a job could not be written. The job reads as
    /// `failed` for the life of this store; durable stores will report it as
    /// interrupted after a restart.
    fn fail_unpersisted(&self, job_id: JobId, message: &str) -> Result<Job, JobStoreError>;

    /// Claim the oldest pending job, moving it to `processing`.
    /// Returns None if no jobs are waiting.
    fn claim_next(&self) -> Result<Option<Job>, JobStoreError>;

    /// Remove a job and return its last version.
    ///
    /// Jobs in `processing` are owned by a worker and cannot be removed.
    fn delete(&self, job_id: JobId) -> Result<Job, JobStoreError>;

    /// List jobs, newest first.
    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError>;

    /// Get job statistics.
    fn stats(&self) -> Result<JobStats, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("invalid transition for job {job_id}: {from} -> {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobState,
        to: JobState,
    },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} is {state} and cannot be removed")]
    InUse { job_id: JobId, state: JobState },
    #[error("storage error: {0}")]
    Storage(String),
}

/// Job statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub processed: usize,
    pub failed: usize,
}

impl JobStats {
    fn count(&mut self, state: JobState) {
        match state {
            JobState::Pending => self.pending += 1,
            JobState::Processing => self.processing += 1,
            JobState::Processed => self.processed += 1,
            JobState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.processed + self.failed
    }
}

/// Filter for [`JobStore::list`].
#[derive(Debug, Clone)]
pub struct JobFilter {
    pub subject: Option<SubjectRef>,
    pub state: Option<JobState>,
    pub limit: usize,
}

impl JobFilter {
    pub const DEFAULT_LIMIT: usize = 50;
    pub const MAX_LIMIT: usize = 500;

    pub fn with_subject(mut self, subject: SubjectRef) -> Self {
        self.subject = Some(subject);
        self
    }

    pub fn with_state(mut self, state: JobState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.clamp(1, Self::MAX_LIMIT);
        self
    }

    fn matches(&self, job: &Job) -> bool {
        self.subject
            .as_ref()
            .map_or(true, |s| job.subject_reference() == s)
            && self.state.map_or(true, |s| job.state() == s)
    }
}

impl Default for JobFilter {
    fn default() -> Self {
        Self {
            subject: None,
            state: None,
            limit: Self::DEFAULT_LIMIT,
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>, JobStoreError> {
    mutex
        .lock()
        .map_err(|_| JobStoreError::Storage("job lock poisoned".to_string()))
}

/// In-process job table shared by the store implementations.
///
/// Each job sits behind its own mutex so transitions on different jobs never
/// contend; the map lock is only held long enough to find the entry.
#[derive(Debug, Default)]
pub(crate) struct JobTable {
    jobs: RwLock<HashMap<JobId, Arc<Mutex<Job>>>>,
    queue: Mutex<VecDeque<JobId>>,
}

impl JobTable {
    pub(crate) fn insert(&self, job: Job) -> Result<(), JobStoreError> {
        let id = job.id();
        let pending = job.state() == JobState::Pending;
        {
            let mut jobs = self
                .jobs
                .write()
                .map_err(|_| JobStoreError::Storage("job table poisoned".to_string()))?;
            if jobs.contains_key(&id) {
                return Err(JobStoreError::AlreadyExists(id));
            }
            jobs.insert(id, Arc::new(Mutex::new(job)));
        }
        if pending {
            lock(&self.queue)?.push_back(id);
        }
        Ok(())
    }

    /// Whether `entry` is still the live record for `job_id`.
    ///
    /// Callers hold the job's lock; lock order is always job, then map.
    fn is_live(&self, job_id: JobId, entry: &Arc<Mutex<Job>>) -> Result<bool, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job table poisoned".to_string()))?;
        Ok(jobs.get(&job_id).is_some_and(|live| Arc::ptr_eq(live, entry)))
    }

    fn entry(&self, job_id: JobId) -> Result<Option<Arc<Mutex<Job>>>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job table poisoned".to_string()))?;
        Ok(jobs.get(&job_id).cloned())
    }

    fn entries(&self) -> Result<Vec<Arc<Mutex<Job>>>, JobStoreError> {
        let jobs = self
            .jobs
            .read()
            .map_err(|_| JobStoreError::Storage("job table poisoned".to_string()))?;
        Ok(jobs.values().cloned().collect())
    }

    pub(crate) fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        match self.entry(job_id)? {
            Some(entry) => Ok(Some(lock(&entry)?.clone())),
            None => Ok(None),
        }
    }

    /// Apply `transition` under the job's lock. `persist` sees the new
    /// version before it becomes visible; if it fails nothing changes.
    pub(crate) fn transition<P>(
        &self,
        job_id: JobId,
        transition: JobTransition,
        persist: P,
    ) -> Result<Job, JobStoreError>
    where
        P: FnOnce(&Job) -> Result<(), JobStoreError>,
    {
        let entry = self.entry(job_id)?.ok_or(JobStoreError::NotFound(job_id))?;
        let mut current = lock(&entry)?;
        // Removed while we waited for the lock.
        if !self.is_live(job_id, &entry)? {
            return Err(JobStoreError::NotFound(job_id));
        }
        let mut next = current.clone();
        next.apply(transition, Utc::now())?;
        persist(&next)?;
        *current = next;
        Ok(current.clone())
    }

    pub(crate) fn claim_next<P>(&self, persist: P) -> Result<Option<Job>, JobStoreError>
    where
        P: Fn(&Job) -> Result<(), JobStoreError>,
    {
        loop {
            let Some(job_id) = lock(&self.queue)?.pop_front() else {
                return Ok(None);
            };
            match self.transition(job_id, JobTransition::Start, &persist) {
                Ok(job) => return Ok(Some(job)),
                // Stale queue entry; the job already moved on.
                Err(JobStoreError::InvalidTransition { .. }) | Err(JobStoreError::NotFound(_)) => {
                    continue;
                }
                Err(e) => {
                    lock(&self.queue)?.push_front(job_id);
                    return Err(e);
                }
            }
        }
    }

    /// Remove a job that is not `processing`. `unpersist` runs first; if it
    /// fails the job stays.
    pub(crate) fn remove<P>(&self, job_id: JobId, unpersist: P) -> Result<Job, JobStoreError>
    where
        P: FnOnce(&Job) -> Result<(), JobStoreError>,
    {
        let entry = self.entry(job_id)?.ok_or(JobStoreError::NotFound(job_id))?;
        let current = lock(&entry)?;
        if !self.is_live(job_id, &entry)? {
            return Err(JobStoreError::NotFound(job_id));
        }
        if current.state() == JobState::Processing {
            return Err(JobStoreError::InUse {
                job_id,
                state: current.state(),
            });
        }
        unpersist(&current)?;
        self.jobs
            .write()
            .map_err(|_| JobStoreError::Storage("job table poisoned".to_string()))?
            .remove(&job_id);
        // A pending id left in the queue is skipped by `claim_next`.
        Ok(current.clone())
    }

    pub(crate) fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        let mut result = Vec::new();
        for entry in self.entries()? {
            let job = lock(&entry)?;
            if filter.matches(&job) {
                result.push(job.clone());
            }
        }
        result.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then(b.id().cmp(&a.id())));
        result.truncate(filter.limit);
        Ok(result)
    }

    pub(crate) fn stats(&self) -> Result<JobStats, JobStoreError> {
        let mut stats = JobStats::default();
        for entry in self.entries()? {
            stats.count(lock(&entry)?.state());
        }
        Ok(stats)
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    table: JobTable,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl JobStore for InMemoryJobStore {
    fn create(&self, subject: SubjectRef, recording: RecordingMeta) -> Result<Job, JobStoreError> {
        let job = Job::new(JobId::new(), subject, recording, Utc::now());
        self.table.insert(job.clone())?;
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.table.get(job_id)
    }

    fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError> {
        self.table.transition(job_id, transition, |_| Ok(()))
    }

    fn fail_unpersisted(&self, job_id: JobId, message: &str) -> Result<Job, JobStoreError> {
        self.table
            .transition(job_id, JobTransition::Fail(message.to_string()), |_| Ok(()))
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        self.table.claim_next(|_| Ok(()))
    }

    fn delete(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.table.remove(job_id, |_| Ok(()))
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        self.table.list(filter)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.table.stats()
    }
}

impl<S: JobStore + ?Sized> JobStore for Arc<S> {
    fn create(&self, subject: SubjectRef, recording: RecordingMeta) -> Result<Job, JobStoreError> {
        (**self).create(subject, recording)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn transition(&self, job_id: JobId, transition: JobTransition) -> Result<Job, JobStoreError> {
        (**self).transition(job_id, transition)
    }

    fn fail_unpersisted(&self, job_id: JobId, message: &str) -> Result<Job, JobStoreError> {
        (**self).fail_unpersisted(job_id, message)
    }

    fn claim_next(&self) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next()
    }

    fn delete(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        (**self).delete(job_id)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobStoreError> {
        (**self).list(filter)
    }

    fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::types::tests::{recording_meta, sample_result};
    use proptest::prelude::*;
    use std::sync::Barrier;
    use std::thread;

    fn subject(s: &str) -> SubjectRef {
        SubjectRef::new(s).unwrap()
    }

    #[test]
    fn create_and_claim() {
        let store = InMemoryJobStore::new();

        let job = store.create(subject("p-1"), recording_meta()).unwrap();
        assert_eq!(job.state(), JobState::Pending);

        let claimed = store.claim_next().unwrap().unwrap();
        assert_eq!(claimed.id(), job.id());
        assert_eq!(claimed.state(), JobState::Processing);

        // No more jobs
        assert!(store.claim_next().unwrap().is_none());
    }

    #[test]
    fn claims_are_fifo() {
        let store = InMemoryJobStore::new();
        let ids: Vec<_> = (0..5)
            .map(|i| store.create(subject(&format!("p-{i}")), recording_meta()).unwrap().id())
            .collect();

        let claimed: Vec<_> = std::iter::from_fn(|| store.claim_next().unwrap())
            .map(|j| j.id())
            .collect();
        assert_eq!(claimed, ids);
    }

    #[test]
    fn unknown_job_is_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        assert!(store.get(id).unwrap().is_none());
        assert_eq!(
            store.transition(id, JobTransition::Start),
            Err(JobStoreError::NotFound(id))
        );
    }

    #[test]
    fn duplicate_completion_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = store.create(subject("p-1"), recording_meta()).unwrap();
        store.claim_next().unwrap();

        store
            .transition(job.id(), JobTransition::Complete(sample_result()))
            .unwrap();
        let err = store
            .transition(job.id(), JobTransition::Fail("late".into()))
            .unwrap_err();
        assert!(matches!(err, JobStoreError::InvalidTransition { .. }));

        let stored = store.get(job.id()).unwrap().unwrap();
        assert_eq!(stored.state(), JobState::Processed);
        assert!(stored.error_message().is_none());
    }

    #[test]
    fn racing_terminal_transitions_have_one_winner() {
        let store = Arc::new(InMemoryJobStore::new());
        let job = store.create(subject("p-1"), recording_meta()).unwrap();
        store.claim_next().unwrap();

        let n = 8;
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n)
            .map(|i| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let id = job.id();
                thread::spawn(move || {
                    barrier.wait();
                    let t = if i % 2 == 0 {
                        JobTransition::Complete(sample_result())
                    } else {
                        JobTransition::Fail(format!("worker {i}"))
                    };
                    store.transition(id, t).is_ok()
                })
            })
            .collect();

        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);

        let stored = store.get(job.id()).unwrap().unwrap();
        assert!(stored.state().is_terminal());
        assert_eq!(stored.history().len(), 3);
    }

    #[test]
    fn concurrent_claims_never_share_a_job() {
        let store = Arc::new(InMemoryJobStore::new());
        for i in 0..40 {
            store.create(subject(&format!("p-{i}")), recording_meta()).unwrap();
        }

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = Arc::clone(&store);
                thread::spawn(move || {
                    std::iter::from_fn(|| store.claim_next().unwrap())
                        .map(|j| j.id())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all: Vec<JobId> = handles.into_iter().flat_map(|h| h.join().unwrap()).collect();
        assert_eq!(all.len(), 40);
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 40);
    }

    #[test]
    fn list_filters_by_subject_and_state() {
        let store = InMemoryJobStore::new();
        let a1 = store.create(subject("a"), recording_meta()).unwrap();
        let a2 = store.create(subject("a"), recording_meta()).unwrap();
        store.create(subject("b"), recording_meta()).unwrap();
        store.claim_next().unwrap();

        let for_a = store
            .list(&JobFilter::default().with_subject(subject("a")))
            .unwrap();
        assert_eq!(
            for_a.iter().map(|j| j.id()).collect::<Vec<_>>(),
            vec![a2.id(), a1.id()]
        );

        let processing = store
            .list(&JobFilter::default().with_state(JobState::Processing))
            .unwrap();
        assert_eq!(processing.len(), 1);
        assert_eq!(processing[0].id(), a1.id());

        let limited = store.list(&JobFilter::default().with_limit(1)).unwrap();
        assert_eq!(limited.len(), 1);
    }

    #[test]
    fn stats_tracking() {
        let store = InMemoryJobStore::new();
        for i in 0..5 {
            store.create(subject(&format!("p-{i}")), recording_meta()).unwrap();
        }

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 5);

        let first = store.claim_next().unwrap().unwrap();
        store.claim_next().unwrap();
        store
            .transition(first.id(), JobTransition::Fail("inference failed".into()))
            .unwrap();

        let stats = store.stats().unwrap();
        assert_eq!(stats.pending, 3);
        assert_eq!(stats.processing, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.total(), 5);
    }

    #[test]
    fn delete_removes_finished_and_pending_jobs_but_not_processing_ones() {
        let store = InMemoryJobStore::new();
        let running = store.create(subject("p-1"), recording_meta()).unwrap();
        let waiting = store.create(subject("p-2"), recording_meta()).unwrap();
        store.claim_next().unwrap();

        assert_eq!(
            store.delete(running.id()),
            Err(JobStoreError::InUse {
                job_id: running.id(),
                state: JobState::Processing
            })
        );
        assert!(store.get(running.id()).unwrap().is_some());

        let removed = store.delete(waiting.id()).unwrap();
        assert_eq!(removed.state(), JobState::Pending);
        assert!(store.get(waiting.id()).unwrap().is_none());
        assert_eq!(store.delete(waiting.id()), Err(JobStoreError::NotFound(waiting.id())));
        // The stale queue entry is skipped.
        assert!(store.claim_next().unwrap().is_none());

        store
            .transition(running.id(), JobTransition::Complete(sample_result()))
            .unwrap();
        store.delete(running.id()).unwrap();
        assert_eq!(store.stats().unwrap().total(), 0);
    }

    #[test]
    fn deleted_job_cannot_be_transitioned() {
        let store = InMemoryJobStore::new();
        let job = store.create(subject("p-1"), recording_meta()).unwrap();
        store.delete(job.id()).unwrap();

        assert_eq!(
            store.transition(job.id(), JobTransition::Start),
            Err(JobStoreError::NotFound(job.id()))
        );
    }

    #[test]
    fn unpersisted_failure_is_visible_in_memory() {
        let store = InMemoryJobStore::new();
        let job = store.create(subject("p-1"), recording_meta()).unwrap();
        store.claim_next().unwrap();

        let failed = store.fail_unpersisted(job.id(), "internal error").unwrap();
        assert_eq!(failed.state(), JobState::Failed);
        assert_eq!(failed.error_message(), Some("internal error"));
        assert!(matches!(
            store.fail_unpersisted(job.id(), "again"),
            Err(JobStoreError::InvalidTransition { .. })
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Start,
        Complete,
        Fail,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Start), Just(Op::Complete), Just(Op::Fail)]
    }

    proptest! {
        #[test]
        fn any_transition_sequence_respects_the_state_machine(ops in prop::collection::vec(op(), 0..12)) {
            let store = InMemoryJobStore::new();
            let id = store.create(subject("p"), recording_meta()).unwrap().id();

            for op in ops {
                let before = store.get(id).unwrap().unwrap();
                let t = match op {
                    Op::Start => JobTransition::Start,
                    Op::Complete => JobTransition::Complete(sample_result()),
                    Op::Fail => JobTransition::Fail("failed".into()),
                };
                match store.transition(id, t) {
                    Ok(after) => {
                        prop_assert!(!before.state().is_terminal());
                        prop_assert_eq!(after.history().len(), before.history().len() + 1);
                    }
                    Err(_) => {
                        prop_assert_eq!(store.get(id).unwrap().unwrap(), before);
                    }
                }

                let now = store.get(id).unwrap().unwrap();
                prop_assert_eq!(now.result().is_some(), now.state() == JobState::Processed);
                prop_assert_eq!(now.error_message().is_some(), now.state() == JobState::Failed);
            }
        }
    }
}
