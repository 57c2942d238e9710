use std::fmt;

use chrono::Utc;
use dashmap::DashMap;

use crate::domain::{JobDefinition, JobStatus, ManagedFile};

#[derive(Debug)]
pub enum StoreError {
    Backend { operation: &'static str, message: String },
}

impl StoreError {
    pub fn backend(operation: &'static str, error: impl fmt::Display) -> Self {
        Self::Backend {
            operation,
            message: error.to_string(),
        }
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backend { operation, message } => {
                write!(f, "store backend failed during {operation}: {message}")
            }
        }
    }
}

impl std::error::Error for StoreError {}

/// Result of an update guarded by a predicate on the stored job.
#[derive(Debug)]
pub enum GuardedUpdate {
    Applied(JobDefinition),
    /// The predicate rejected the job; carries it unchanged.
    Rejected(JobDefinition),
    Missing,
}

/// Job definitions keyed by job id. `Ok(None)` means the job does not exist.
pub trait JobStore: Send + Sync {
    fn get(&self, job_id: &str) -> Result<Option<JobDefinition>, StoreError>;

    fn put(&self, job: JobDefinition) -> Result<(), StoreError>;

    /// Applies `apply` only if `admit` accepts the stored job. Check and
    /// write are atomic with respect to other updates of the same job.
    fn update_if(
        &self,
        job_id: &str,
        admit: &dyn Fn(&JobDefinition) -> bool,
        apply: &mut dyn FnMut(&mut JobDefinition),
    ) -> Result<GuardedUpdate, StoreError>;

    /// Applies `apply` to the stored job and returns the updated copy.
    fn update(
        &self,
        job_id: &str,
        apply: &mut dyn FnMut(&mut JobDefinition),
    ) -> Result<Option<JobDefinition>, StoreError> {
        Ok(match self.update_if(job_id, &|_| true, apply)? {
            GuardedUpdate::Applied(job) | GuardedUpdate::Rejected(job) => Some(job),
            GuardedUpdate::Missing => None,
        })
    }

    /// Cancels the job if it is still running.
    fn cancel(&self, job_id: &str) -> Result<GuardedUpdate, StoreError> {
        self.update_if(job_id, &JobDefinition::is_running, &mut |job| {
            job.status = JobStatus::Cancelled;
            job.last_result = Some(JobStatus::Cancelled.as_str().to_owned());
            job.last_end_time = Some(Utc::now());
        })
    }
}

/// Managed script files keyed by file id.
pub trait FileStore: Send + Sync {
    fn get(&self, file_id: &str) -> Result<Option<ManagedFile>, StoreError>;

    fn put(&self, file: ManagedFile) -> Result<(), StoreError>;
}

#[derive(Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<String, JobDefinition>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }
}

impl JobStore for InMemoryJobStore {
    fn get(&self, job_id: &str) -> Result<Option<JobDefinition>, StoreError> {
        Ok(self.jobs.get(job_id).map(|entry| entry.value().clone()))
    }

    fn put(&self, job: JobDefinition) -> Result<(), StoreError> {
        self.jobs.insert(job.id.clone(), job);
        Ok(())
    }

    fn update_if(
        &self,
        job_id: &str,
        admit: &dyn Fn(&JobDefinition) -> bool,
        apply: &mut dyn FnMut(&mut JobDefinition),
    ) -> Result<GuardedUpdate, StoreError> {
        // The entry guard holds the shard lock across check and write.
        let Some(mut entry) = self.jobs.get_mut(job_id) else {
            return Ok(GuardedUpdate::Missing);
        };
        if !admit(entry.value()) {
            return Ok(GuardedUpdate::Rejected(entry.value().clone()));
        }
        apply(entry.value_mut());
        entry.value_mut().touch();
        Ok(GuardedUpdate::Applied(entry.value().clone()))
    }
}

#[derive(Default)]
pub struct InMemoryFileStore {
    files: DashMap<String, ManagedFile>,
}

impl InMemoryFileStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FileStore for InMemoryFileStore {
    fn get(&self, file_id: &str) -> Result<Option<ManagedFile>, StoreError> {
        Ok(self.files.get(file_id).map(|entry| entry.value().clone()))
    }

    fn put(&self, file: ManagedFile) -> Result<(), StoreError> {
        self.files.insert(file.id.clone(), file);
        Ok(())
    }
}
