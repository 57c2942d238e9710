use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::{JobDefinition, ManagedFile};
use crate::store::{FileStore, GuardedUpdate, JobStore, StoreError};

use super::{SledMode, StorageError};

const JOB_PREFIX: &str = "v1:job:";
const FILE_PREFIX: &str = "v1:file:";

/// Jobs and files stored as JSON documents in a single sled tree.
pub struct SledStorage {
    db: sled::Db,
}

impl SledStorage {
    pub fn open(
        data_path: &Path,
        cache_capacity: Option<u64>,
        mode: Option<SledMode>,
    ) -> Result<Self, StorageError> {
        let mut config = sled::Config::new().path(data_path);

        if let Some(cache_capacity) = cache_capacity {
            config = config.cache_capacity(cache_capacity);
        }
        if let Some(mode) = mode {
            config = config.mode(mode.into_sled());
        }

        let db = config.open().map_err(StorageError::Sled)?;
        Ok(Self { db })
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush().map(|_| ()).map_err(StorageError::Sled)
    }

    fn load<T: DeserializeOwned>(&self, key: &str, kind: &'static str) -> Result<Option<T>, StorageError> {
        let Some(raw) = self.db.get(key.as_bytes()).map_err(StorageError::Sled)? else {
            return Ok(None);
        };
        serde_json::from_slice(raw.as_ref())
            .map(Some)
            .map_err(|source| StorageError::DeserializeRecord { kind, source })
    }

    fn store<T: Serialize>(&self, key: &str, kind: &'static str, record: &T) -> Result<(), StorageError> {
        let value = serde_json::to_vec(record)
            .map_err(|source| StorageError::SerializeRecord { kind, source })?;
        self.db
            .insert(key.as_bytes(), value)
            .map_err(StorageError::Sled)?;
        Ok(())
    }

    // Read-modify-write guarded by compare-and-swap; retried when a concurrent
    // writer replaced the record in between. `admit` sees the record that is
    // about to be swapped.
    fn update_job(
        &self,
        job_id: &str,
        admit: &dyn Fn(&JobDefinition) -> bool,
        apply: &mut dyn FnMut(&mut JobDefinition),
    ) -> Result<GuardedUpdate, StorageError> {
        let key = job_key(job_id);
        loop {
            let Some(current) = self.db.get(key.as_bytes()).map_err(StorageError::Sled)? else {
                return Ok(GuardedUpdate::Missing);
            };
            let mut job: JobDefinition = serde_json::from_slice(current.as_ref())
                .map_err(|source| StorageError::DeserializeRecord { kind: "job", source })?;
            if !admit(&job) {
                return Ok(GuardedUpdate::Rejected(job));
            }
            apply(&mut job);
            job.touch();
            let next = serde_json::to_vec(&job)
                .map_err(|source| StorageError::SerializeRecord { kind: "job", source })?;

            let swapped = self
                .db
                .compare_and_swap(key.as_bytes(), Some(current), Some(next))
                .map_err(StorageError::Sled)?;
            if swapped.is_ok() {
                return Ok(GuardedUpdate::Applied(job));
            }
        }
    }
}

fn job_key(job_id: &str) -> String {
    format!("{JOB_PREFIX}{job_id}")
}

fn file_key(file_id: &str) -> String {
    format!("{FILE_PREFIX}{file_id}")
}

impl JobStore for SledStorage {
    fn get(&self, job_id: &str) -> Result<Option<JobDefinition>, StoreError> {
        self.load(&job_key(job_id), "job")
            .map_err(|error| StoreError::backend("job get", error))
    }

    fn put(&self, job: JobDefinition) -> Result<(), StoreError> {
        self.store(&job_key(&job.id), "job", &job)
            .map_err(|error| StoreError::backend("job put", error))
    }

    fn update_if(
        &self,
        job_id: &str,
        admit: &dyn Fn(&JobDefinition) -> bool,
        apply: &mut dyn FnMut(&mut JobDefinition),
    ) -> Result<GuardedUpdate, StoreError> {
        self.update_job(job_id, admit, apply)
            .map_err(|error| StoreError::backend("job update", error))
    }
}

impl FileStore for SledStorage {
    fn get(&self, file_id: &str) -> Result<Option<ManagedFile>, StoreError> {
        self.load(&file_key(file_id), "file")
            .map_err(|error| StoreError::backend("file get", error))
    }

    fn put(&self, file: ManagedFile) -> Result<(), StoreError> {
        self.store(&file_key(&file.id), "file", &file)
            .map_err(|error| StoreError::backend("file put", error))
    }
}
