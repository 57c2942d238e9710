use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;

use crate::config::AppConfig;
use crate::logging::{LogLevel, Logger};
use crate::store::{FileStore, InMemoryFileStore, InMemoryJobStore, JobStore};

use super::{expand_home_path, SledMode, SledStorage, StorageEngine, StorageError};

/// Resolves the configured engine into the job/file stores the master uses.
pub struct StorageFacade {
    engine: StorageEngine,
    data_path: Option<PathBuf>,
    jobs: Arc<dyn JobStore>,
    files: Arc<dyn FileStore>,
    sled: Option<Arc<SledStorage>>,
}

impl StorageFacade {
    pub fn initialize(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let Some(engine) = StorageEngine::parse(&app_config.storage.engine) else {
            return Err(StorageError::UnsupportedEngine {
                engine: app_config.storage.engine.clone(),
            });
        };

        let facade = match engine {
            StorageEngine::Memory => {
                logger.log(
                    LogLevel::Info,
                    Some("storage::init"),
                    "Initializing in-memory job and file stores",
                    Some(json!({ "engine": engine.as_str() })),
                );
                Self::in_memory()
            }
            StorageEngine::Sled => Self::open_sled(app_config, logger)?,
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Storage facade initialized",
            Some(json!({
                "engine": facade.engine.as_str(),
                "resolved_path": facade
                    .data_path
                    .as_ref()
                    .map(|path| path.display().to_string()),
            })),
        );

        Ok(facade)
    }

    pub fn in_memory() -> Self {
        Self {
            engine: StorageEngine::Memory,
            data_path: None,
            jobs: Arc::new(InMemoryJobStore::new()),
            files: Arc::new(InMemoryFileStore::new()),
            sled: None,
        }
    }

    fn open_sled(app_config: &AppConfig, logger: &Logger) -> Result<Self, StorageError> {
        let data_path = expand_home_path(&app_config.storage.path)?;
        let mode = match app_config.storage.sled.mode.as_deref() {
            Some(raw) => Some(SledMode::parse(raw).ok_or_else(|| StorageError::InvalidSledMode {
                mode: raw.to_owned(),
            })?),
            None => None,
        };

        logger.log(
            LogLevel::Info,
            Some("storage::init"),
            "Opening sled storage",
            Some(json!({
                "configured_path": app_config.storage.path,
                "resolved_path": data_path.display().to_string(),
                "sled": {
                    "cache_capacity": app_config.storage.sled.cache_capacity,
                    "mode": app_config.storage.sled.mode
                }
            })),
        );

        fs::create_dir_all(&data_path).map_err(|source| StorageError::CreateDataDir {
            path: data_path.clone(),
            source,
        })?;

        let sled = Arc::new(SledStorage::open(
            &data_path,
            app_config.storage.sled.cache_capacity,
            mode,
        )?);

        Ok(Self {
            engine: StorageEngine::Sled,
            data_path: Some(data_path),
            jobs: sled.clone(),
            files: sled.clone(),
            sled: Some(sled),
        })
    }

    pub fn engine(&self) -> StorageEngine {
        self.engine
    }

    pub fn data_path(&self) -> Option<&PathBuf> {
        self.data_path.as_ref()
    }

    pub fn jobs(&self) -> Arc<dyn JobStore> {
        self.jobs.clone()
    }

    pub fn files(&self) -> Arc<dyn FileStore> {
        self.files.clone()
    }

    pub fn flush(&self) -> Result<(), StorageError> {
        match &self.sled {
            Some(sled) => sled.flush(),
            None => Ok(()),
        }
    }
}
