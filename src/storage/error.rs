use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum StorageError {
    UnsupportedEngine {
        engine: String,
    },
    InvalidSledMode {
        mode: String,
    },
    HomeDirectoryUnavailable,
    CreateDataDir {
        path: PathBuf,
        source: std::io::Error,
    },
    SerializeRecord {
        kind: &'static str,
        source: serde_json::Error,
    },
    DeserializeRecord {
        kind: &'static str,
        source: serde_json::Error,
    },
    Sled(sled::Error),
}

impl fmt::Display for StorageError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedEngine { engine } => write!(
                f,
                "unsupported storage.engine '{engine}'; allowed values: memory, sled"
            ),
            Self::InvalidSledMode { mode } => write!(
                f,
                "invalid storage.sled.mode '{mode}'; allowed values: low_space, high_throughput"
            ),
            Self::HomeDirectoryUnavailable => {
                write!(f, "cannot resolve storage path because HOME is not set")
            }
            Self::CreateDataDir { path, source } => write!(
                f,
                "failed to create storage data directory '{}': {source}",
                path.display()
            ),
            Self::SerializeRecord { kind, source } => {
                write!(f, "failed to serialize {kind} record for storage: {source}")
            }
            Self::DeserializeRecord { kind, source } => {
                write!(f, "failed to deserialize {kind} record from storage: {source}")
            }
            Self::Sled(source) => write!(f, "sled storage error: {source}"),
        }
    }
}

impl std::error::Error for StorageError {}

