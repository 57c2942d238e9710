use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use rmpv::Value;
use serde_json::json;
use uuid::Uuid;

use crate::domain::JobRunType;
use crate::logging::{LogLevel, Logger};
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::wire::codec::{CodecError, WireCodec};
use crate::wire::message::{
    string_value, CommandMessage, CommandOperate, PayloadMap, SERVER_PUSH_REQUEST_ID,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum RunKind {
    #[default]
    Manual,
    Schedule,
    Debug,
}

impl RunKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "manual" => Some(Self::Manual),
            "schedule" => Some(Self::Schedule),
            "debug" => Some(Self::Debug),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
            Self::Debug => "debug",
        }
    }
}

/// One run handed to a worker: either a stored job or a debug script.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RunRequest {
    pub kind: RunKind,
    pub job_id: Option<String>,
    pub file_id: Option<String>,
    pub run_type: JobRunType,
    pub script: String,
    pub configs: BTreeMap<String, String>,
}

impl RunRequest {
    fn to_payload(&self, execution_id: Uuid) -> PayloadMap {
        let mut payload = PayloadMap::new();
        payload.insert("execution_id".to_owned(), string_value(execution_id.to_string()));
        payload.insert("kind".to_owned(), string_value(self.kind.as_str()));
        if let Some(job_id) = &self.job_id {
            payload.insert("job_id".to_owned(), string_value(job_id.as_str()));
        }
        if let Some(file_id) = &self.file_id {
            payload.insert("file_id".to_owned(), string_value(file_id.as_str()));
        }
        payload.insert(
            "run_type".to_owned(),
            string_value(match self.run_type {
                JobRunType::Shell => "shell",
                JobRunType::Hive => "hive",
                JobRunType::Spark => "spark",
            }),
        );
        payload.insert("script".to_owned(), string_value(self.script.as_str()));
        payload.insert(
            "configs".to_owned(),
            Value::Map(
                self.configs
                    .iter()
                    .map(|(key, value)| (string_value(key.as_str()), string_value(value.as_str())))
                    .collect(),
            ),
        );
        payload
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Dispatched {
    pub execution_id: Uuid,
    pub connection_id: ConnectionId,
    pub worker: String,
}

#[derive(Debug)]
pub enum DispatchFailure {
    NoWorkerAvailable,
    Encode(CodecError),
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWorkerAvailable => write!(f, "no live worker is available"),
            Self::Encode(source) => write!(f, "failed to encode run frame: {source}"),
        }
    }
}

impl std::error::Error for DispatchFailure {}

/// Hands runs to remote workers. May block on I/O.
pub trait JobExecutor: Send + Sync {
    fn dispatch(&self, run: RunRequest) -> Result<Dispatched, DispatchFailure>;
}

/// Pushes runs onto the least-loaded worker connection in the registry.
/// A worker whose socket refuses the frame is skipped for the next one.
pub struct WorkerDispatchExecutor {
    registry: Arc<ConnectionRegistry>,
    codec: WireCodec,
    logger: Arc<Logger>,
}

impl WorkerDispatchExecutor {
    pub fn new(registry: Arc<ConnectionRegistry>, codec: WireCodec, logger: Arc<Logger>) -> Self {
        Self {
            registry,
            codec,
            logger,
        }
    }
}

impl JobExecutor for WorkerDispatchExecutor {
    fn dispatch(&self, run: RunRequest) -> Result<Dispatched, DispatchFailure> {
        let mut workers = self.registry.workers();
        if workers.is_empty() {
            return Err(DispatchFailure::NoWorkerAvailable);
        }
        workers.sort_by_key(|state| (state.load(), state.id()));

        let execution_id = Uuid::new_v4();
        let frame = CommandMessage::new(
            CommandOperate::ExecuteJob,
            SERVER_PUSH_REQUEST_ID,
            run.to_payload(execution_id),
        )
        .to_frame(&self.codec)
        .map_err(DispatchFailure::Encode)?;

        for worker in workers {
            if let Err(error) = worker.channel().write_frame(&frame) {
                self.logger.log(
                    LogLevel::Warn,
                    Some("executor"),
                    "Worker connection refused run; trying next worker",
                    Some(json!({
                        "connection_id": worker.id(),
                        "execution_id": execution_id.to_string(),
                        "error": error.to_string(),
                    })),
                );
                continue;
            }
            worker.note_dispatch();

            return Ok(Dispatched {
                execution_id,
                connection_id: worker.id(),
                worker: worker
                    .report()
                    .host
                    .unwrap_or_else(|| worker.channel().peer()),
            });
        }
        Err(DispatchFailure::NoWorkerAvailable)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use parking_lot::Mutex;
    use uuid::Uuid;

    use super::{DispatchFailure, Dispatched, JobExecutor, RunRequest};

    /// Executor that accepts every run after an optional per-job delay.
    #[derive(Default)]
    pub(crate) struct FakeExecutor {
        delays: BTreeMap<String, Duration>,
        unavailable: bool,
        runs: Mutex<Vec<RunRequest>>,
    }

    impl FakeExecutor {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn without_workers() -> Self {
            Self {
                unavailable: true,
                ..Self::default()
            }
        }

        pub(crate) fn with_delay(mut self, job_id: &str, delay: Duration) -> Self {
            self.delays.insert(job_id.to_owned(), delay);
            self
        }

        pub(crate) fn runs(&self) -> Vec<RunRequest> {
            self.runs.lock().clone()
        }
    }

    impl JobExecutor for FakeExecutor {
        fn dispatch(&self, run: RunRequest) -> Result<Dispatched, DispatchFailure> {
            if self.unavailable {
                return Err(DispatchFailure::NoWorkerAvailable);
            }
            if let Some(delay) = run.job_id.as_ref().and_then(|id| self.delays.get(id)) {
                std::thread::sleep(*delay);
            }
            self.runs.lock().push(run);
            Ok(Dispatched {
                execution_id: Uuid::new_v4(),
                connection_id: 0,
                worker: "fake-worker".to_owned(),
            })
        }
    }
}
