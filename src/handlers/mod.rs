mod cancel;
mod debug;
mod execute;
mod update;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::executor::DispatchFailure;
use crate::master::MasterContext;
use crate::store::StoreError;
use crate::wire::message::{payload_str, CommandMessage, CommandOperate, CommandResult, FailureCode};

pub use cancel::CancelJobHandler;
pub use debug::ExecuteDebugHandler;
pub use execute::ExecuteJobHandler;
pub use update::UpdateJobHandler;

/// Unexpected fault inside a handler. Never answered on the wire.
#[derive(Debug)]
pub enum HandlerFailure {
    Executor(DispatchFailure),
    Internal(String),
}

impl fmt::Display for HandlerFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Executor(source) => write!(f, "job executor failed: {source}"),
            Self::Internal(message) => write!(f, "handler fault: {message}"),
        }
    }
}

impl std::error::Error for HandlerFailure {}

/// One command strategy. Domain outcomes, including "not found", are
/// returned as results; `Err` is reserved for faults.
pub trait CommandHandler: Send + Sync {
    fn handle(
        &self,
        context: &MasterContext,
        command: &CommandMessage,
    ) -> Result<CommandResult, HandlerFailure>;
}

/// Fixed operate to handler mapping, built once at startup.
pub struct HandlerTable {
    handlers: BTreeMap<CommandOperate, Arc<dyn CommandHandler>>,
}

impl HandlerTable {
    pub fn standard() -> Self {
        Self::builder()
            .with(CommandOperate::ExecuteDebug, Arc::new(ExecuteDebugHandler))
            .with(CommandOperate::CancelJob, Arc::new(CancelJobHandler))
            .with(CommandOperate::UpdateJob, Arc::new(UpdateJobHandler))
            .with(CommandOperate::ExecuteJob, Arc::new(ExecuteJobHandler))
            .build()
    }

    pub fn builder() -> HandlerTableBuilder {
        HandlerTableBuilder {
            handlers: BTreeMap::new(),
        }
    }

    pub fn get(&self, operate: CommandOperate) -> Option<&Arc<dyn CommandHandler>> {
        self.handlers.get(&operate)
    }
}

pub struct HandlerTableBuilder {
    handlers: BTreeMap<CommandOperate, Arc<dyn CommandHandler>>,
}

impl HandlerTableBuilder {
    pub fn with(mut self, operate: CommandOperate, handler: Arc<dyn CommandHandler>) -> Self {
        self.handlers.insert(operate, handler);
        self
    }

    pub fn build(self) -> HandlerTable {
        HandlerTable {
            handlers: self.handlers,
        }
    }
}

fn required_id<'a>(command: &'a CommandMessage, key: &'static str) -> Result<&'a str, CommandResult> {
    match payload_str(&command.payload, key) {
        Some(value) if !value.trim().is_empty() => Ok(value),
        Some(_) => Err(CommandResult::failure(
            command,
            FailureCode::InvalidPayload,
            format!("'{key}' must not be empty"),
        )),
        None => Err(CommandResult::failure(
            command,
            FailureCode::InvalidPayload,
            format!("payload requires string field '{key}'"),
        )),
    }
}

fn store_failure(command: &CommandMessage, error: StoreError) -> CommandResult {
    CommandResult::failure(command, FailureCode::StoreError, error.to_string())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use crate::executor::testing::FakeExecutor;
    use crate::executor::JobExecutor;
    use crate::logging::testing::memory_logger;
    use crate::logging::LogLevel;
    use crate::master::MasterContext;
    use crate::registry::ConnectionRegistry;
    use crate::store::{InMemoryFileStore, InMemoryJobStore};

    pub(crate) fn context_with(executor: Arc<dyn JobExecutor>) -> MasterContext {
        let (logger, _) = memory_logger(LogLevel::Error);
        MasterContext {
            registry: Arc::new(ConnectionRegistry::new()),
            jobs: Arc::new(InMemoryJobStore::new()),
            files: Arc::new(InMemoryFileStore::new()),
            executor,
            logger,
        }
    }

    pub(crate) fn context() -> MasterContext {
        context_with(Arc::new(FakeExecutor::new()))
    }
}
