use crate::domain::{FileType, JobRunType};
use crate::executor::{DispatchFailure, RunKind, RunRequest};
use crate::master::MasterContext;
use crate::wire::message::{string_value, CommandMessage, CommandResult, FailureCode, PayloadMap};

use super::{required_id, store_failure, CommandHandler, HandlerFailure};

/// `ExecuteDebug {file_id}`: runs the content of a managed file once on a worker.
pub struct ExecuteDebugHandler;

impl CommandHandler for ExecuteDebugHandler {
    fn handle(
        &self,
        context: &MasterContext,
        command: &CommandMessage,
    ) -> Result<CommandResult, HandlerFailure> {
        let file_id = match required_id(command, "file_id") {
            Ok(file_id) => file_id,
            Err(result) => return Ok(result),
        };

        let file = match context.files.get(file_id) {
            Ok(Some(file)) => file,
            Ok(None) => {
                return Ok(CommandResult::failure(
                    command,
                    FailureCode::NotFound,
                    format!("file '{file_id}' not found"),
                ))
            }
            Err(error) => return Ok(store_failure(command, error)),
        };

        if file.file_type == FileType::Directory || file.content.trim().is_empty() {
            return Ok(CommandResult::failure(
                command,
                FailureCode::InvalidPayload,
                format!("file '{file_id}' has no script content"),
            ));
        }

        let run = RunRequest {
            kind: RunKind::Debug,
            job_id: None,
            file_id: Some(file.id.clone()),
            run_type: match file.file_type {
                FileType::Hive => JobRunType::Hive,
                _ => JobRunType::Shell,
            },
            script: file.content,
            configs: Default::default(),
        };

        let dispatched = match context.executor.dispatch(run) {
            Ok(dispatched) => dispatched,
            Err(DispatchFailure::NoWorkerAvailable) => {
                return Ok(CommandResult::failure(
                    command,
                    FailureCode::NoWorkerAvailable,
                    "no live worker can run the debug script",
                ))
            }
            Err(error) => return Err(HandlerFailure::Executor(error)),
        };

        let mut payload = PayloadMap::new();
        payload.insert("file_id".to_owned(), string_value(file_id));
        payload.insert(
            "execution_id".to_owned(),
            string_value(dispatched.execution_id.to_string()),
        );
        payload.insert("worker".to_owned(), string_value(dispatched.worker));
        Ok(CommandResult::ok(command, payload))
    }
}
