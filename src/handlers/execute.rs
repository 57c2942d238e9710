use chrono::Utc;

use crate::domain::JobStatus;
use crate::executor::{DispatchFailure, RunKind, RunRequest};
use crate::master::MasterContext;
use crate::wire::message::{
    payload_str, string_value, CommandMessage, CommandResult, FailureCode, PayloadMap,
};

use super::{required_id, store_failure, CommandHandler, HandlerFailure};

/// `ExecuteJob {job_id, kind?}`: hands a stored job to a worker and marks it running.
pub struct ExecuteJobHandler;

impl CommandHandler for ExecuteJobHandler {
    fn handle(
        &self,
        context: &MasterContext,
        command: &CommandMessage,
    ) -> Result<CommandResult, HandlerFailure> {
        let job_id = match required_id(command, "job_id") {
            Ok(job_id) => job_id,
            Err(result) => return Ok(result),
        };
        let kind = match command.payload.get("kind") {
            None => RunKind::Manual,
            Some(_) => match payload_str(&command.payload, "kind").and_then(RunKind::parse) {
                Some(kind) => kind,
                None => {
                    return Ok(CommandResult::failure(
                        command,
                        FailureCode::InvalidPayload,
                        "'kind' must be one of manual, schedule, debug",
                    ))
                }
            },
        };

        let job = match context.jobs.get(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => return Ok(not_found(command, job_id)),
            Err(error) => return Ok(store_failure(command, error)),
        };

        if kind == RunKind::Schedule && !job.auto {
            return Ok(CommandResult::failure(
                command,
                FailureCode::JobDisabled,
                format!("job '{job_id}' is disabled for scheduled runs"),
            ));
        }

        let run = RunRequest {
            kind,
            job_id: Some(job.id.clone()),
            file_id: None,
            run_type: job.run_type,
            script: job.script.clone(),
            configs: job.configs.clone(),
        };
        let dispatched = match context.executor.dispatch(run) {
            Ok(dispatched) => dispatched,
            Err(DispatchFailure::NoWorkerAvailable) => {
                return Ok(CommandResult::failure(
                    command,
                    FailureCode::NoWorkerAvailable,
                    format!("no live worker can run job '{job_id}'"),
                ))
            }
            Err(error) => return Err(HandlerFailure::Executor(error)),
        };

        let started_at = Utc::now();
        let execution_id = dispatched.execution_id.to_string();
        let marked = context.jobs.update(job_id, &mut |job| {
            job.status = JobStatus::Running;
            job.start_time = Some(started_at);
            job.host = Some(dispatched.worker.clone());
            job.history_id = Some(execution_id.clone());
        });
        match marked {
            Ok(Some(_)) => {}
            Ok(None) => return Ok(not_found(command, job_id)),
            Err(error) => return Ok(store_failure(command, error)),
        }

        let mut payload = PayloadMap::new();
        payload.insert("job_id".to_owned(), string_value(job_id));
        payload.insert("execution_id".to_owned(), string_value(execution_id));
        payload.insert("worker".to_owned(), string_value(dispatched.worker));
        Ok(CommandResult::ok(command, payload))
    }
}

fn not_found(command: &CommandMessage, job_id: &str) -> CommandResult {
    CommandResult::failure(
        command,
        FailureCode::NotFound,
        format!("job '{job_id}' not found"),
    )
}
