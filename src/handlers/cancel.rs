use crate::master::MasterContext;
use crate::store::GuardedUpdate;
use crate::wire::message::{string_value, CommandMessage, CommandResult, FailureCode, PayloadMap};

use super::{required_id, store_failure, CommandHandler, HandlerFailure};

/// `CancelJob {job_id}`: stops a running job and records the cancellation.
pub struct CancelJobHandler;

impl CommandHandler for CancelJobHandler {
    fn handle(
        &self,
        context: &MasterContext,
        command: &CommandMessage,
    ) -> Result<CommandResult, HandlerFailure> {
        let job_id = match required_id(command, "job_id") {
            Ok(job_id) => job_id,
            Err(result) => return Ok(result),
        };

        let cancelled = match context.jobs.cancel(job_id) {
            Ok(GuardedUpdate::Applied(job)) => job,
            Ok(GuardedUpdate::Rejected(job)) => {
                return Ok(CommandResult::failure(
                    command,
                    FailureCode::JobNotRunning,
                    format!("job '{job_id}' is {}", job.status.as_str()),
                ))
            }
            Ok(GuardedUpdate::Missing) => {
                return Ok(CommandResult::failure(
                    command,
                    FailureCode::NotFound,
                    format!("job '{job_id}' not found"),
                ))
            }
            Err(error) => return Ok(store_failure(command, error)),
        };

        let mut payload = PayloadMap::new();
        payload.insert("job_id".to_owned(), string_value(cancelled.id.as_str()));
        payload.insert("status".to_owned(), string_value(cancelled.status.as_str()));
        Ok(CommandResult::ok(command, payload))
    }
}
