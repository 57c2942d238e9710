use std::collections::BTreeMap;

use rmpv::Value;

use crate::domain::JobDefinition;
use crate::master::MasterContext;
use crate::wire::message::{string_value, CommandMessage, CommandResult, FailureCode, PayloadMap};

use super::{required_id, store_failure, CommandHandler, HandlerFailure};

/// `UpdateJob {job_id, changes}`: edits the schedule-facing fields of a job.
pub struct UpdateJobHandler;

#[derive(Debug, Default)]
struct JobChanges {
    cron_expression: Option<Option<String>>,
    cycle: Option<Option<String>>,
    auto: Option<bool>,
    script: Option<String>,
    configs: Option<BTreeMap<String, String>>,
    timezone: Option<Option<String>>,
    description: Option<String>,
    owner: Option<String>,
}

impl JobChanges {
    fn parse(raw: &Value) -> Result<Self, String> {
        let Value::Map(entries) = raw else {
            return Err("'changes' must be a map".to_owned());
        };
        if entries.is_empty() {
            return Err("'changes' must not be empty".to_owned());
        }

        let mut changes = Self::default();
        for (key, value) in entries {
            let key = key
                .as_str()
                .ok_or_else(|| "change keys must be strings".to_owned())?;
            match key {
                "cron_expression" => changes.cron_expression = Some(nullable_string(key, value)?),
                "cycle" => changes.cycle = Some(nullable_string(key, value)?),
                "timezone" => changes.timezone = Some(nullable_string(key, value)?),
                "auto" => {
                    changes.auto = Some(value.as_bool().ok_or_else(|| mistyped(key, "boolean"))?)
                }
                "script" => changes.script = Some(string(key, value)?),
                "description" => changes.description = Some(string(key, value)?),
                "owner" => {
                    let owner = string(key, value)?;
                    if owner.trim().is_empty() {
                        return Err("'owner' must not be empty".to_owned());
                    }
                    changes.owner = Some(owner);
                }
                "configs" => changes.configs = Some(string_map(key, value)?),
                other => return Err(format!("'{other}' cannot be updated")),
            }
        }
        Ok(changes)
    }

    fn apply(&self, job: &mut JobDefinition) {
        if let Some(cron_expression) = &self.cron_expression {
            job.cron_expression = cron_expression.clone();
        }
        if let Some(cycle) = &self.cycle {
            job.cycle = cycle.clone();
        }
        if let Some(timezone) = &self.timezone {
            job.timezone = timezone.clone();
        }
        if let Some(auto) = self.auto {
            job.auto = auto;
        }
        if let Some(script) = &self.script {
            job.script = script.clone();
        }
        if let Some(description) = &self.description {
            job.description = description.clone();
        }
        if let Some(owner) = &self.owner {
            job.owner = owner.clone();
        }
        if let Some(configs) = &self.configs {
            job.configs = configs.clone();
        }
    }
}

fn mistyped(key: &str, expected: &str) -> String {
    format!("'{key}' must be a {expected}")
}

fn string(key: &str, value: &Value) -> Result<String, String> {
    value
        .as_str()
        .map(str::to_owned)
        .ok_or_else(|| mistyped(key, "string"))
}

fn nullable_string(key: &str, value: &Value) -> Result<Option<String>, String> {
    match value {
        Value::Nil => Ok(None),
        _ => string(key, value).map(Some),
    }
}

fn string_map(key: &str, value: &Value) -> Result<BTreeMap<String, String>, String> {
    let Value::Map(entries) = value else {
        return Err(mistyped(key, "map of strings"));
    };
    entries
        .iter()
        .map(|(entry_key, entry_value)| match (entry_key.as_str(), entry_value.as_str()) {
            (Some(entry_key), Some(entry_value)) => {
                Ok((entry_key.to_owned(), entry_value.to_owned()))
            }
            _ => Err(mistyped(key, "map of strings")),
        })
        .collect()
}

impl CommandHandler for UpdateJobHandler {
    fn handle(
        &self,
        context: &MasterContext,
        command: &CommandMessage,
    ) -> Result<CommandResult, HandlerFailure> {
        let job_id = match required_id(command, "job_id") {
            Ok(job_id) => job_id,
            Err(result) => return Ok(result),
        };
        let Some(raw_changes) = command.payload.get("changes") else {
            return Ok(CommandResult::failure(
                command,
                FailureCode::InvalidPayload,
                "payload requires map field 'changes'",
            ));
        };
        let changes = match JobChanges::parse(raw_changes) {
            Ok(changes) => changes,
            Err(reason) => {
                return Ok(CommandResult::failure(
                    command,
                    FailureCode::InvalidPayload,
                    reason,
                ))
            }
        };

        let updated = match context.jobs.update(job_id, &mut |job| changes.apply(job)) {
            Ok(Some(job)) => job,
            Ok(None) => {
                return Ok(CommandResult::failure(
                    command,
                    FailureCode::NotFound,
                    format!("job '{job_id}' not found"),
                ))
            }
            Err(error) => return Ok(store_failure(command, error)),
        };

        let mut payload = PayloadMap::new();
        payload.insert("job_id".to_owned(), string_value(updated.id.as_str()));
        payload.insert(
            "modified_at".to_owned(),
            string_value(updated.gmt_modified.to_rfc3339()),
        );
        Ok(CommandResult::ok(command, payload))
    }
}
