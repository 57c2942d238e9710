//! Scheduling entities referenced by command payloads. Persistence and
//! schedule evaluation live elsewhere; these types only carry the data.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobRunType {
    #[default]
    Shell,
    Hive,
    Spark,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobScheduleType {
    #[default]
    Independent,
    Dependent,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Idle,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Pre/post processing step attached to a job.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Processor {
    pub id: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: String,
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub description: String,
    pub group_id: Option<i64>,
    pub host_group_id: Option<i64>,
    /// Whether the scheduler may trigger this job on its own.
    pub auto: bool,
    pub cron_expression: Option<String>,
    pub cycle: Option<String>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub job_dependencies: Vec<String>,
    #[serde(default)]
    pub ready_dependencies: Vec<String>,
    #[serde(default)]
    pub pre_processors: Vec<Processor>,
    #[serde(default)]
    pub post_processors: Vec<Processor>,
    #[serde(default)]
    pub resources: Vec<BTreeMap<String, String>>,
    #[serde(default)]
    pub configs: BTreeMap<String, String>,
    #[serde(default)]
    pub run_type: JobRunType,
    #[serde(default)]
    pub schedule_type: JobScheduleType,
    #[serde(default)]
    pub script: String,
    pub timezone: Option<String>,
    #[serde(default)]
    pub offset: i32,
    #[serde(default)]
    pub status: JobStatus,
    pub host: Option<String>,
    pub history_id: Option<String>,
    pub last_result: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub last_end_time: Option<DateTime<Utc>>,
    pub statistic_start_time: Option<DateTime<Utc>>,
    pub statistic_end_time: Option<DateTime<Utc>>,
    pub gmt_create: DateTime<Utc>,
    pub gmt_modified: DateTime<Utc>,
}

impl JobDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            owner: owner.into(),
            description: String::new(),
            group_id: None,
            host_group_id: None,
            auto: true,
            cron_expression: None,
            cycle: None,
            dependencies: Vec::new(),
            job_dependencies: Vec::new(),
            ready_dependencies: Vec::new(),
            pre_processors: Vec::new(),
            post_processors: Vec::new(),
            resources: Vec::new(),
            configs: BTreeMap::new(),
            run_type: JobRunType::default(),
            schedule_type: JobScheduleType::default(),
            script: String::new(),
            timezone: None,
            offset: 0,
            status: JobStatus::Idle,
            host: None,
            history_id: None,
            last_result: None,
            start_time: None,
            last_end_time: None,
            statistic_start_time: None,
            statistic_end_time: None,
            gmt_create: now,
            gmt_modified: now,
        }
    }

    pub fn with_script(mut self, script: impl Into<String>) -> Self {
        self.script = script.into();
        self
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = status;
        self
    }

    pub fn is_running(&self) -> bool {
        self.status == JobStatus::Running
    }

    pub fn touch(&mut self) {
        self.gmt_modified = Utc::now();
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileType {
    Directory,
    #[default]
    Shell,
    Hive,
}

/// Script or folder node in the operator's file tree.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagedFile {
    pub id: String,
    pub name: String,
    pub owner: String,
    pub parent: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub file_type: FileType,
    pub host_group_id: Option<i64>,
    pub gmt_create: DateTime<Utc>,
    pub gmt_modified: DateTime<Utc>,
}

impl ManagedFile {
    pub fn new(id: impl Into<String>, name: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            owner: owner.into(),
            parent: None,
            content: String::new(),
            file_type: FileType::default(),
            host_group_id: None,
            gmt_create: now,
            gmt_modified: now,
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = content.into();
        self
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}
