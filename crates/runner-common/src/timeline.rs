// Timeline model: issues and the per-step records reported to the job server.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

use crate::util::task_result_util::TaskResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueType {
    Error,
    Warning,
    Notice,
}

impl IssueType {
    /// Log tag written in front of the issue message.
    pub fn log_tag(&self) -> &'static str {
        match self {
            IssueType::Error => "##[error]",
            IssueType::Warning => "##[warning]",
            IssueType::Notice => "##[notice]",
        }
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IssueType::Error => f.write_str("error"),
            IssueType::Warning => f.write_str("warning"),
            IssueType::Notice => f.write_str("notice"),
        }
    }
}

/// A structured annotation (file, line, column, code...) attached to a step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issue {
    #[serde(rename = "type")]
    pub issue_type: IssueType,
    pub message: String,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

impl Issue {
    pub fn new(issue_type: IssueType, message: impl Into<String>) -> Self {
        Self {
            issue_type,
            message: message.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.data.get(key).map(String::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimelineRecordState {
    Pending,
    InProgress,
    Completed,
}

/// Progress of one job or step as seen by the job server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimelineRecord {
    pub id: Uuid,
    pub parent_id: Option<Uuid>,
    pub name: String,
    pub ref_name: Option<String>,
    pub order: Option<u32>,
    pub state: TimelineRecordState,
    pub result: Option<TaskResult>,
    pub start_time: Option<DateTime<Utc>>,
    pub finish_time: Option<DateTime<Utc>>,
    pub error_count: u32,
    pub warning_count: u32,
    pub notice_count: u32,
    pub issues: Vec<Issue>,
}

impl TimelineRecord {
    pub fn new(id: Uuid, parent_id: Option<Uuid>, name: impl Into<String>) -> Self {
        Self {
            id,
            parent_id,
            name: name.into(),
            ref_name: None,
            order: None,
            state: TimelineRecordState::Pending,
            result: None,
            start_time: None,
            finish_time: None,
            error_count: 0,
            warning_count: 0,
            notice_count: 0,
            issues: Vec::new(),
        }
    }

    pub fn issues_of(&self, issue_type: IssueType) -> impl Iterator<Item = &Issue> {
        self.issues.iter().filter(move |i| i.issue_type == issue_type)
    }
}
