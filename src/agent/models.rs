use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::JobKind;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid job state: {}", s)),
        }
    }
}

/// Status record of the latest agent run for one issue.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AgentJob {
    pub issue_number: u64,
    pub kind: JobKind,
    pub state: JobState,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request_number: Option<u64>,
    #[serde(rename = "pullRequestURL", skip_serializing_if = "Option::is_none")]
    pub pull_request_url: Option<String>,
}

impl AgentJob {
    pub fn pending(issue_number: u64, kind: JobKind, message: impl Into<String>) -> Self {
        Self {
            issue_number,
            kind,
            state: JobState::Pending,
            message: message.into(),
            branch: None,
            started_at: Utc::now(),
            ended_at: None,
            pull_request_number: None,
            pull_request_url: None,
        }
    }
}

/// Body of `POST /api/agent/process`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProcessIssueRequest {
    pub issue_number: i64,
    #[serde(default)]
    pub issue_title: String,
    #[serde(default)]
    pub issue_body: String,
}

/// One PR review comment. `path` is absent for PR-level comments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReviewComment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u64>,
}

/// Body of `POST /api/agent/apply-review`.
#[derive(Debug, Clone, Deserialize)]
pub struct ApplyReviewRequest {
    pub issue_number: i64,
    pub pr_number: i64,
    #[serde(default)]
    pub comments: Vec<ReviewComment>,
}

/// Acknowledgement returned by the trigger endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub message: String,
}
