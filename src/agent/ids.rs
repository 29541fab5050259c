//! Collision-resistant identifiers for job workspaces.
//!
//! An id looks like `issue-42-1718000000000-7`: job kind, job key, wall-clock
//! milliseconds and a process-wide sequence number. The sequence makes two ids
//! generated in the same millisecond distinct, and the timestamp keeps ids
//! distinct across server restarts.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use serde::{Deserialize, Serialize};

static SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Which pipeline a job belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    Issue,
    Review,
}

impl JobKind {
    /// Directory-name prefix for workspaces of this kind.
    pub fn prefix(self) -> &'static str {
        match self {
            JobKind::Issue => "issue",
            JobKind::Review => "review",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.prefix())
    }
}

/// Unique identifier of one pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WorkspaceId {
    kind: JobKind,
    key: u64,
    nonce: String,
}

impl WorkspaceId {
    pub fn generate(kind: JobKind, key: u64) -> Self {
        let millis = Utc::now().timestamp_millis();
        let seq = SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self {
            kind,
            key,
            nonce: format!("{}-{}", millis, seq),
        }
    }

    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn key(&self) -> u64 {
        self.key
    }

    /// Prefix shared by every workspace of this kind and key, used to find
    /// leftovers of earlier runs. Ends with `-` so key 4 never matches 42.
    pub fn stale_prefix(kind: JobKind, key: u64) -> String {
        format!("{}-{}-", kind.prefix(), key)
    }

    /// Directory name under the worktrees base directory.
    pub fn dir_name(&self) -> String {
        self.to_string()
    }

    /// Working branch for a new issue job.
    pub fn issue_branch(&self) -> String {
        format!("airgit/issue-{}-{}", self.key, self.nonce)
    }
}

impl fmt::Display for WorkspaceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}-{}", self.kind.prefix(), self.key, self.nonce)
    }
}
