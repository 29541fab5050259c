//! In-memory agent status store.
//!
//! One [`AgentJob`] per issue number, kept until the process exits. A new
//! trigger for the same issue replaces the record and starts a new *run*;
//! writes go through a [`JobHandle`] bound to that run, so a superseded
//! pipeline still winding down can never overwrite its successor's record.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;

use super::models::{AgentJob, JobState};

#[derive(Debug)]
struct Entry {
    run: u64,
    job: AgentJob,
}

#[derive(Debug, Default)]
struct Inner {
    next_run: u64,
    jobs: HashMap<u64, Entry>,
}

/// Cheaply clonable handle to the shared store.
#[derive(Debug, Clone, Default)]
pub struct AgentStatusStore {
    inner: Arc<Mutex<Inner>>,
}

impl AgentStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // Entries stay consistent even if a writer panicked mid-section.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert or replace the record for `job.issue_number`, returning the
    /// handle that owns the new run.
    pub fn set(&self, job: AgentJob) -> JobHandle {
        let key = job.issue_number;
        let mut inner = self.lock();
        inner.next_run += 1;
        let run = inner.next_run;
        inner.jobs.insert(key, Entry { run, job });
        JobHandle {
            store: self.clone(),
            key,
            run,
        }
    }

    pub fn get(&self, key: u64) -> Option<AgentJob> {
        self.lock().jobs.get(&key).map(|entry| entry.job.clone())
    }

    /// Replace the message of whatever run currently owns `key`. No-op if
    /// the key was never set.
    pub fn update_message(&self, key: u64, message: impl Into<String>) {
        if let Some(entry) = self.lock().jobs.get_mut(&key) {
            entry.job.message = message.into();
        }
    }

    pub fn len(&self) -> usize {
        self.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `f` to the record only if `run` still owns it. Terminal records
    /// are frozen.
    fn modify(&self, key: u64, run: u64, f: impl FnOnce(&mut AgentJob)) -> bool {
        let mut inner = self.lock();
        match inner.jobs.get_mut(&key) {
            Some(entry) if entry.run == run && !entry.job.state.is_terminal() => {
                f(&mut entry.job);
                true
            }
            _ => false,
        }
    }
}

/// Write access to the record of a single run.
#[derive(Debug, Clone)]
pub struct JobHandle {
    store: AgentStatusStore,
    key: u64,
    run: u64,
}

impl JobHandle {
    pub fn key(&self) -> u64 {
        self.key
    }

    /// Store-wide unique id of this run.
    pub fn run_id(&self) -> u64 {
        self.run
    }

    /// Whether this run still owns the record.
    pub fn is_current(&self) -> bool {
        self.store
            .lock()
            .jobs
            .get(&self.key)
            .is_some_and(|entry| entry.run == self.run)
    }

    pub fn update_message(&self, message: impl Into<String>) {
        let message = message.into();
        self.store.modify(self.key, self.run, |job| job.message = message);
    }

    pub fn mark_running(&self, message: impl Into<String>) {
        let message = message.into();
        self.store.modify(self.key, self.run, |job| {
            job.state = JobState::Running;
            job.message = message;
        });
    }

    pub fn set_branch(&self, branch: impl Into<String>) {
        let branch = branch.into();
        self.store
            .modify(self.key, self.run, |job| job.branch = Some(branch));
    }

    /// Transition to `completed`, optionally recording the pull request.
    pub fn complete(&self, message: impl Into<String>, pull_request: Option<(u64, String)>) {
        let message = message.into();
        self.store.modify(self.key, self.run, |job| {
            job.state = JobState::Completed;
            job.message = message;
            job.ended_at = Some(Utc::now());
            if let Some((number, url)) = pull_request {
                job.pull_request_number = Some(number);
                job.pull_request_url = Some(url);
            }
        });
    }

    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        self.store.modify(self.key, self.run, |job| {
            job.state = JobState::Failed;
            job.message = message;
            job.ended_at = Some(Utc::now());
        });
    }

    /// Current state of this run's record, if it still owns it.
    pub fn snapshot(&self) -> Option<AgentJob> {
        let inner = self.store.lock();
        inner
            .jobs
            .get(&self.key)
            .filter(|entry| entry.run == self.run)
            .map(|entry| entry.job.clone())
    }
}
