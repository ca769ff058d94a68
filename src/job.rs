use crate::protocol::JobId;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Pending,
    Fetching,
    Forwarded,
    Aggregating,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn can_advance_to(&self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Pending, Fetching)
                | (Pending, Failed)
                | (Fetching, Forwarded)
                | (Fetching, Aggregating)
                | (Fetching, Failed)
                | (Forwarded, Aggregating)
                | (Aggregating, Done)
                | (Aggregating, Failed)
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobState::Pending => write!(f, "PENDING"),
            JobState::Fetching => write!(f, "FETCHING"),
            JobState::Forwarded => write!(f, "FORWARDED"),
            JobState::Aggregating => write!(f, "AGGREGATING"),
            JobState::Done => write!(f, "DONE"),
            JobState::Failed => write!(f, "FAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Invalid job transition {from} -> {to}")]
pub struct InvalidTransition {
    pub from: JobState,
    pub to: JobState,
}

/// One client request, owned by the task running it.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: JobId,
    pub url: String,
    pub request_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    state: JobState,
}

impl Job {
    pub fn new(url: impl Into<String>, request_id: Option<String>) -> Self {
        Self {
            id: JobId::generate(),
            url: url.into(),
            request_id,
            requested_at: Utc::now(),
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    /// Move forward along the lifecycle. Backward moves, skips and anything
    /// after a terminal state are rejected.
    pub fn advance(&mut self, next: JobState) -> Result<(), InvalidTransition> {
        if !self.state.can_advance_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        debug!("Job {} {} -> {}", self.id, self.state, next);
        self.state = next;
        Ok(())
    }
}

/// Live jobs of one scraping server, for status lookups and stats.
#[derive(Debug, Default)]
pub struct JobTable {
    jobs: DashMap<JobId, JobState>,
}

impl JobTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track `job` until the returned registration is dropped.
    pub fn register(self: &Arc<Self>, job: &Job) -> JobRegistration {
        self.jobs.insert(job.id.clone(), job.state());
        JobRegistration {
            table: Arc::clone(self),
            id: job.id.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn state_of(&self, id: &JobId) -> Option<JobState> {
        self.jobs.get(id).map(|entry| *entry.value())
    }

    pub fn count_in(&self, state: JobState) -> usize {
        self.jobs.iter().filter(|entry| *entry.value() == state).count()
    }

    pub fn snapshot(&self) -> JobTableStats {
        let mut stats = JobTableStats::default();
        for entry in self.jobs.iter() {
            match entry.value() {
                JobState::Pending => stats.pending += 1,
                JobState::Fetching => stats.fetching += 1,
                JobState::Forwarded => stats.forwarded += 1,
                JobState::Aggregating => stats.aggregating += 1,
                JobState::Done | JobState::Failed => stats.finishing += 1,
            }
        }
        stats
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobTableStats {
    pub pending: usize,
    pub fetching: usize,
    pub forwarded: usize,
    pub aggregating: usize,
    pub finishing: usize,
}

/// Removes its job from the table on drop, whichever way the job ends.
pub struct JobRegistration {
    table: Arc<JobTable>,
    id: JobId,
}

impl JobRegistration {
    pub fn update(&self, state: JobState) {
        if let Some(mut entry) = self.table.jobs.get_mut(&self.id) {
            *entry = state;
        }
    }

    /// Advance the job and mirror the new state into the table.
    pub fn advance(&self, job: &mut Job, next: JobState) -> Result<(), InvalidTransition> {
        job.advance(next)?;
        self.update(next);
        Ok(())
    }
}

impl Drop for JobRegistration {
    fn drop(&mut self) {
        self.table.jobs.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_happy_path_transitions() {
        let mut job = Job::new("http://example.com", None);
        assert_eq!(job.state(), JobState::Pending);
        job.advance(JobState::Fetching).unwrap();
        job.advance(JobState::Forwarded).unwrap();
        job.advance(JobState::Aggregating).unwrap();
        job.advance(JobState::Done).unwrap();
        assert!(job.state().is_terminal());
    }

    #[test]
    fn test_fetch_failure_path() {
        let mut job = Job::new("http://nope.invalid", None);
        job.advance(JobState::Fetching).unwrap();
        job.advance(JobState::Failed).unwrap();
        assert_eq!(job.state(), JobState::Failed);
    }

    #[test]
    fn test_transitions_are_monotonic() {
        let mut job = Job::new("http://example.com", None);
        job.advance(JobState::Fetching).unwrap();
        job.advance(JobState::Forwarded).unwrap();

        let err = job.advance(JobState::Fetching).unwrap_err();
        assert_eq!(err.from, JobState::Forwarded);
        assert_eq!(err.to, JobState::Fetching);
        assert!(job.advance(JobState::Done).is_err());
        assert!(job.advance(JobState::Failed).is_err());
    }

    #[test]
    fn test_terminal_state_is_final() {
        let mut job = Job::new("http://example.com", None);
        job.advance(JobState::Failed).unwrap();
        for next in [
            JobState::Pending,
            JobState::Fetching,
            JobState::Forwarded,
            JobState::Aggregating,
            JobState::Done,
            JobState::Failed,
        ] {
            assert!(job.advance(next).is_err(), "{next}");
        }
    }

    #[test]
    fn test_job_table_tracks_registration() {
        let table = Arc::new(JobTable::new());
        let mut job = Job::new("http://example.com", Some("r1".to_string()));
        {
            let registration = table.register(&job);
            assert_eq!(table.len(), 1);
            registration.advance(&mut job, JobState::Fetching).unwrap();
            assert_eq!(table.count_in(JobState::Fetching), 1);
            assert_eq!(table.snapshot().fetching, 1);
        }
        assert!(table.is_empty());
    }
}
