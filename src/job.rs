use crate::Backoff;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a job, assigned at enqueue time and never reused.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a job.
///
/// Transitions: `Pending -> Processing -> {Completed | Pending (retry) | Failed}`.
/// `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

/// Options accepted by [`Queue::enqueue`](crate::Queue::enqueue).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnqueueOptions {
    /// Queue name; determines which worker loop consumes the job.
    pub kind: String,
    /// Opaque payload, passed to the handler untouched.
    pub payload: serde_json::Value,
    /// Ceiling on execution attempts before the job fails terminally.
    pub max_retries: u32,
    /// Higher priorities are dequeued first. Negative values are valid
    /// and sort below the default of zero.
    pub priority: i64,
    /// When set, a repeat enqueue with the same key within the validity
    /// window resolves to the original job id.
    pub idempotency_key: Option<String>,
    pub backoff: Backoff,
}

impl EnqueueOptions {
    pub fn new(kind: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
            max_retries: 3,
            priority: 0,
            idempotency_key: None,
            backoff: Backoff::default(),
        }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }
}

/// Persistent record of one unit of queued work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub kind: String,
    pub payload: serde_json::Value,
    pub state: JobState,
    /// Dequeue-and-execute cycles attempted so far. Incremented exactly
    /// once per dequeue.
    pub attempts: u32,
    pub max_retries: u32,
    pub priority: i64,
    pub backoff: Backoff,
    pub idempotency_key: Option<String>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Deadline of the worker's claim on this job. Only set when the
    /// owning queue was configured with a lease duration.
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    pub(crate) fn admit(opts: EnqueueOptions, now: DateTime<Utc>) -> Self {
        Self {
            id: JobId::new(),
            kind: opts.kind,
            payload: opts.payload,
            state: JobState::Pending,
            attempts: 0,
            max_retries: opts.max_retries,
            priority: opts.priority,
            backoff: opts.backoff,
            idempotency_key: opts.idempotency_key,
            last_error: None,
            created_at: now,
            processed_at: None,
            completed_at: None,
            lease_expires_at: None,
        }
    }

    /// Whether another failure would exhaust the retry budget.
    pub fn retries_remaining(&self) -> bool {
        self.attempts < self.max_retries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admit_applies_defaults() {
        let opts = EnqueueOptions::new("email", serde_json::json!({"to": "a@example.com"}));
        let job = JobRecord::admit(opts, Utc::now());
        assert_eq!(job.state, JobState::Pending);
        assert_eq!(job.attempts, 0);
        assert_eq!(job.max_retries, 3);
        assert_eq!(job.priority, 0);
        assert!(job.last_error.is_none());
        assert!(job.processed_at.is_none());
    }

    #[test]
    fn admit_preserves_negative_priority() {
        let opts = EnqueueOptions::new("email", serde_json::Value::Null).priority(-5);
        let job = JobRecord::admit(opts, Utc::now());
        assert_eq!(job.priority, -5);
    }

    #[test]
    fn terminal_states() {
        assert!(!JobState::Pending.is_terminal());
        assert!(!JobState::Processing.is_terminal());
        assert!(JobState::Completed.is_terminal());
        assert!(JobState::Failed.is_terminal());
    }

    #[test]
    fn record_round_trips_through_json() {
        let opts = EnqueueOptions::new("reports", serde_json::json!({"claim": 7}))
            .idempotency_key("claim-7-report");
        let job = JobRecord::admit(opts, Utc::now());
        let json = serde_json::to_string(&job).unwrap();
        let back: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(back.id, job.id);
        assert_eq!(back.idempotency_key.as_deref(), Some("claim-7-report"));
    }
}
