use chrono::{Duration as ChronoDuration, Utc};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::store::KeyValueStore;
use crate::{EnqueueOptions, JobId, JobRecord, JobState, QueueError, Result};

/// Queue-wide configuration. All fields have workable defaults except
/// `lease`, which stays off until the embedding system decides how long a
/// worker may hold a job (see [`Queue::requeue_expired`]).
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Prefix for every key this queue writes.
    pub key_prefix: String,
    /// Retention of completed job records.
    pub completed_ttl: Duration,
    /// Retention of terminally failed job records, longer so operators can
    /// inspect them.
    pub failed_ttl: Duration,
    /// Validity window of idempotency pointers.
    pub idempotency_ttl: Duration,
    /// When set, each dequeue stamps a lease deadline and
    /// [`Queue::requeue_expired`] treats overrunning that deadline as a
    /// failed attempt.
    pub lease: Option<Duration>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            key_prefix: "steadyq".to_string(),
            completed_ttl: Duration::from_secs(3_600),
            failed_ttl: Duration::from_secs(86_400),
            idempotency_ttl: Duration::from_secs(86_400),
            lease: None,
        }
    }
}

/// Outcome of reporting a failure, so callers can alert on permanent
/// failures distinctly from transient ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// The job was rescheduled and will be redelivered after `delay`.
    WillRetry { delay: Duration },
    /// The retry budget is exhausted; the job will not be redelivered.
    Terminal,
}

/// Per-queue counts, best effort across concurrent writers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Durable priority task queue over an injected [`KeyValueStore`].
///
/// Each named queue (`kind`) owns two sorted sets: a ready index scored by
/// raw priority, and a delayed set scored by the millisecond timestamp at
/// which a backoff-delayed retry becomes eligible. Dequeue promotes due
/// delayed members into the ready index before claiming the highest-scoring
/// ready member, so a job never sits in the ready index before its backoff
/// has elapsed.
pub struct Queue<S> {
    store: S,
    config: QueueConfig,
}

impl<S: KeyValueStore> Queue<S> {
    pub fn new(store: S) -> Self {
        Self::with_config(store, QueueConfig::default())
    }

    pub fn with_config(store: S, config: QueueConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Admit a job. Returns the id of the persisted record, or the id of
    /// the existing record when the idempotency key already has a live
    /// pointer. A store failure propagates as
    /// [`QueueError::StoreUnavailable`]; nothing is enqueued in that case.
    pub async fn enqueue(&self, opts: EnqueueOptions) -> Result<JobId> {
        if let Some(key) = opts.idempotency_key.as_deref() {
            if let Some(existing) = self.store.get(&self.pointer_key(key)).await? {
                if let Ok(id) = existing.parse() {
                    debug!(idempotency_key = key, job_id = %existing, "duplicate enqueue resolved to existing job");
                    return Ok(JobId(id));
                }
            }
        }

        let job = JobRecord::admit(opts, Utc::now());
        self.save(&job).await?;
        self.store
            .zadd(
                &self.index_key(&job.kind),
                &job.id.to_string(),
                job.priority as f64,
            )
            .await?;

        if let Some(key) = job.idempotency_key.as_deref() {
            self.store
                .setex(
                    &self.pointer_key(key),
                    self.config.idempotency_ttl,
                    &job.id.to_string(),
                )
                .await?;
        }

        debug!(job_id = %job.id, kind = %job.kind, priority = job.priority, "job enqueued");
        Ok(job.id)
    }

    /// Remove and return the highest-priority eligible job, or `None` when
    /// no job is ready (an empty queue, only delayed jobs that are not yet
    /// due, or a concurrent dequeue won the claim). Losing a claim is
    /// indistinguishable from an empty queue on purpose; the next poll
    /// resolves it.
    pub async fn dequeue(&self, kind: &str) -> Result<Option<JobRecord>> {
        self.promote_due(kind).await?;

        let index = self.index_key(kind);
        let processing = self.processing_key(kind);
        let Some((member, _)) = self.store.zpeek_max(&index).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        let lease_expires_at = self
            .config
            .lease
            .and_then(|d| ChronoDuration::from_std(d).ok())
            .map(|d| now + d);
        let deadline = lease_expires_at.map_or(f64::INFINITY, |t| t.timestamp_millis() as f64);

        // enter the processing set before removing from the index, so a
        // crash between the two writes leaves the job discoverable by the
        // lease sweep instead of in neither set
        self.store.zadd(&processing, &member, deadline).await?;

        // atomic removal is the sole cross-worker exclusivity guarantee;
        // the winner owns the processing entry, so losers must not clean
        // it up
        if !self.store.zrem(&index, &member).await? {
            return Ok(None);
        }

        let Some(mut job) = self.load(&member).await? else {
            // index referenced an expired or missing record; benign
            self.store.zrem(&processing, &member).await?;
            warn!(kind, member = %member, "queue index referenced a missing job record");
            return Ok(None);
        };

        if job.state != JobState::Pending {
            // stale index entry left behind by an interrupted promotion
            self.store.zrem(&processing, &member).await?;
            warn!(kind, member = %member, state = ?job.state, "queue index referenced a job not in pending state");
            return Ok(None);
        }

        job.state = JobState::Processing;
        job.attempts += 1;
        job.processed_at = Some(now);
        job.lease_expires_at = lease_expires_at;
        self.save(&job).await?;

        debug!(job_id = %job.id, kind, attempts = job.attempts, "job dequeued");
        Ok(Some(job))
    }

    /// Mark a processing job completed. Completing an already-completed
    /// job is a no-op.
    pub async fn complete(&self, id: &JobId) -> Result<()> {
        let Some(mut job) = self.load(&id.to_string()).await? else {
            return Err(QueueError::JobNotFound(id.clone()));
        };

        match job.state {
            JobState::Completed => return Ok(()),
            JobState::Processing => {}
            from => {
                return Err(QueueError::InvalidTransition {
                    from,
                    to: JobState::Completed,
                })
            }
        }

        job.state = JobState::Completed;
        job.completed_at = Some(Utc::now());
        job.lease_expires_at = None;
        self.save_with_ttl(&job, self.config.completed_ttl).await?;
        self.store
            .zrem(&self.processing_key(&job.kind), &id.to_string())
            .await?;
        self.store
            .incr(&self.counter_key(&job.kind, "completed"), 1)
            .await?;

        info!(job_id = %id, kind = %job.kind, "job completed");
        Ok(())
    }

    /// Report a handler failure for a processing job. Reschedules with
    /// exponential backoff while the retry budget lasts, otherwise moves
    /// the job to terminal `Failed`.
    pub async fn fail(&self, id: &JobId, error: &str) -> Result<FailOutcome> {
        let Some(mut job) = self.load(&id.to_string()).await? else {
            return Err(QueueError::JobNotFound(id.clone()));
        };

        match job.state {
            JobState::Failed => return Ok(FailOutcome::Terminal),
            JobState::Processing => {}
            from => {
                return Err(QueueError::InvalidTransition {
                    from,
                    to: JobState::Failed,
                })
            }
        }

        job.last_error = Some(error.to_string());
        job.lease_expires_at = None;
        let member = id.to_string();
        let processing = self.processing_key(&job.kind);

        if job.retries_remaining() {
            let delay = job.backoff.delay(job.attempts);
            let eligible_at = now_ms() + delay.as_millis() as f64;
            job.state = JobState::Pending;
            self.save(&job).await?;
            self.store
                .zadd(&self.delayed_key(&job.kind), &member, eligible_at)
                .await?;
            self.store.zrem(&processing, &member).await?;
            warn!(
                job_id = %id,
                kind = %job.kind,
                attempts = job.attempts,
                delay_ms = delay.as_millis() as u64,
                error,
                "job failed, retry scheduled"
            );
            Ok(FailOutcome::WillRetry { delay })
        } else {
            job.state = JobState::Failed;
            job.completed_at = Some(Utc::now());
            self.save_with_ttl(&job, self.config.failed_ttl).await?;
            self.store.zrem(&processing, &member).await?;
            self.store
                .incr(&self.counter_key(&job.kind, "failed"), 1)
                .await?;
            warn!(
                job_id = %id,
                kind = %job.kind,
                attempts = job.attempts,
                error,
                "job failed terminally, retry budget exhausted"
            );
            Ok(FailOutcome::Terminal)
        }
    }

    /// Current record for a job, or `None` once its retention TTL lapsed.
    pub async fn status(&self, id: &JobId) -> Result<Option<JobRecord>> {
        self.load(&id.to_string()).await
    }

    pub async fn stats(&self, kind: &str) -> Result<QueueStats> {
        let ready = self.store.zcard(&self.index_key(kind)).await? as u64;
        let delayed = self.store.zcard(&self.delayed_key(kind)).await? as u64;
        let pending = ready + delayed;
        let processing = self.store.zcard(&self.processing_key(kind)).await? as u64;
        let completed = self.read_counter(&self.counter_key(kind, "completed")).await?;
        let failed = self.read_counter(&self.counter_key(kind, "failed")).await?;
        Ok(QueueStats {
            pending,
            processing,
            completed,
            failed,
        })
    }

    /// Route every processing job whose lease deadline has passed through
    /// the normal failure path, counting the overrun as one attempt.
    /// Returns how many jobs were swept. Without a configured lease no
    /// deadline ever passes and this returns 0.
    pub async fn requeue_expired(&self, kind: &str) -> Result<usize> {
        let processing = self.processing_key(kind);
        let expired = self
            .store
            .zrangebyscore(&processing, f64::NEG_INFINITY, now_ms(), SWEEP_BATCH)
            .await?;

        let mut swept = 0;
        for member in expired {
            // claim the sweep so concurrent sweepers fail the job once
            if !self.store.zrem(&processing, &member).await? {
                continue;
            }
            // a stale entry can outlive the job it was added for; only a
            // record still in processing represents a lost worker
            let Some(job) = self.load(&member).await? else {
                continue;
            };
            if job.state != JobState::Processing {
                continue;
            }
            match self.fail(&job.id, "lease expired").await {
                Ok(_) => swept += 1,
                Err(QueueError::JobNotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(swept)
    }

    /// Move every delayed member whose eligibility time has passed into the
    /// ready index, scored by its stored priority.
    async fn promote_due(&self, kind: &str) -> Result<()> {
        let delayed = self.delayed_key(kind);
        let due = self
            .store
            .zrangebyscore(&delayed, f64::NEG_INFINITY, now_ms(), SWEEP_BATCH)
            .await?;

        for member in due {
            // re-add before removal so a crash between the two writes
            // cannot lose the job
            match self.load(&member).await? {
                Some(job) if job.state == JobState::Pending => {
                    self.store
                        .zadd(&self.index_key(kind), &member, job.priority as f64)
                        .await?;
                }
                _ => {} // record expired or moved on; drop the entry
            }
            self.store.zrem(&delayed, &member).await?;
        }
        Ok(())
    }

    async fn load(&self, id: &str) -> Result<Option<JobRecord>> {
        match self.store.get(&self.job_key(id)).await? {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn save(&self, job: &JobRecord) -> Result<()> {
        let json = serde_json::to_string(job)?;
        self.store.set(&self.job_key(&job.id.to_string()), &json).await
    }

    async fn save_with_ttl(&self, job: &JobRecord, ttl: Duration) -> Result<()> {
        let json = serde_json::to_string(job)?;
        self.store
            .setex(&self.job_key(&job.id.to_string()), ttl, &json)
            .await
    }

    async fn read_counter(&self, key: &str) -> Result<u64> {
        Ok(self
            .store
            .get(key)
            .await?
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0))
    }

    fn job_key(&self, id: &str) -> String {
        format!("{}:job:{}", self.config.key_prefix, id)
    }

    fn index_key(&self, kind: &str) -> String {
        format!("{}:queue:{}:index", self.config.key_prefix, kind)
    }

    fn processing_key(&self, kind: &str) -> String {
        format!("{}:queue:{}:processing", self.config.key_prefix, kind)
    }

    fn delayed_key(&self, kind: &str) -> String {
        format!("{}:queue:{}:delayed", self.config.key_prefix, kind)
    }

    fn pointer_key(&self, idempotency_key: &str) -> String {
        format!("{}:idempotency:{}", self.config.key_prefix, idempotency_key)
    }

    fn counter_key(&self, kind: &str, which: &str) -> String {
        format!("{}:queue:{}:count:{}", self.config.key_prefix, kind, which)
    }
}

const SWEEP_BATCH: usize = 100;

fn now_ms() -> f64 {
    Utc::now().timestamp_millis() as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn key_shapes() {
        let queue = Queue::new(MemoryStore::new());
        assert_eq!(queue.job_key("abc"), "steadyq:job:abc");
        assert_eq!(queue.index_key("email"), "steadyq:queue:email:index");
        assert_eq!(
            queue.processing_key("email"),
            "steadyq:queue:email:processing"
        );
        assert_eq!(queue.delayed_key("email"), "steadyq:queue:email:delayed");
        assert_eq!(queue.pointer_key("tok"), "steadyq:idempotency:tok");
        assert_eq!(
            queue.counter_key("email", "failed"),
            "steadyq:queue:email:count:failed"
        );
    }

    #[tokio::test]
    async fn complete_requires_processing_state() {
        let queue = Queue::new(MemoryStore::new());
        let id = queue
            .enqueue(EnqueueOptions::new("t", serde_json::Value::Null))
            .await
            .unwrap();
        let err = queue.complete(&id).await.unwrap_err();
        assert!(matches!(
            err,
            QueueError::InvalidTransition {
                from: JobState::Pending,
                to: JobState::Completed
            }
        ));
    }

    #[tokio::test]
    async fn complete_unknown_job_is_not_found() {
        let queue = Queue::<MemoryStore>::new(MemoryStore::new());
        let err = queue.complete(&JobId::new()).await.unwrap_err();
        assert!(matches!(err, QueueError::JobNotFound(_)));
    }
}
