//! steadyq: a durable priority task queue backed by a key-value store
//!
//! Provides idempotent enqueue, priority-ordered dequeue, exponential-backoff
//! retries with a bounded budget, and a polling worker loop. Redis is the
//! production store; an in-memory store backs tests and single-process use.

pub mod backoff;
pub mod error;
pub mod job;
pub mod queue;
pub mod store;
pub mod worker;

pub use backoff::Backoff;
pub use error::{QueueError, Result};
pub use job::{EnqueueOptions, JobId, JobRecord, JobState};
pub use queue::{FailOutcome, Queue, QueueConfig, QueueStats};
pub use store::{KeyValueStore, MemoryStore, RedisStore};
pub use worker::{Handler, StopHandle, Worker, WorkerBuilder, WorkerConfig};

// Re-export commonly used types
pub use async_trait::async_trait;
pub use serde::{Deserialize, Serialize};
