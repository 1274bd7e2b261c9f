//! Storage abstraction for the queue.
//!
//! The queue core only ever talks to a [`KeyValueStore`]: plain keys hold
//! serialized job records, idempotency pointers, and stat counters; sorted
//! sets hold the per-queue priority index and the processing set. Production
//! uses [`RedisStore`]; tests and single-process embeddings use
//! [`MemoryStore`].

use async_trait::async_trait;
use std::time::Duration;

use crate::Result;

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

/// Minimal key-value + sorted-set surface the queue relies on.
///
/// All operations are individually atomic with respect to other callers of
/// the same store; no cross-operation transactions are assumed. `zrem`
/// reporting whether this caller removed the member is the primitive the
/// dequeue claim protocol is built on.
#[async_trait]
pub trait KeyValueStore: Send + Sync + 'static {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Set with a time-to-live.
    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()>;

    /// Attach a time-to-live to an existing key.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Increment a counter key, creating it at zero if absent.
    async fn incr(&self, key: &str, delta: i64) -> Result<i64>;

    /// Add or update a sorted-set member.
    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()>;

    /// Remove a sorted-set member. Returns whether the member existed, and
    /// therefore whether this caller was the one that removed it.
    async fn zrem(&self, key: &str, member: &str) -> Result<bool>;

    /// Highest-scoring member with its score, without removing it.
    async fn zpeek_max(&self, key: &str) -> Result<Option<(String, f64)>>;

    /// Members with `min <= score <= max`, lowest first, at most `limit`.
    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>>;

    async fn zcard(&self, key: &str) -> Result<usize>;
}
