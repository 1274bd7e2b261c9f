use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::KeyValueStore;
use crate::Result;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

#[derive(Default)]
struct Inner {
    kv: HashMap<String, Entry>,
    zsets: HashMap<String, HashMap<String, f64>>,
}

impl Inner {
    fn live(&mut self, key: &str) -> Option<&Entry> {
        let expired = self
            .kv
            .get(key)
            .is_some_and(|e| e.expires_at.is_some_and(|t| t <= Instant::now()));
        if expired {
            self.kv.remove(key);
            return None;
        }
        self.kv.get(key)
    }
}

/// In-memory store with the same semantics as [`RedisStore`], including
/// lazy key expiry. Intended for tests and single-process embeddings.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner.live(key).map(|e| e.value.clone()))
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: None,
            },
        );
        Ok(())
    }

    async fn setex(&self, key: &str, ttl: Duration, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.kv.get_mut(key) {
            entry.expires_at = Some(Instant::now() + ttl);
        }
        Ok(())
    }

    async fn incr(&self, key: &str, delta: i64) -> Result<i64> {
        let mut inner = self.inner.lock().unwrap();
        let current = inner
            .live(key)
            .and_then(|e| e.value.parse::<i64>().ok())
            .unwrap_or(0);
        let next = current + delta;
        inner.kv.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at: None,
            },
        );
        Ok(next)
    }

    async fn zadd(&self, key: &str, member: &str, score: f64) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .zsets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn zrem(&self, key: &str, member: &str) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        Ok(inner
            .zsets
            .get_mut(key)
            .is_some_and(|zset| zset.remove(member).is_some()))
    }

    async fn zpeek_max(&self, key: &str) -> Result<Option<(String, f64)>> {
        let inner = self.inner.lock().unwrap();
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(None);
        };
        Ok(zset
            .iter()
            .max_by(|(am, a), (bm, b)| a.total_cmp(b).then_with(|| am.cmp(bm)))
            .map(|(member, score)| (member.clone(), *score)))
    }

    async fn zrangebyscore(
        &self,
        key: &str,
        min: f64,
        max: f64,
        limit: usize,
    ) -> Result<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let Some(zset) = inner.zsets.get(key) else {
            return Ok(Vec::new());
        };
        let mut due: Vec<(&String, f64)> = zset
            .iter()
            .filter(|(_, s)| **s >= min && **s <= max)
            .map(|(m, s)| (m, *s))
            .collect();
        due.sort_by(|(am, a), (bm, b)| a.total_cmp(b).then_with(|| am.cmp(bm)));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|(m, _)| m.clone())
            .collect())
    }

    async fn zcard(&self, key: &str) -> Result<usize> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.zsets.get(key).map_or(0, |zset| zset.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn setex_expires_lazily() {
        let store = MemoryStore::new();
        store
            .setex("k", Duration::from_millis(10), "v")
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn expire_attaches_ttl_to_existing_key() {
        let store = MemoryStore::new();
        store.set("k", "v").await.unwrap();
        store.expire("k", Duration::from_millis(10)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
        // expiring a missing key is a no-op
        store.expire("gone", Duration::from_millis(10)).await.unwrap();
    }

    #[tokio::test]
    async fn zpeek_max_returns_highest_score() {
        let store = MemoryStore::new();
        store.zadd("z", "low", 1.0).await.unwrap();
        store.zadd("z", "high", 10.0).await.unwrap();
        store.zadd("z", "mid", 5.0).await.unwrap();
        let (member, score) = store.zpeek_max("z").await.unwrap().unwrap();
        assert_eq!(member, "high");
        assert_eq!(score, 10.0);
    }

    #[tokio::test]
    async fn zrem_reports_whether_member_existed() {
        let store = MemoryStore::new();
        store.zadd("z", "a", 1.0).await.unwrap();
        assert!(store.zrem("z", "a").await.unwrap());
        assert!(!store.zrem("z", "a").await.unwrap());
        assert_eq!(store.zcard("z").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn zrangebyscore_filters_and_limits() {
        let store = MemoryStore::new();
        for (m, s) in [("a", 1.0), ("b", 2.0), ("c", 3.0), ("d", 4.0)] {
            store.zadd("z", m, s).await.unwrap();
        }
        let due = store
            .zrangebyscore("z", f64::NEG_INFINITY, 3.0, 2)
            .await
            .unwrap();
        assert_eq!(due, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn incr_creates_and_accumulates() {
        let store = MemoryStore::new();
        assert_eq!(store.incr("n", 1).await.unwrap(), 1);
        assert_eq!(store.incr("n", 2).await.unwrap(), 3);
    }
}
