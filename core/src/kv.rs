//! The Redis-like key/value cache assumed given by §6: a shared,
//! TTL-aware store used for two things in this codebase — the
//! deep-research result cache (`"deep-research:<userId>:<conversationId>"`,
//! 24h TTL) and the deep-research enqueue throttle (`SET NX EX 60`). Both
//! callers only ever need get/set/set-if-absent-with-ttl, so the trait
//! stays small rather than modeling the rest of Redis.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[async_trait]
pub trait KeyValueCache: Send + Sync {
    async fn get(&self, key: &str) -> Option<String>;

    async fn set_ex(&self, key: &str, value: String, ttl: Duration);

    /// `SET key value NX EX ttl`: returns `true` if the key was absent and
    /// the write happened, `false` if an unexpired value was already
    /// there. The sole cross-job mutex in the system (the deep-research
    /// throttle) is built on this one primitive.
    async fn set_nx_ex(&self, key: &str, value: String, ttl: Duration) -> bool;

    async fn delete(&self, key: &str);
}

struct Entry {
    value: String,
    expires_at: Instant,
}

/// In-process stand-in for Redis. Expired entries are lazily dropped on
/// access rather than swept, matching "stale entries are silently
/// ignored" in §5's shared-resource policy.
#[derive(Default)]
pub struct InMemoryKeyValueCache {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKeyValueCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry, now: Instant) -> bool {
        entry.expires_at > now
    }
}

#[async_trait]
impl KeyValueCache for InMemoryKeyValueCache {
    async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        match entries.get(key) {
            Some(entry) if Self::is_live(entry, now) => Some(entry.value.clone()),
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(key.to_string(), Entry { value, expires_at: Instant::now() + ttl });
    }

    async fn set_nx_ex(&self, key: &str, value: String, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().unwrap();
        if let Some(existing) = entries.get(key) {
            if Self::is_live(existing, now) {
                return false;
            }
        }
        entries.insert(key.to_string(), Entry { value, expires_at: now + ttl });
        true
    }

    async fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_nx_ex_refuses_a_second_writer_within_ttl() {
        let cache = InMemoryKeyValueCache::new();
        assert!(cache.set_nx_ex("k", "a".to_string(), Duration::from_secs(60)).await);
        assert!(!cache.set_nx_ex("k", "b".to_string(), Duration::from_secs(60)).await);
        assert_eq!(cache.get("k").await, Some("a".to_string()));
    }

    #[tokio::test]
    async fn set_nx_ex_succeeds_again_after_expiry() {
        let cache = InMemoryKeyValueCache::new();
        assert!(cache.set_nx_ex("k", "a".to_string(), Duration::from_millis(10)).await);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.set_nx_ex("k", "b".to_string(), Duration::from_secs(60)).await);
        assert_eq!(cache.get("k").await, Some("b".to_string()));
    }

    #[tokio::test]
    async fn expired_get_returns_none() {
        let cache = InMemoryKeyValueCache::new();
        cache.set_ex("k", "a".to_string(), Duration::from_millis(10)).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cache.get("k").await, None);
    }
}
