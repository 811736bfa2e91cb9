// src/store/mod.rs
//!
//! Keyed state stores behind trait seams.
//!
//! The correlation store carries the ephemeral window and sequence state the
//! stateful detector needs: sorted sets with score-range queries, per-key
//! TTL, and a small step hash per key. The in-memory implementation is
//! linearizable per key (one mutex, no await while held) and sweeps expired
//! keys lazily on access, which is all the correlator contract requires.

pub mod incidents;

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::Result;

#[async_trait]
pub trait CorrelationStore: Send + Sync {
    /// Insert a scored member and reset the key TTL.
    async fn window_add(&self, key: &str, score: i64, member: String, ttl: Duration)
        -> Result<()>;

    /// Evict members with score strictly below `min_score`.
    async fn window_remove_below(&self, key: &str, min_score: i64) -> Result<()>;

    /// Members with `min_score <= score <= max_score`, ascending by score.
    async fn window_range(&self, key: &str, min_score: i64, max_score: i64)
        -> Result<Vec<String>>;

    /// Record a sequence step (last writer wins) and reset the key TTL.
    async fn step_set(&self, key: &str, step: usize, event_id: &str, ttl: Duration)
        -> Result<()>;

    async fn step_all(&self, key: &str) -> Result<HashMap<usize, String>>;

    async fn delete(&self, key: &str) -> Result<()>;
}

enum Slot {
    Window(BTreeSet<(i64, String)>),
    Steps(HashMap<usize, String>),
}

struct Entry {
    slot: Slot,
    expires_at: Instant,
}

#[derive(Default)]
pub struct MemoryCorrelationStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCorrelationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes the entry if its TTL has lapsed, then hands the live entry to
    /// the caller. Expiry is judged at access time only.
    fn with_live_entry<R>(
        &self,
        key: &str,
        f: impl FnOnce(Option<&mut Entry>) -> R,
    ) -> R {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = entries
            .get(key)
            .map(|e| e.expires_at <= Instant::now())
            .unwrap_or(false);
        if expired {
            entries.remove(key);
        }
        f(entries.get_mut(key))
    }
}

#[async_trait]
impl CorrelationStore for MemoryCorrelationStore {
    async fn window_add(
        &self,
        key: &str,
        score: i64,
        member: String,
        ttl: Duration,
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = entries
            .get(key)
            .map(|e| e.expires_at <= Instant::now())
            .unwrap_or(false);
        if expired {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Window(BTreeSet::new()),
            expires_at: Instant::now() + ttl,
        });
        entry.expires_at = Instant::now() + ttl;
        if let Slot::Window(set) = &mut entry.slot {
            set.insert((score, member));
        }
        Ok(())
    }

    async fn window_remove_below(&self, key: &str, min_score: i64) -> Result<()> {
        self.with_live_entry(key, |entry| {
            if let Some(Entry { slot: Slot::Window(set), .. }) = entry {
                set.retain(|(score, _)| *score >= min_score);
            }
        });
        Ok(())
    }

    async fn window_range(
        &self,
        key: &str,
        min_score: i64,
        max_score: i64,
    ) -> Result<Vec<String>> {
        Ok(self.with_live_entry(key, |entry| {
            match entry {
                Some(Entry { slot: Slot::Window(set), .. }) => set
                    .iter()
                    .filter(|(score, _)| *score >= min_score && *score <= max_score)
                    .map(|(_, member)| member.clone())
                    .collect(),
                _ => Vec::new(),
            }
        }))
    }

    async fn step_set(
        &self,
        key: &str,
        step: usize,
        event_id: &str,
        ttl: Duration,
    ) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let expired = entries
            .get(key)
            .map(|e| e.expires_at <= Instant::now())
            .unwrap_or(false);
        if expired {
            entries.remove(key);
        }
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            slot: Slot::Steps(HashMap::new()),
            expires_at: Instant::now() + ttl,
        });
        entry.expires_at = Instant::now() + ttl;
        if let Slot::Steps(steps) = &mut entry.slot {
            steps.insert(step, event_id.to_string());
        }
        Ok(())
    }

    async fn step_all(&self, key: &str) -> Result<HashMap<usize, String>> {
        Ok(self.with_live_entry(key, |entry| match entry {
            Some(Entry { slot: Slot::Steps(steps), .. }) => steps.clone(),
            _ => HashMap::new(),
        }))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.remove(key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn window_range_bounds_are_inclusive() {
        let store = MemoryCorrelationStore::new();
        let ttl = Duration::from_secs(60);
        store.window_add("k", 100, "a".to_string(), ttl).await.unwrap();
        store.window_add("k", 160, "b".to_string(), ttl).await.unwrap();
        store.window_add("k", 99, "old".to_string(), ttl).await.unwrap();

        let members = store.window_range("k", 100, 160).await.unwrap();
        assert_eq!(members, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn remove_below_keeps_the_boundary() {
        let store = MemoryCorrelationStore::new();
        let ttl = Duration::from_secs(60);
        store.window_add("k", 50, "old".to_string(), ttl).await.unwrap();
        store.window_add("k", 60, "edge".to_string(), ttl).await.unwrap();
        store.window_remove_below("k", 60).await.unwrap();

        let members = store.window_range("k", 0, 1000).await.unwrap();
        assert_eq!(members, vec!["edge".to_string()]);
    }

    #[tokio::test]
    async fn keys_expire_after_ttl() {
        let store = MemoryCorrelationStore::new();
        store
            .window_add("k", 1, "x".to_string(), Duration::from_millis(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(store.window_range("k", 0, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn steps_overwrite_and_clear() {
        let store = MemoryCorrelationStore::new();
        let ttl = Duration::from_secs(60);
        store.step_set("s", 0, "e1", ttl).await.unwrap();
        store.step_set("s", 0, "e2", ttl).await.unwrap();
        store.step_set("s", 1, "e3", ttl).await.unwrap();

        let steps = store.step_all("s").await.unwrap();
        assert_eq!(steps.get(&0), Some(&"e2".to_string()));
        assert_eq!(steps.len(), 2);

        store.delete("s").await.unwrap();
        assert!(store.step_all("s").await.unwrap().is_empty());
    }
}
