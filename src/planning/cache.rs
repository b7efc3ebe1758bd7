use crate::plan::ExecutionPlan;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

struct CachedPlan {
    plan: Arc<ExecutionPlan>,
    inserted_at: Instant,
}

/// In-memory plan cache with a fixed time to live.
///
/// Entries are shared as `Arc`s so a hit hands out the very same plan.
pub struct PlanCache {
    entries: DashMap<String, CachedPlan>,
    ttl: Duration,
}

impl PlanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// SHA-256 of the description and the sorted, deduplicated tool names
    pub fn key(description: &str, tools: &[String]) -> String {
        let mut tools: Vec<&str> = tools.iter().map(String::as_str).collect();
        tools.sort_unstable();
        tools.dedup();

        let mut hasher = Sha256::new();
        hasher.update(description.trim().as_bytes());
        hasher.update([0u8]);
        hasher.update(tools.join(",").as_bytes());
        hasher
            .finalize()
            .iter()
            .map(|byte| format!("{:02x}", byte))
            .collect()
    }

    /// Live entry for `key`; an expired entry is evicted on the way
    pub fn get(&self, key: &str) -> Option<Arc<ExecutionPlan>> {
        {
            let entry = self.entries.get(key)?;
            if entry.inserted_at.elapsed() < self.ttl {
                return Some(entry.plan.clone());
            }
        }
        // the shard guard must be gone before removing
        if self
            .entries
            .remove_if(key, |_, entry| entry.inserted_at.elapsed() >= self.ttl)
            .is_some()
        {
            debug!(key, "Evicted expired plan");
        }
        None
    }

    pub fn insert(&self, key: String, plan: Arc<ExecutionPlan>) {
        self.entries.insert(
            key,
            CachedPlan {
                plan,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Drop every expired entry; returns how many were dropped
    pub fn purge_expired(&self) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| entry.inserted_at.elapsed() < self.ttl);
        before - self.entries.len()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
