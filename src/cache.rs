//! Local cache in front of the content-identity → target lookup.
//!
//! Positive results live for a week, known misses for a day. The lookup
//! itself is the embedder's concern; [`resolve_with_timeout`] wires a lookup
//! future to a cache and bounds how long a miss may hold up annotation work.

use crate::state::{ContentId, ResolvedTarget};
use anyhow::{Context, Result};
use core::future::Future;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const DEFAULT_POSITIVE_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);
pub const DEFAULT_NEGATIVE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheLookup {
    /// The identity resolved to a target.
    Hit(ResolvedTarget),
    /// The identity is known not to resolve.
    Negative,
    Miss,
}

pub trait TargetCache: Send + Sync {
    fn get(&self, id: &ContentId) -> CacheLookup;

    /// Records a lookup result; `None` records a known miss.
    fn put(&self, target: Option<ResolvedTarget>, id: &ContentId);

    fn clear_all(&self);
}

/// Wall-clock source in milliseconds since the Unix epoch.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct PersistedEntry {
    id: ContentId,
    #[serde(default)]
    target: Option<ResolvedTarget>,
    expires_at_ms: u64,
}

#[derive(Debug, Clone)]
struct CacheEntry {
    target: Option<ResolvedTarget>,
    expires_at_ms: u64,
}

/// In-memory [`TargetCache`] with per-entry expiry and JSON persistence.
pub struct MemoryTargetCache {
    entries: Mutex<HashMap<ContentId, CacheEntry>>,
    clock: Arc<dyn Clock>,
    positive_ttl: Duration,
    negative_ttl: Duration,
}

impl MemoryTargetCache {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            clock,
            positive_ttl: DEFAULT_POSITIVE_TTL,
            negative_ttl: DEFAULT_NEGATIVE_TTL,
        }
    }

    pub fn with_ttls(mut self, positive: Duration, negative: Duration) -> Self {
        self.positive_ttl = positive;
        self.negative_ttl = negative;
        self
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<ContentId, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Drops every expired entry; returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now_millis();
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.expires_at_ms > now);
        before - entries.len()
    }

    /// Serializes every live entry, for storage in host-side persistence.
    pub fn export_json(&self) -> Result<String> {
        let now = self.clock.now_millis();
        let mut persisted: Vec<PersistedEntry> = self
            .entries()
            .iter()
            .filter(|(_, entry)| entry.expires_at_ms > now)
            .map(|(id, entry)| PersistedEntry {
                id: id.clone(),
                target: entry.target.clone(),
                expires_at_ms: entry.expires_at_ms,
            })
            .collect();
        persisted.sort_by(|left, right| left.id.cmp(&right.id));
        serde_json::to_string(&persisted).context("failed to serialize target cache")
    }

    /// Loads entries produced by [`export_json`](Self::export_json), skipping
    /// those already expired. Returns how many were loaded.
    pub fn import_json(&self, json: &str) -> Result<usize> {
        let persisted: Vec<PersistedEntry> =
            serde_json::from_str(json).context("failed to parse persisted target cache")?;
        let now = self.clock.now_millis();

        let mut entries = self.entries();
        let mut loaded = 0;
        for entry in persisted.into_iter().filter(|entry| entry.expires_at_ms > now) {
            entries.insert(
                entry.id,
                CacheEntry {
                    target: entry.target,
                    expires_at_ms: entry.expires_at_ms,
                },
            );
            loaded += 1;
        }
        Ok(loaded)
    }
}

impl Default for MemoryTargetCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetCache for MemoryTargetCache {
    fn get(&self, id: &ContentId) -> CacheLookup {
        let now = self.clock.now_millis();
        let mut entries = self.entries();
        let Some(entry) = entries.get(id) else {
            return CacheLookup::Miss;
        };
        if entry.expires_at_ms > now {
            return match &entry.target {
                Some(target) => CacheLookup::Hit(target.clone()),
                None => CacheLookup::Negative,
            };
        }
        entries.remove(id);
        CacheLookup::Miss
    }

    fn put(&self, target: Option<ResolvedTarget>, id: &ContentId) {
        let ttl = if target.is_some() {
            self.positive_ttl
        } else {
            self.negative_ttl
        };
        let expires_at_ms = self
            .clock
            .now_millis()
            .saturating_add(ttl.as_millis() as u64);
        self.entries().insert(
            id.clone(),
            CacheEntry {
                target,
                expires_at_ms,
            },
        );
    }

    fn clear_all(&self) {
        self.entries().clear();
    }
}

/// Resolves `id` through `cache`, falling back to `lookup` on a miss.
///
/// A lookup that fails or exceeds `timeout` yields `None` and is not cached,
/// so the next attempt tries again.
pub async fn resolve_with_timeout<F, Fut>(
    cache: &dyn TargetCache,
    id: &ContentId,
    timeout: Duration,
    lookup: F,
) -> Option<ResolvedTarget>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<Option<ResolvedTarget>>>,
{
    match cache.get(id) {
        CacheLookup::Hit(target) => return Some(target),
        CacheLookup::Negative => return None,
        CacheLookup::Miss => {}
    }

    match tokio::time::timeout(timeout, lookup()).await {
        Ok(Ok(target)) => {
            cache.put(target.clone(), id);
            target
        }
        Ok(Err(err)) => {
            tracing::warn!(content = %id, error = %err, "target lookup failed");
            None
        }
        Err(_) => {
            tracing::debug!(
                content = %id,
                timeout_ms = timeout.as_millis() as u64,
                "target lookup timed out"
            );
            None
        }
    }
}
