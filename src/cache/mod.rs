//! Low-latency key/value mirror with per-entry TTL.
//!
//! Holds upload-session snapshots and transfer cancellation flags. Nothing
//! stored here is authoritative: every reader has a fallback to the
//! database. Expiry is checked on read, so an entry that is never touched
//! again is only reclaimed by [`FastCache::purge_expired`].

use anyhow::{Context, Result};
use dashmap::DashMap;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::time::{Duration, Instant};

struct CacheEntry {
    value: String,
    expires_at: Option<Instant>,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

#[derive(Default)]
pub struct FastCache {
    entries: DashMap<String, CacheEntry>,
}

impl FastCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value without expiry
    pub fn set(&self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value: value.into(),
                expires_at: None,
            },
        );
    }

    /// Store a value that disappears after `ttl`
    pub fn set_ex(&self, key: impl Into<String>, value: impl Into<String>, ttl: Duration) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                value: value.into(),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        match self.entries.get(key) {
            None => return None,
            Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
            Some(_) => {}
        }
        self.entries.remove_if(key, |_, entry| entry.is_expired(now));
        None
    }

    pub fn exists(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Remaining lifetime of a key. `None` for missing, expired or
    /// non-expiring entries.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entry = self.entries.get(key)?;
        entry
            .expires_at
            .and_then(|at| at.checked_duration_since(now))
            .filter(|d| !d.is_zero())
    }

    /// Returns true if a live entry was removed
    pub fn del(&self, key: &str) -> bool {
        let now = Instant::now();
        self.entries
            .remove(key)
            .is_some_and(|(_, entry)| !entry.is_expired(now))
    }

    pub fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let raw = self.get(key)?;
        match serde_json::from_str(&raw) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(target: "cache", key = %key, error = %e, "Discarding undecodable cache entry");
                self.entries.remove(key);
                None
            }
        }
    }

    pub fn set_json_ex<T: Serialize>(&self, key: impl Into<String>, value: &T, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value).context("Failed to serialize cache entry")?;
        self.set_ex(key, raw, ttl);
        Ok(())
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            tracing::debug!(target: "cache", removed, "Purged expired cache entries");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
