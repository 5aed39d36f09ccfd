//! Response cache for inference results.
//!
//! Guarantees at most one inference call per unique
//! (business interest, article text, operation) triple while an entry is
//! retained. Entries are keyed by a SHA-256 [`Fingerprint`] over all three
//! inputs, so a filter verdict and a summary for the same article never share
//! an entry.
//!
//! The cache is an explicit object injected into the filter and summarizer.
//! It is bounded by entry count (least-recently-used eviction) and by a
//! time-to-live measured from when the result was first produced, and is safe to share between concurrently running batches:
//! the underlying `moka` map uses fine-grained locking, so cache traffic never
//! serializes inference dispatch.
//!
//! # Integrity
//!
//! Every entry remembers the fingerprint it was computed for. An entry whose
//! stored fingerprint does not match the key it was found under, or whose
//! result is empty, is treated as corrupt: it is dropped and the caller sees a
//! miss. Snapshots written to disk carry a checksum per entry and are
//! re-validated on load.

use crate::error::Result;
use crate::models::{BusinessInterest, Operation};
use chrono::{DateTime, Utc};
use moka::Expiry;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{info, instrument, warn};

/// Hex-encoded SHA-256 over every input that determines an inference result.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Fingerprint an (operation, interest, article text) triple.
    ///
    /// Each field is length-prefixed so that moving bytes between fields can
    /// never produce the same digest.
    pub fn compute(operation: Operation, interest: &BusinessInterest, body_text: &str) -> Self {
        let mut hasher = Sha256::new();
        for part in [operation.as_str(), interest.as_str(), body_text] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part.as_bytes());
        }
        Self(format!("{:x}", hasher.finalize()))
    }

    /// Accept a fingerprint read from outside the process, if well formed.
    pub fn parse(s: &str) -> Option<Self> {
        let well_formed =
            s.len() == 64 && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        well_formed.then(|| Self(s.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A memoized inference result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub fingerprint: Fingerprint,
    pub result: String,
    pub created_at: DateTime<Utc>,
}

/// Counters describing cache behaviour over the process lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub corruptions: u64,
    pub entries: u64,
}

/// Outcome of loading a snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotLoad {
    pub loaded: usize,
    pub discarded: usize,
    pub expired: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotEntry {
    fingerprint: String,
    result: String,
    created_at: DateTime<Utc>,
    checksum: String,
}

fn entry_checksum(fingerprint: &str, result: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(fingerprint.as_bytes());
    hasher.update([0u8]);
    hasher.update(result.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Longest accepted time-to-live. `moka` refuses durations near 1000 years.
pub const MAX_TTL: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// Expires an entry `ttl` after its `created_at`, so entries restored from a
/// snapshot keep their original age.
struct RemainingTtl {
    ttl: Duration,
}

impl RemainingTtl {
    fn remaining(&self, entry: &CacheEntry) -> Duration {
        let age = (Utc::now() - entry.created_at).to_std().unwrap_or_default();
        self.ttl.saturating_sub(age)
    }
}

impl Expiry<Fingerprint, Arc<CacheEntry>> for RemainingTtl {
    fn expire_after_create(
        &self,
        _key: &Fingerprint,
        entry: &Arc<CacheEntry>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(self.remaining(entry))
    }

    fn expire_after_update(
        &self,
        _key: &Fingerprint,
        entry: &Arc<CacheEntry>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(self.remaining(entry))
    }
}

/// Thread-safe, bounded memo of inference results.
pub struct ResponseCache {
    entries: Cache<Fingerprint, Arc<CacheEntry>>,
    ttl: Duration,
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    corruptions: AtomicU64,
}

impl ResponseCache {
    /// `ttl` is capped at [`MAX_TTL`].
    pub fn new(max_entries: u64, ttl: Duration) -> Self {
        let ttl = ttl.min(MAX_TTL);
        let entries = Cache::builder()
            .max_capacity(max_entries)
            .expire_after(RemainingTtl { ttl })
            .eviction_policy(EvictionPolicy::lru())
            .build();
        Self {
            entries,
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            inserts: AtomicU64::new(0),
            corruptions: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &crate::config::CacheConfig) -> Self {
        Self::new(config.max_entries, config.ttl())
    }

    /// Look up a result. Corrupt entries are evicted and reported as a miss.
    pub fn get(&self, fingerprint: &Fingerprint) -> Option<String> {
        let Some(entry) = self.entries.get(fingerprint) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };

        if entry.fingerprint != *fingerprint || entry.result.trim().is_empty() {
            warn!(
                key = %fingerprint,
                stored = %entry.fingerprint,
                "Discarding corrupt cache entry"
            );
            self.entries.invalidate(fingerprint);
            self.corruptions.fetch_add(1, Ordering::Relaxed);
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        self.hits.fetch_add(1, Ordering::Relaxed);
        Some(entry.result.clone())
    }

    /// Store a result. Empty results are never cached.
    pub fn put(&self, fingerprint: Fingerprint, result: impl Into<String>) {
        let result = result.into();
        if result.trim().is_empty() {
            return;
        }
        let entry = CacheEntry {
            fingerprint: fingerprint.clone(),
            result,
            created_at: Utc::now(),
        };
        self.entries.insert(fingerprint, Arc::new(entry));
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of live entries, after applying pending evictions.
    pub fn len(&self) -> u64 {
        self.entries.run_pending_tasks();
        self.entries.entry_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.entries.run_pending_tasks();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            inserts: self.inserts.load(Ordering::Relaxed),
            corruptions: self.corruptions.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Write all live entries to `path` as JSON.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn save_snapshot(&self, path: impl AsRef<Path>) -> Result<usize> {
        let snapshot: Vec<SnapshotEntry> = self
            .entries
            .iter()
            .map(|(_, entry)| SnapshotEntry {
                checksum: entry_checksum(entry.fingerprint.as_str(), &entry.result),
                fingerprint: entry.fingerprint.0.clone(),
                result: entry.result.clone(),
                created_at: entry.created_at,
            })
            .collect();

        let json = serde_json::to_vec(&snapshot)?;
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        tokio::fs::write(path.as_ref(), json).await?;
        info!(count = snapshot.len(), "Saved cache snapshot");
        Ok(snapshot.len())
    }

    /// Load entries from a snapshot written by [`save_snapshot`](Self::save_snapshot).
    ///
    /// Entries with a malformed fingerprint or a checksum mismatch are
    /// discarded; entries older than the cache TTL are skipped. The rest expire
    /// once the TTL has passed since their original `created_at`.
    #[instrument(level = "info", skip_all, fields(path = %path.as_ref().display()))]
    pub async fn load_snapshot(&self, path: impl AsRef<Path>) -> Result<SnapshotLoad> {
        let bytes = tokio::fs::read(path.as_ref()).await?;
        let snapshot: Vec<SnapshotEntry> = serde_json::from_slice(&bytes)?;
        let now = Utc::now();
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::MAX);

        let mut report = SnapshotLoad::default();
        for item in snapshot {
            let valid = Fingerprint::parse(&item.fingerprint)
                .filter(|_| entry_checksum(&item.fingerprint, &item.result) == item.checksum)
                .filter(|_| !item.result.trim().is_empty());
            let Some(fingerprint) = valid else {
                warn!(fingerprint = %item.fingerprint, "Discarding corrupt snapshot entry");
                self.corruptions.fetch_add(1, Ordering::Relaxed);
                report.discarded += 1;
                continue;
            };
            if now.signed_duration_since(item.created_at) > ttl {
                report.expired += 1;
                continue;
            }
            let entry = CacheEntry {
                fingerprint: fingerprint.clone(),
                result: item.result,
                created_at: item.created_at,
            };
            self.entries.insert(fingerprint, Arc::new(entry));
            report.loaded += 1;
        }

        info!(
            loaded = report.loaded,
            discarded = report.discarded,
            expired = report.expired,
            "Loaded cache snapshot"
        );
        Ok(report)
    }

    #[cfg(test)]
    pub(crate) fn insert_raw(&self, key: Fingerprint, entry: CacheEntry) {
        self.entries.insert(key, Arc::new(entry));
    }
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache")
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}
