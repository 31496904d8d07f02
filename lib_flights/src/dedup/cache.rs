//! # Dedup Cache
//!
//! A process-wide, injectable set of `(session key, identity)` pairs with a
//! sliding expiry window.
//!
//! ## Key Design Principles:
//! - **Check-and-mark**: `exists` both answers the question and records the
//!   sighting. The two steps happen under one lock, so two ticks of the same
//!   session can never both see a flight as new.
//! - **Lazy compaction**: expired entries are dropped only when that session's
//!   list is scanned again. Nothing sweeps in the background, and nothing is
//!   removed when a session ends; stale lists linger until their key is used again.
//! - **Refresh on re-sighting**: a live entry seen again gets its timestamp
//!   bumped instead of being duplicated, so a flight that stays in range is
//!   suppressed for as long as it keeps being seen.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

/// One remembered sighting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    /// The flight identity (ICAO24 code).
    pub identity: String,
    /// When the identity was last seen by this session.
    pub last_seen: Instant,
}

impl DedupEntry {
    fn is_live(&self, now: Instant, window: Duration) -> bool {
        match self.last_seen.checked_add(window) {
            Some(expiry) => now < expiry,
            // A window too large to represent never expires.
            None => true,
        }
    }
}

/// # Dedup Cache
///
/// Shared across sessions behind an `Arc`. Access is serialized by a single
/// mutex; the critical section never awaits.
#[derive(Debug, Default)]
pub struct DedupCache {
    entries: Mutex<HashMap<String, Vec<DedupEntry>>>,
}

impl DedupCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` if `identity` was already seen by `session_key` within
    /// `window`, and records the sighting either way.
    pub fn exists(&self, session_key: &str, identity: &str, window: Duration) -> bool {
        self.exists_at(session_key, identity, window, Instant::now())
    }

    /// Same as [`DedupCache::exists`], evaluated at an explicit instant.
    pub fn exists_at(&self, session_key: &str, identity: &str, window: Duration, now: Instant) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        let seen = entries.entry(session_key.to_string()).or_default();

        // Compact while scanning: expired entries are dropped here and nowhere else.
        seen.retain(|entry| entry.is_live(now, window));

        if let Some(entry) = seen.iter_mut().find(|entry| entry.identity == identity) {
            entry.last_seen = now;
            return true;
        }

        seen.push(DedupEntry {
            identity: identity.to_string(),
            last_seen: now,
        });
        false
    }

    /// Number of entries currently stored for `session_key`, expired ones
    /// included until the next scan compacts them.
    pub fn tracked(&self, session_key: &str) -> usize {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(session_key).map_or(0, Vec::len)
    }

    /// Number of session keys that have ever been scanned.
    pub fn sessions(&self) -> usize {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
