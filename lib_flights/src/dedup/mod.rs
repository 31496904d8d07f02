//! # Deduplication
//!
//! Remembers which flights each session has already been sent, so a flight
//! that keeps showing up in the search region is delivered once per window.

/// The sliding-window membership cache.
pub mod cache;

pub use cache::{DedupCache, DedupEntry};
