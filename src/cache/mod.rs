//! Persistent cache of action outputs
//!
//! Entries live under `<runs root>/action_cache/`, one compressed payload and
//! one human-readable summary per cache key.

pub mod key;
pub mod store;
pub mod value;

pub use key::{config_fingerprint, to_canonical_json, CacheKey};
pub use store::{CacheEntry, CacheLookup, CachePolicy, CacheStats, CacheStore, CacheSummary};
pub use value::{ArtifactRef, OutputValue, Outputs};
