/// Action cache storage and retrieval
///
/// Layout under the cache directory, one pair of files per cache key:
/// - `<Action>_<digest>.zst`: zstd-compressed JSON payload with the outputs
/// - `<Action>_<digest>.json`: summary for humans, never read by `load`
///
/// Nothing in here aborts a run. Unreadable entries are misses, failed writes
/// are logged and the action is simply recomputed next time.
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::key::CacheKey;
use super::value::Outputs;
use crate::config::ActionSettings;
use crate::logging::{operations, status};
use crate::run_context::RunContext;

pub const PAYLOAD_EXTENSION: &str = "zst";
pub const SUMMARY_EXTENSION: &str = "json";

const ZSTD_LEVEL: i32 = 3;

/// Persisted payload
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CachePayload {
    pub outputs: Outputs,
    /// Seconds since the Unix epoch
    pub timestamp: f64,
    pub action_name: String,
    pub config_hash: String,
}

/// Human-readable companion of a payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub cache_key: String,
    pub action_name: String,
    /// RFC 3339 timestamp
    pub timestamp: String,
    pub config_hash: String,
    pub output_keys: Vec<String>,
}

/// How an action wants the cache to behave
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CachePolicy {
    pub enabled: bool,
    pub force_recompute: bool,
    pub max_age: Option<Duration>,
}

impl Default for CachePolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            force_recompute: false,
            max_age: None,
        }
    }
}

impl From<&ActionSettings> for CachePolicy {
    fn from(settings: &ActionSettings) -> Self {
        Self {
            enabled: settings.cache_enabled,
            force_recompute: settings.force_rerun,
            max_age: settings.max_age(),
        }
    }
}

/// A loaded, fresh cache entry
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry {
    pub outputs: Outputs,
    pub created_at: DateTime<Utc>,
    pub config_fingerprint: String,
    pub max_age: Option<Duration>,
}

impl CacheEntry {
    /// Age of the entry at `now`; entries from the future count as brand new
    pub fn age_at(&self, now: DateTime<Utc>) -> Duration {
        (now - self.created_at).to_std().unwrap_or(Duration::ZERO)
    }

    /// Fresh while strictly younger than `max_age`; a zero window never hits
    pub fn is_fresh_at(&self, now: DateTime<Utc>) -> bool {
        match self.max_age {
            Some(max_age) => self.age_at(now) < max_age,
            None => true,
        }
    }
}

/// Result of a cache lookup
#[derive(Debug, Clone, PartialEq)]
pub enum CacheLookup {
    Hit(CacheEntry),
    /// No entry on disk
    Miss,
    /// Caching is off or a recompute was forced
    Bypassed,
    /// Entry exists but is older than the freshness window (kept on disk)
    Expired { age: Duration },
    /// Entry could not be read or belongs to another invocation
    Unreadable(String),
}

impl CacheLookup {
    pub fn is_hit(&self) -> bool {
        matches!(self, Self::Hit(_))
    }

    pub fn into_outputs(self) -> Option<Outputs> {
        match self {
            Self::Hit(entry) => Some(entry.outputs),
            _ => None,
        }
    }
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub total_size_bytes: u64,
}

/// Action cache manager
#[derive(Debug, Clone)]
pub struct CacheStore {
    cache_dir: PathBuf,
}

impl CacheStore {
    /// Create a store rooted at `cache_dir`; the directory is created on first save
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    /// Store shared by every run under the context's runs root
    pub fn for_run(run: &RunContext) -> Self {
        Self::new(run.cache_dir())
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn payload_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", key, PAYLOAD_EXTENSION))
    }

    pub fn summary_path(&self, key: &CacheKey) -> PathBuf {
        self.cache_dir.join(format!("{}.{}", key, SUMMARY_EXTENSION))
    }

    /// Look up outputs for `key`
    pub fn load(&self, key: &CacheKey, policy: &CachePolicy) -> CacheLookup {
        self.load_at(key, policy, Utc::now())
    }

    /// Look up outputs for `key` as if the current time were `now`
    pub fn load_at(
        &self,
        key: &CacheKey,
        policy: &CachePolicy,
        now: DateTime<Utc>,
    ) -> CacheLookup {
        if !policy.enabled || policy.force_recompute {
            debug!(
                action = key.action_name(),
                operation = operations::LOAD,
                status = status::DISABLED,
                "cache bypassed"
            );
            return CacheLookup::Bypassed;
        }

        let path = self.payload_path(key);
        if !path.exists() {
            debug!(
                action = key.action_name(),
                operation = operations::LOAD,
                status = status::MISS,
                cache_key = %key,
                "cache miss"
            );
            return CacheLookup::Miss;
        }

        let payload = match read_payload(&path) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(
                    action = key.action_name(),
                    operation = operations::LOAD,
                    status = status::CORRUPT,
                    path = %path.display(),
                    "Failed to load cache for {}: {:#}",
                    key.action_name(),
                    e
                );
                return CacheLookup::Unreadable(format!("{:#}", e));
            }
        };

        if payload.action_name != key.action_name() || payload.config_hash != key.fingerprint() {
            let reason = format!(
                "entry belongs to {} (config {}), expected {} (config {})",
                payload.action_name,
                payload.config_hash,
                key.action_name(),
                key.fingerprint()
            );
            warn!(
                action = key.action_name(),
                operation = operations::LOAD,
                status = status::CORRUPT,
                cache_key = %key,
                "Cache key collision: {}",
                reason
            );
            return CacheLookup::Unreadable(reason);
        }

        let Some(created_at) = timestamp_to_datetime(payload.timestamp) else {
            let reason = format!("invalid timestamp {}", payload.timestamp);
            warn!(
                action = key.action_name(),
                operation = operations::LOAD,
                status = status::CORRUPT,
                cache_key = %key,
                "Failed to load cache for {}: {}",
                key.action_name(),
                reason
            );
            return CacheLookup::Unreadable(reason);
        };

        let entry = CacheEntry {
            outputs: payload.outputs,
            created_at,
            config_fingerprint: payload.config_hash,
            max_age: policy.max_age,
        };

        if !entry.is_fresh_at(now) {
            let age = entry.age_at(now);
            info!(
                action = key.action_name(),
                operation = operations::LOAD,
                status = status::EXPIRED,
                cache_key = %key,
                "Cache for {} is expired (age: {:.1}s)",
                key.action_name(),
                age.as_secs_f64()
            );
            return CacheLookup::Expired { age };
        }

        info!(
            action = key.action_name(),
            operation = operations::LOAD,
            status = status::HIT,
            cache_key = %key,
            "Loading cached outputs for {}",
            key.action_name()
        );
        CacheLookup::Hit(entry)
    }

    /// Persist outputs for `key`; returns whether the entry was written
    pub fn save(&self, key: &CacheKey, outputs: &Outputs) -> bool {
        self.save_at(key, outputs, Utc::now())
    }

    /// Persist outputs for `key` stamped with `created_at`
    pub fn save_at(&self, key: &CacheKey, outputs: &Outputs, created_at: DateTime<Utc>) -> bool {
        match self.try_save(key, outputs, created_at) {
            Ok(path) => {
                info!(
                    action = key.action_name(),
                    operation = operations::SAVE,
                    status = status::SUCCESS,
                    cache_key = %key,
                    path = %path.display(),
                    "Cached outputs for {} with key {}",
                    key.action_name(),
                    key
                );
                true
            }
            Err(e) => {
                warn!(
                    action = key.action_name(),
                    operation = operations::SAVE,
                    status = status::ERROR,
                    cache_key = %key,
                    "Failed to save cache for {}: {:#}",
                    key.action_name(),
                    e
                );
                false
            }
        }
    }

    fn try_save(
        &self,
        key: &CacheKey,
        outputs: &Outputs,
        created_at: DateTime<Utc>,
    ) -> Result<PathBuf> {
        // JSON has no encoding for NaN or infinity; such an entry could never be read back
        if let Some((name, _)) = outputs.iter().find(|(_, value)| !value.is_finite()) {
            anyhow::bail!("Output '{}' holds a non-finite float", name);
        }

        fs::create_dir_all(&self.cache_dir).with_context(|| {
            format!(
                "Failed to create cache directory: {}",
                self.cache_dir.display()
            )
        })?;

        let payload = CachePayload {
            outputs: outputs.clone(),
            timestamp: datetime_to_timestamp(created_at),
            action_name: key.action_name().to_string(),
            config_hash: key.fingerprint().to_string(),
        };
        let json = serde_json::to_vec(&payload).context("Failed to serialize cache payload")?;
        let compressed =
            zstd::encode_all(&json[..], ZSTD_LEVEL).context("Failed to compress cache payload")?;

        let payload_path = self.payload_path(key);
        self.write_atomically(&payload_path, &compressed)?;

        let summary = CacheSummary {
            cache_key: key.to_string(),
            action_name: key.action_name().to_string(),
            timestamp: created_at.to_rfc3339_opts(SecondsFormat::Micros, true),
            config_hash: key.fingerprint().to_string(),
            output_keys: outputs.keys().cloned().collect(),
        };
        let summary_json =
            serde_json::to_string_pretty(&summary).context("Failed to serialize cache summary")?;
        self.write_atomically(&self.summary_path(key), summary_json.as_bytes())?;

        Ok(payload_path)
    }

    /// Write through a temporary file in the cache directory and rename into
    /// place, so readers never see a partial entry. Concurrent writers of the
    /// same key race; the last rename wins.
    fn write_atomically(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let mut tmp = NamedTempFile::new_in(&self.cache_dir).with_context(|| {
            format!(
                "Failed to create temporary file in: {}",
                self.cache_dir.display()
            )
        })?;
        tmp.write_all(bytes)
            .with_context(|| format!("Failed to write: {}", tmp.path().display()))?;
        tmp.persist(path)
            .map_err(|e| e.error)
            .with_context(|| format!("Failed to write cache file: {}", path.display()))?;
        Ok(())
    }

    /// Remove the payload and summary for `key`; returns whether anything existed
    pub fn invalidate(&self, key: &CacheKey) -> Result<bool> {
        let mut removed = false;

        for path in [self.payload_path(key), self.summary_path(key)] {
            if path.exists() {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove cache file: {}", path.display()))?;
                removed = true;
            }
        }

        if removed {
            info!(
                action = key.action_name(),
                operation = operations::INVALIDATE,
                status = status::SUCCESS,
                cache_key = %key,
                "Cleared cache for {}",
                key.action_name()
            );
        }

        Ok(removed)
    }

    /// Read the summary written alongside `key`
    pub fn summary(&self, key: &CacheKey) -> Result<Option<CacheSummary>> {
        let path = self.summary_path(key);
        if !path.exists() {
            return Ok(None);
        }
        read_summary(&path).map(Some)
    }

    /// List all readable summaries, sorted by cache key
    pub fn list(&self) -> Result<Vec<CacheSummary>> {
        let mut summaries = Vec::new();

        for path in self.files_with_extension(SUMMARY_EXTENSION)? {
            match read_summary(&path) {
                Ok(summary) => summaries.push(summary),
                Err(e) => debug!("Skipping unreadable summary {}: {:#}", path.display(), e),
            }
        }

        summaries.sort_by(|a, b| a.cache_key.cmp(&b.cache_key));
        Ok(summaries)
    }

    /// Get cache statistics
    pub fn stats(&self) -> Result<CacheStats> {
        let mut stats = CacheStats::default();

        for path in self.files_with_extension(PAYLOAD_EXTENSION)? {
            stats.total_entries += 1;
            if let Ok(metadata) = fs::metadata(&path) {
                stats.total_size_bytes += metadata.len();
            }
        }

        Ok(stats)
    }

    /// Remove every payload and summary; returns the number of files removed
    pub fn clean_all(&self) -> Result<usize> {
        let mut removed = 0;

        for extension in [PAYLOAD_EXTENSION, SUMMARY_EXTENSION] {
            for path in self.files_with_extension(extension)? {
                fs::remove_file(&path)
                    .with_context(|| format!("Failed to remove cache file: {}", path.display()))?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    fn files_with_extension(&self, extension: &str) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();

        if !self.cache_dir.exists() {
            return Ok(files);
        }

        for entry in fs::read_dir(&self.cache_dir).with_context(|| {
            format!(
                "Failed to read cache directory: {}",
                self.cache_dir.display()
            )
        })? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == extension) {
                files.push(path);
            }
        }

        files.sort();
        Ok(files)
    }
}

fn read_payload(path: &Path) -> Result<CachePayload> {
    let compressed =
        fs::read(path).with_context(|| format!("Failed to read: {}", path.display()))?;
    let json = zstd::decode_all(&compressed[..]).context("Failed to decompress payload")?;
    serde_json::from_slice(&json).context("Failed to parse payload")
}

fn read_summary(path: &Path) -> Result<CacheSummary> {
    let json =
        fs::read_to_string(path).with_context(|| format!("Failed to read: {}", path.display()))?;
    serde_json::from_str(&json).context("Failed to parse summary JSON")
}

fn datetime_to_timestamp(at: DateTime<Utc>) -> f64 {
    at.timestamp_micros() as f64 / 1_000_000.0
}

fn timestamp_to_datetime(timestamp: f64) -> Option<DateTime<Utc>> {
    if !timestamp.is_finite() {
        return None;
    }
    let micros = (timestamp * 1_000_000.0).round();
    if micros.abs() > i64::MAX as f64 {
        return None;
    }
    DateTime::from_timestamp_micros(micros as i64)
}
