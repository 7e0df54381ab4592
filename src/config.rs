//! Layered configuration and action scope resolution
//!
//! A run is configured by a single tree. The same action implementation is used
//! both as a pipeline stage and as a standalone invocation, so the segment that
//! holds its settings is looked up in a fixed order:
//!
//! 1. `pipeline_config`, when it is a non-empty table (installed by the
//!    pipeline driver for the stage being executed)
//! 2. `action_config`, when it is a table embedded in the tree
//! 3. the whole tree (flattened single-action invocation)
//!
//! Resolution never fails; a tree that matches none of the segment shapes is
//! simply its own scope.
use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::config_fingerprint;
use crate::error::ActionError;

pub const PIPELINE_CONFIG_KEY: &str = "pipeline_config";
pub const ACTION_CONFIG_KEY: &str = "action_config";

/// Dataset segments, checked in this order; the first table found is stamped
const DATASET_POINTERS: [&str; 3] = [
    "/action_config/dataset",
    "/pipeline_config/dataset",
    "/dataset",
];
pub const DATASET_NAME_KEY: &str = "name";
pub const DATASET_HASH_KEY: &str = "hash";

/// Where the authoritative settings of an action were found
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeSource {
    Pipeline,
    Embedded,
    TopLevel,
}

/// The configuration segment that belongs to the executing action
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedScope {
    pub source: ScopeSource,
    pub config: Value,
}

/// Full configuration tree of a run
#[derive(Debug, Clone, PartialEq)]
pub struct LayeredConfig {
    root: Value,
}

impl LayeredConfig {
    pub fn new(root: Value) -> Self {
        Self { root }
    }

    /// Load configuration from a TOML or JSON file (picked by extension)
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let root: Value = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
            _ => toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", path.display()))?,
        };

        Ok(Self::new(root))
    }

    pub fn root(&self) -> &Value {
        &self.root
    }

    pub fn into_root(self) -> Value {
        self.root
    }

    /// Look up a dotted path (`a.b.0.c`) in the tree
    pub fn lookup(&self, path: &str) -> Option<&Value> {
        lookup(&self.root, path)
    }

    /// Replace every `${path}` reference with the value it points to
    ///
    /// A string that is exactly one reference takes the referenced value with
    /// its type; references embedded in longer strings are spliced in as text.
    pub fn resolve(&self) -> Result<Self, ActionError> {
        let mut stack = Vec::new();
        let root = resolve_value(&self.root, &self.root, &mut stack)?;
        Ok(Self::new(root))
    }

    /// Copy of this tree with `stage` installed as the pipeline segment
    pub fn with_stage(&self, stage: &Value) -> Self {
        let mut root = match &self.root {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };
        root.insert(PIPELINE_CONFIG_KEY.to_string(), stage.clone());
        Self::new(Value::Object(root))
    }

    /// Segment that holds the settings of the currently executing action
    pub fn scope(&self) -> ResolvedScope {
        resolve_scope(&self.root)
    }

    /// Copy of this tree with `hash = "<name>_<fingerprint>"` set on the dataset segment
    ///
    /// The fingerprint covers the dataset table without its previous hash, so
    /// stamping twice gives the same tree. Datasets without a `name` are left alone.
    pub fn stamp_dataset_hash(&self) -> Self {
        let mut root = self.root.clone();

        let Some(pointer) = DATASET_POINTERS
            .iter()
            .find(|pointer| root.pointer(pointer).is_some_and(Value::is_object))
        else {
            return Self::new(root);
        };

        if let Some(Value::Object(dataset)) = root.pointer_mut(pointer) {
            let name = match dataset.get(DATASET_NAME_KEY) {
                None | Some(Value::Null) => None,
                Some(Value::String(name)) => Some(name.clone()),
                Some(other) => Some(other.to_string()),
            };

            if let Some(name) = name {
                let mut fingerprinted = dataset.clone();
                fingerprinted.remove(DATASET_HASH_KEY);
                let fingerprint = config_fingerprint(&Value::Object(fingerprinted));
                let hash = format!("{}_{}", name, fingerprint);
                debug!("Dataset {} stamped with hash {}", pointer, hash);
                dataset.insert(DATASET_HASH_KEY.to_string(), Value::String(hash));
            }
        }

        Self::new(root)
    }
}

impl From<Value> for LayeredConfig {
    fn from(root: Value) -> Self {
        Self::new(root)
    }
}

/// Pick the authoritative segment for the executing action
pub fn resolve_scope(root: &Value) -> ResolvedScope {
    if let Some(stage @ Value::Object(map)) = root.get(PIPELINE_CONFIG_KEY) {
        if !map.is_empty() {
            return ResolvedScope {
                source: ScopeSource::Pipeline,
                config: stage.clone(),
            };
        }
    }

    if let Some(segment @ Value::Object(_)) = root.get(ACTION_CONFIG_KEY) {
        return ResolvedScope {
            source: ScopeSource::Embedded,
            config: segment.clone(),
        };
    }

    ResolvedScope {
        source: ScopeSource::TopLevel,
        config: root.clone(),
    }
}

/// Look up a dotted path in a JSON tree; numeric segments index arrays
pub fn lookup<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(root, |node, segment| match node {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

fn resolve_value(
    root: &Value,
    value: &Value,
    stack: &mut Vec<String>,
) -> Result<Value, ActionError> {
    match value {
        Value::String(text) => resolve_string(root, text, stack),
        Value::Array(items) => items
            .iter()
            .map(|item| resolve_value(root, item, stack))
            .collect::<Result<Vec<_>, _>>()
            .map(Value::Array),
        Value::Object(map) => {
            let mut resolved = Map::new();
            for (key, item) in map {
                resolved.insert(key.clone(), resolve_value(root, item, stack)?);
            }
            Ok(Value::Object(resolved))
        }
        other => Ok(other.clone()),
    }
}

fn resolve_string(root: &Value, text: &str, stack: &mut Vec<String>) -> Result<Value, ActionError> {
    if let Some(path) = whole_reference(text) {
        return resolve_reference(root, path, stack);
    }

    if !text.contains("${") {
        return Ok(Value::String(text.to_string()));
    }

    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find('}')
            .ok_or_else(|| ActionError::Config(format!("Unterminated reference in '{}'", text)))?;

        match resolve_reference(root, &after[..end], stack)? {
            Value::String(s) => out.push_str(&s),
            other => out.push_str(&other.to_string()),
        }
        rest = &after[end + 1..];
    }
    out.push_str(rest);

    Ok(Value::String(out))
}

fn whole_reference(text: &str) -> Option<&str> {
    let inner = text.strip_prefix("${")?.strip_suffix('}')?;
    if inner.contains("${") || inner.contains('}') {
        None
    } else {
        Some(inner)
    }
}

fn resolve_reference(
    root: &Value,
    path: &str,
    stack: &mut Vec<String>,
) -> Result<Value, ActionError> {
    let path = path.trim();

    if stack.iter().any(|seen| seen == path) {
        return Err(ActionError::Config(format!(
            "Cyclic reference: {} -> {}",
            stack.join(" -> "),
            path
        )));
    }

    let target = lookup(root, path)
        .ok_or_else(|| ActionError::Config(format!("Unresolved reference: ${{{}}}", path)))?;

    stack.push(path.to_string());
    let resolved = resolve_value(root, target, stack);
    stack.pop();
    resolved
}

/// Cache and device settings read from the action scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSettings {
    /// Reuse and persist outputs between runs
    #[serde(default = "default_true")]
    pub cache_enabled: bool,

    /// Ignore any existing entry and recompute
    #[serde(default)]
    pub force_rerun: bool,

    /// Entries older than this many hours are treated as absent
    #[serde(default)]
    pub cache_max_age_hours: Option<f64>,

    /// Device selector: auto, cpu, cuda, cuda:N, mps
    #[serde(default = "default_device")]
    pub device: String,
}

/// Scope keys that steer caching but do not change what an action computes.
/// They are left out of the cache key so that toggling them reuses entries.
pub const CACHE_CONTROL_KEYS: [&str; 3] = ["cache_enabled", "force_rerun", "cache_max_age_hours"];

impl Default for ActionSettings {
    fn default() -> Self {
        Self {
            cache_enabled: true,
            force_rerun: false,
            cache_max_age_hours: None,
            device: default_device(),
        }
    }
}

impl ActionSettings {
    /// Read settings from a scope; each field falls back to its default on its own
    pub fn from_scope(scope: &Value) -> Self {
        let defaults = Self::default();
        if !scope.is_object() {
            debug!("Action scope is not a table, using default cache settings");
            return defaults;
        }

        Self {
            cache_enabled: setting(scope, "cache_enabled", defaults.cache_enabled),
            force_rerun: setting(scope, "force_rerun", defaults.force_rerun),
            cache_max_age_hours: setting(
                scope,
                "cache_max_age_hours",
                defaults.cache_max_age_hours,
            ),
            device: setting(scope, "device", defaults.device),
        }
    }

    /// Freshness window derived from `cache_max_age_hours`
    pub fn max_age(&self) -> Option<Duration> {
        let hours = self.cache_max_age_hours?;

        match Duration::try_from_secs_f64(hours * 3600.0) {
            Ok(max_age) => Some(max_age),
            Err(_) => {
                warn!(
                    "Ignoring invalid cache_max_age_hours={} (must be finite and non-negative)",
                    hours
                );
                None
            }
        }
    }
}

fn setting<T: DeserializeOwned>(scope: &Value, key: &str, default: T) -> T {
    let Some(value) = scope.get(key) else {
        return default;
    };

    match T::deserialize(value) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("Invalid value for '{}' in action config, using default: {}", key, e);
            default
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_device() -> String {
    "auto".to_string()
}
