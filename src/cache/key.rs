/// Cache key derivation for actions
///
/// A key is derived from the action name and its fully resolved configuration:
/// - configuration is serialized canonically (object keys sorted at every level)
/// - SHA256 over `{"action_name": ..., "config": ...}`
/// - first 16 hex characters, prefixed with the action name
///
/// Format: "{ActionName}_{hex_hash}", e.g. "TrainModel_3f2a9c01d4e5b678".
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Hex characters of the SHA256 digest kept in the key
pub const DIGEST_HEX_LEN: usize = 16;

/// Hex characters of the standalone configuration fingerprint
pub const FINGERPRINT_HEX_LEN: usize = 8;

/// Identity of one action invocation
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CacheKey {
    action_name: String,
    digest: String,
    fingerprint: String,
}

impl CacheKey {
    /// Derive the key for `action_name` run with `config`
    ///
    /// `config` must already be resolved (no `${...}` references left),
    /// otherwise equivalent configurations written with different reference
    /// styles get different keys.
    pub fn derive(action_name: &str, config: &Value) -> Self {
        let key_factors = json!({
            "action_name": action_name,
            "config": config,
        });
        let hash = sha256_hex(&to_canonical_json(&key_factors));

        Self {
            action_name: action_name.to_string(),
            digest: hash[..DIGEST_HEX_LEN].to_string(),
            fingerprint: config_fingerprint(config),
        }
    }

    pub fn action_name(&self) -> &str {
        &self.action_name
    }

    /// Truncated digest of action name and configuration
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Short hash of the configuration alone, stored with entries
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.action_name, self.digest)
    }
}

/// Short hash of a configuration, independent of the action name
pub fn config_fingerprint(config: &Value) -> String {
    let hash = sha256_hex(&to_canonical_json(config));
    hash[..FINGERPRINT_HEX_LEN].to_string()
}

/// Deterministic JSON text: objects are emitted with sorted keys, no whitespace
pub fn to_canonical_json(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        // Display on a string value produces the escaped, quoted literal
        Value::String(_) => value.to_string(),
        Value::Array(items) => {
            let items: Vec<String> = items.iter().map(to_canonical_json).collect();
            format!("[{}]", items.join(","))
        }
        Value::Object(map) => {
            let sorted: BTreeMap<&String, String> = map
                .iter()
                .map(|(k, v)| (k, to_canonical_json(v)))
                .collect();
            let items: Vec<String> = sorted
                .into_iter()
                .map(|(k, v)| format!("{}:{}", Value::String(k.clone()), v))
                .collect();
            format!("{{{}}}", items.join(","))
        }
    }
}

fn sha256_hex(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
