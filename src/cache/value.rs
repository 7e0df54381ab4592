//! Serializable output values
//!
//! Actions hand their results to the cache as `Outputs`, a sorted map of
//! output name to `OutputValue`. Large artifacts (model checkpoints, datasets on
//! disk) are cached by reference, not by content.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Named outputs of one action
pub type Outputs = BTreeMap<String, OutputValue>;

/// A value an action can publish to later stages and to the cache
///
/// Non-finite floats have no JSON encoding; outputs holding one are never
/// written to the cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum OutputValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<OutputValue>),
    Map(BTreeMap<String, OutputValue>),
    Artifact(ArtifactRef),
}

/// Reference to a file or directory produced outside the cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl ArtifactRef {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            digest: None,
        }
    }

    pub fn with_digest(mut self, digest: impl Into<String>) -> Self {
        self.digest = Some(digest.into());
        self
    }
}

impl OutputValue {
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Float(v) => Some(*v),
            Self::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_artifact(&self) -> Option<&ArtifactRef> {
        match self {
            Self::Artifact(v) => Some(v),
            _ => None,
        }
    }

    /// False if any float inside is NaN or infinite
    pub fn is_finite(&self) -> bool {
        match self {
            Self::Float(v) => v.is_finite(),
            Self::List(items) => items.iter().all(Self::is_finite),
            Self::Map(entries) => entries.values().all(Self::is_finite),
            _ => true,
        }
    }
}

impl From<bool> for OutputValue {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<i64> for OutputValue {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for OutputValue {
    fn from(v: i32) -> Self {
        Self::Int(v.into())
    }
}

impl From<u32> for OutputValue {
    fn from(v: u32) -> Self {
        Self::Int(v.into())
    }
}

impl From<f64> for OutputValue {
    fn from(v: f64) -> Self {
        Self::Float(v)
    }
}

impl From<f32> for OutputValue {
    fn from(v: f32) -> Self {
        Self::Float(v.into())
    }
}

impl From<&str> for OutputValue {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for OutputValue {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<ArtifactRef> for OutputValue {
    fn from(v: ArtifactRef) -> Self {
        Self::Artifact(v)
    }
}

impl<T: Into<OutputValue>> From<Vec<T>> for OutputValue {
    fn from(v: Vec<T>) -> Self {
        Self::List(v.into_iter().map(Into::into).collect())
    }
}

impl<T: Into<OutputValue>> From<Option<T>> for OutputValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(Self::Null, Into::into)
    }
}

impl From<BTreeMap<String, OutputValue>> for OutputValue {
    fn from(v: BTreeMap<String, OutputValue>) -> Self {
        Self::Map(v)
    }
}
