//! Documents, document keys, and parsed field paths.
//!
//! A [`Document`] is a JSON object tree. Every stored document carries its
//! [`DocumentKey`] under the reserved [`ID_FIELD`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{StoreError, StoreResult};

/// Name of the field holding a document's key.
pub const ID_FIELD: &str = "_id";

/// A string-keyed document tree.
pub type Document = Map<String, Value>;

// ── keys ─────────────────────────────────────────────────────────────

/// Identifier of a document, unique within its collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DocumentKey {
    /// Numeric id (guild or user snowflakes).
    Int(i64),
    /// Free-form string id.
    Str(String),
}

impl DocumentKey {
    /// The key as it appears in the document's `_id` field.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Int(n) => Value::from(*n),
            Self::Str(s) => Value::from(s.as_str()),
        }
    }

    /// Extract the key from a document's `_id` field, if it has a usable one.
    pub fn from_document(doc: &Document) -> Option<Self> {
        match doc.get(ID_FIELD)? {
            Value::Number(n) => n.as_i64().map(Self::Int),
            Value::String(s) => Some(Self::Str(s.clone())),
            _ => None,
        }
    }
}

impl fmt::Display for DocumentKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(n) => write!(f, "{n}"),
            Self::Str(s) => f.write_str(s),
        }
    }
}

impl From<i64> for DocumentKey {
    fn from(n: i64) -> Self {
        Self::Int(n)
    }
}

impl From<&str> for DocumentKey {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for DocumentKey {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl FromStr for DocumentKey {
    type Err = std::convert::Infallible;

    /// Integers parse as [`DocumentKey::Int`], everything else as a string key.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.parse::<i64>() {
            Ok(n) => Self::Int(n),
            Err(_) => Self::Str(s.to_string()),
        })
    }
}

// ── paths ────────────────────────────────────────────────────────────

/// A dot-separated field path, parsed once at construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parse `raw` into path segments.
    ///
    /// Rejects empty paths, empty segments (`a..b`), operator-like segments
    /// (`$each`) and any path touching `_id`.
    pub fn parse(raw: &str) -> StoreResult<Self> {
        if raw.is_empty() {
            return Err(StoreError::invalid_path(raw, "path is empty"));
        }
        let mut segments = Vec::new();
        for segment in raw.split('.') {
            if segment.is_empty() {
                return Err(StoreError::invalid_path(raw, "empty path segment"));
            }
            if segment.starts_with('$') {
                return Err(StoreError::invalid_path(
                    raw,
                    format!("segment `{segment}` starts with `$`"),
                ));
            }
            segments.push(segment.to_string());
        }
        if segments[0] == ID_FIELD {
            return Err(StoreError::invalid_path(raw, "`_id` is immutable"));
        }
        Ok(Self { segments })
    }

    /// All segments in order.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Segments leading to the target field's parent.
    pub fn parents(&self) -> &[String] {
        &self.segments[..self.segments.len() - 1]
    }

    /// The final segment (the field being written).
    pub fn leaf(&self) -> &str {
        &self.segments[self.segments.len() - 1]
    }

    /// Whether `self` equals `other` or one is a prefix of the other.
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        self.segments
            .iter()
            .zip(other.segments.iter())
            .all(|(a, b)| a == b)
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("."))
    }
}

impl FromStr for FieldPath {
    type Err = StoreError;

    fn from_str(s: &str) -> StoreResult<Self> {
        Self::parse(s)
    }
}

/// Short name of a JSON value's kind, used in error messages.
pub fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "mapping",
    }
}

// ── tests ────────────────────────────────────────────────────────────
