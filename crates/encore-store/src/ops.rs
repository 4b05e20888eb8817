//! Operator engine.
//!
//! [`apply`] runs a batch of [`UpdateOperation`]s against a working copy of
//! a document and, in the same pass, records the equivalent
//! [`NativeUpdate`] expression for the backing store. The in-memory result
//! and the store command are produced together so their semantics cannot
//! drift apart.
//!
//! The native syntax is the familiar document-store operator form:
//!
//! ```text
//! { "$set":   { "a.b": 1 },
//!   "$unset": { "c": "" },
//!   "$inc":   { "n": 1 },
//!   "$push":  { "history": { "$each": ["x", "y"], "$slice": -25 } },
//!   "$pull":  { "tags": { "$in": ["old"] } } }
//! ```
//!
//! Nothing in this module performs I/O.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::document::{Document, FieldPath, kind_of};
use crate::error::{StoreError, StoreResult};

const SET: &str = "$set";
const UNSET: &str = "$unset";
const INC: &str = "$inc";
const PUSH: &str = "$push";
const PULL: &str = "$pull";
const EACH: &str = "$each";
const SLICE: &str = "$slice";
const IN: &str = "$in";

// ═══════════════════════════════════════════════════════════════════════
//  Types
// ═══════════════════════════════════════════════════════════════════════

/// Bound applied to a list after a push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrimPolicy {
    /// Keep the first `n` elements.
    KeepFirst(usize),
    /// Keep the last `n` elements.
    KeepLast(usize),
}

impl TrimPolicy {
    /// Decode a signed slice: negative counts from the end.
    pub fn from_slice(n: i64) -> Self {
        if n < 0 {
            Self::KeepLast(n.unsigned_abs() as usize)
        } else {
            Self::KeepFirst(n as usize)
        }
    }

    /// Encode as a signed slice.
    pub fn to_slice(self) -> i64 {
        match self {
            Self::KeepFirst(n) => n as i64,
            Self::KeepLast(n) => -(n as i64),
        }
    }

    fn trim(self, list: &mut Vec<Value>) {
        match self {
            Self::KeepFirst(n) => list.truncate(n),
            Self::KeepLast(n) => {
                let excess = list.len().saturating_sub(n);
                list.drain(..excess);
            }
        }
    }
}

/// One update instruction against a single field path.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOperation {
    /// Assign `value`, replacing whatever was there.
    Set { path: FieldPath, value: Value },
    /// Remove the field if present.
    Unset { path: FieldPath },
    /// Add `delta` to a numeric field (absent counts as 0).
    Increment { path: FieldPath, delta: Number },
    /// Append `values` to a list (absent counts as empty), then trim.
    Push {
        path: FieldPath,
        values: Vec<Value>,
        trim: Option<TrimPolicy>,
    },
    /// Remove every list element equal to one of `matcher`.
    Pull { path: FieldPath, matcher: Vec<Value> },
}

impl UpdateOperation {
    pub fn set(path: &str, value: impl Into<Value>) -> StoreResult<Self> {
        Ok(Self::Set {
            path: FieldPath::parse(path)?,
            value: value.into(),
        })
    }

    pub fn unset(path: &str) -> StoreResult<Self> {
        Ok(Self::Unset {
            path: FieldPath::parse(path)?,
        })
    }

    pub fn increment(path: &str, delta: impl Into<Number>) -> StoreResult<Self> {
        Ok(Self::Increment {
            path: FieldPath::parse(path)?,
            delta: delta.into(),
        })
    }

    pub fn push(path: &str, values: Vec<Value>, trim: Option<TrimPolicy>) -> StoreResult<Self> {
        Ok(Self::Push {
            path: FieldPath::parse(path)?,
            values,
            trim,
        })
    }

    pub fn pull(path: &str, matcher: Vec<Value>) -> StoreResult<Self> {
        Ok(Self::Pull {
            path: FieldPath::parse(path)?,
            matcher,
        })
    }

    /// The path this operation targets.
    pub fn path(&self) -> &FieldPath {
        match self {
            Self::Set { path, .. }
            | Self::Unset { path }
            | Self::Increment { path, .. }
            | Self::Push { path, .. }
            | Self::Pull { path, .. } => path,
        }
    }

    fn operator(&self) -> &'static str {
        match self {
            Self::Set { .. } => SET,
            Self::Unset { .. } => UNSET,
            Self::Increment { .. } => INC,
            Self::Push { .. } => PUSH,
            Self::Pull { .. } => PULL,
        }
    }

    /// The operand as it appears in the native expression.
    fn native_operand(&self) -> Value {
        match self {
            Self::Set { value, .. } => value.clone(),
            Self::Unset { .. } => Value::String(String::new()),
            Self::Increment { delta, .. } => Value::Number(delta.clone()),
            Self::Push { values, trim, .. } => {
                let mut spec = Map::new();
                spec.insert(EACH.into(), Value::Array(values.clone()));
                if let Some(trim) = trim {
                    spec.insert(SLICE.into(), Value::from(trim.to_slice()));
                }
                Value::Object(spec)
            }
            Self::Pull { matcher, .. } => {
                let mut spec = Map::new();
                spec.insert(IN.into(), Value::Array(matcher.clone()));
                Value::Object(spec)
            }
        }
    }
}

/// A native update expression for the backing store.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NativeUpdate(Map<String, Value>);

impl NativeUpdate {
    fn record(&mut self, op: &UpdateOperation) {
        let fields = self
            .0
            .entry(op.operator())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Value::Object(fields) = fields {
            fields.insert(op.path().to_string(), op.native_operand());
        }
    }

    /// Whether the expression contains no operators.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Borrow the expression as a JSON object.
    pub fn as_map(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Render the expression as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }
}

impl From<Map<String, Value>> for NativeUpdate {
    fn from(map: Map<String, Value>) -> Self {
        Self(map)
    }
}

// ═══════════════════════════════════════════════════════════════════════
//  Engine
// ═══════════════════════════════════════════════════════════════════════

/// Apply `ops` in order to a copy of `doc`.
///
/// Returns the mutated copy together with the native expression that makes
/// the same change in the store. On any error the input is untouched and
/// nothing is returned, so a batch applies completely or not at all.
pub fn apply(doc: &Document, ops: &[UpdateOperation]) -> StoreResult<(Document, NativeUpdate)> {
    check_conflicts(ops)?;

    let mut working = doc.clone();
    let mut native = NativeUpdate::default();
    for op in ops {
        apply_one(&mut working, op)?;
        native.record(op);
    }
    Ok((working, native))
}

/// Decode a native expression back into operations.
///
/// Used by backends that interpret the native syntax themselves. Besides
/// the canonical forms produced by [`apply`], a bare `$push` value appends
/// one element and a bare `$pull` value removes one value.
pub fn decode_native(update: &NativeUpdate) -> StoreResult<Vec<UpdateOperation>> {
    let mut ops = Vec::new();
    for (operator, fields) in update.as_map() {
        let Value::Object(fields) = fields else {
            return Err(StoreError::invalid_path(
                operator.as_str(),
                "operator body must be a mapping",
            ));
        };
        for (raw_path, operand) in fields {
            let path = FieldPath::parse(raw_path)?;
            let op = match operator.as_str() {
                SET => UpdateOperation::Set {
                    path,
                    value: operand.clone(),
                },
                UNSET => UpdateOperation::Unset { path },
                INC => match operand {
                    Value::Number(delta) => UpdateOperation::Increment {
                        path,
                        delta: delta.clone(),
                    },
                    other => {
                        return Err(StoreError::TypeMismatch {
                            path: raw_path.clone(),
                            expected: "number",
                            found: kind_of(other),
                        });
                    }
                },
                PUSH => decode_push(path, operand)?,
                PULL => {
                    let matcher = match operand.get(IN) {
                        Some(Value::Array(values)) => values.clone(),
                        _ => vec![operand.clone()],
                    };
                    UpdateOperation::Pull { path, matcher }
                }
                other => {
                    return Err(StoreError::invalid_path(
                        raw_path.as_str(),
                        format!("unknown update operator `{other}`"),
                    ));
                }
            };
            ops.push(op);
        }
    }
    Ok(ops)
}

fn decode_push(path: FieldPath, operand: &Value) -> StoreResult<UpdateOperation> {
    let Some(Value::Array(values)) = operand.get(EACH) else {
        return Ok(UpdateOperation::Push {
            path,
            values: vec![operand.clone()],
            trim: None,
        });
    };
    let trim = match operand.get(SLICE) {
        None => None,
        Some(slice) => match slice.as_i64() {
            Some(n) => Some(TrimPolicy::from_slice(n)),
            None => {
                return Err(StoreError::TypeMismatch {
                    path: path.to_string(),
                    expected: "integer slice",
                    found: kind_of(slice),
                });
            }
        },
    };
    Ok(UpdateOperation::Push {
        path,
        values: values.clone(),
        trim,
    })
}

/// One batch may not address the same path, or a path and its prefix, twice.
fn check_conflicts(ops: &[UpdateOperation]) -> StoreResult<()> {
    for (i, op) in ops.iter().enumerate() {
        if let Some(other) = ops[i + 1..].iter().find(|o| o.path().overlaps(op.path())) {
            return Err(StoreError::invalid_path(
                op.path().to_string(),
                format!("conflicts with `{}` in the same batch", other.path()),
            ));
        }
    }
    Ok(())
}

fn apply_one(doc: &mut Document, op: &UpdateOperation) -> StoreResult<()> {
    match op {
        UpdateOperation::Set { path, value } => {
            parent_mut(doc, path)?.insert(path.leaf().to_string(), value.clone());
        }
        UpdateOperation::Unset { path } => {
            if let Some(parent) = existing_parent_mut(doc, path) {
                parent.remove(path.leaf());
            }
        }
        UpdateOperation::Increment { path, delta } => {
            let parent = parent_mut(doc, path)?;
            let current = match parent.get(path.leaf()) {
                None => Number::from(0),
                Some(Value::Number(n)) => n.clone(),
                Some(other) => {
                    return Err(StoreError::TypeMismatch {
                        path: path.to_string(),
                        expected: "number",
                        found: kind_of(other),
                    });
                }
            };
            let sum = add_numbers(&current, delta).ok_or_else(|| StoreError::TypeMismatch {
                path: path.to_string(),
                expected: "finite number",
                found: "number",
            })?;
            parent.insert(path.leaf().to_string(), Value::Number(sum));
        }
        UpdateOperation::Push { path, values, trim } => {
            let parent = parent_mut(doc, path)?;
            let slot = parent
                .entry(path.leaf().to_string())
                .or_insert_with(|| Value::Array(Vec::new()));
            match slot {
                Value::Array(list) => {
                    list.extend(values.iter().cloned());
                    if let Some(trim) = trim {
                        trim.trim(list);
                    }
                }
                other => {
                    return Err(StoreError::TypeMismatch {
                        path: path.to_string(),
                        expected: "list",
                        found: kind_of(other),
                    });
                }
            }
        }
        UpdateOperation::Pull { path, matcher } => {
            if let Some(Value::Array(list)) =
                existing_parent_mut(doc, path).and_then(|p| p.get_mut(path.leaf()))
            {
                list.retain(|item| !matcher.contains(item));
            }
        }
    }
    Ok(())
}

/// Walk to the target's parent mapping, creating missing mappings.
fn parent_mut<'a>(doc: &'a mut Document, path: &FieldPath) -> StoreResult<&'a mut Document> {
    let mut current = doc;
    for segment in path.parents() {
        let slot = current
            .entry(segment.clone())
            .or_insert_with(|| Value::Object(Map::new()));
        current = match slot {
            Value::Object(map) => map,
            other => {
                return Err(StoreError::invalid_path(
                    path.to_string(),
                    format!("`{segment}` is a {}, not a mapping", kind_of(other)),
                ));
            }
        };
    }
    Ok(current)
}

/// Walk to the target's parent mapping without creating anything.
fn existing_parent_mut<'a>(doc: &'a mut Document, path: &FieldPath) -> Option<&'a mut Document> {
    let mut current = doc;
    for segment in path.parents() {
        current = current.get_mut(segment)?.as_object_mut()?;
    }
    Some(current)
}

fn add_numbers(current: &Number, delta: &Number) -> Option<Number> {
    if let (Some(a), Some(b)) = (current.as_i64(), delta.as_i64())
        && let Some(sum) = a.checked_add(b)
    {
        return Some(sum.into());
    }
    Number::from_f64(current.as_f64()? + delta.as_f64()?)
}

// ═══════════════════════════════════════════════════════════════════════
//  Tests
// ═══════════════════════════════════════════════════════════════════════
