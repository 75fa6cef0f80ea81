//! Attribute-level change records shown in plans.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::expr::join_path;

/// A change to a single attribute during a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeChange {
    /// The path to the attribute that changed.
    pub path: String,
    /// The value before the change (None if the attribute is new).
    pub before: Option<Value>,
    /// The value after the change (None if the attribute is removed, or
    /// unknown until apply).
    pub after: Option<Value>,
}

impl AttributeChange {
    /// Create a new attribute change.
    pub fn new(path: impl Into<String>, before: Option<Value>, after: Option<Value>) -> Self {
        Self {
            path: path.into(),
            before,
            after,
        }
    }

    /// Create a change for a new attribute.
    pub fn added(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, None, Some(value))
    }

    /// Create a change for a removed attribute.
    pub fn removed(path: impl Into<String>, value: Value) -> Self {
        Self::new(path, Some(value), None)
    }

    /// Create a change for a modified attribute.
    pub fn modified(path: impl Into<String>, before: Value, after: Value) -> Self {
        Self::new(path, Some(before), Some(after))
    }
}

/// Compute attribute-level changes between two property objects.
///
/// Objects are compared key by key, recursively; any other value (including
/// arrays) is compared as a whole. Changes come back sorted by path.
pub fn diff(before: &Value, after: &Value) -> Vec<AttributeChange> {
    let mut changes = Vec::new();
    diff_into("", before, after, &mut changes);
    changes.sort_by(|a, b| a.path.cmp(&b.path));
    changes
}

fn diff_into(path: &str, before: &Value, after: &Value, changes: &mut Vec<AttributeChange>) {
    match (before, after) {
        (Value::Object(old), Value::Object(new)) => {
            for (key, old_value) in old {
                let key_path = join_path(path, key);
                match new.get(key) {
                    Some(new_value) => diff_into(&key_path, old_value, new_value, changes),
                    None => changes.push(AttributeChange::removed(key_path, old_value.clone())),
                }
            }
            for (key, new_value) in new {
                if !old.contains_key(key) {
                    changes.push(AttributeChange::added(join_path(path, key), new_value.clone()));
                }
            }
        },
        _ if before != after => {
            changes.push(AttributeChange::modified(path, before.clone(), after.clone()));
        },
        _ => {},
    }
}
