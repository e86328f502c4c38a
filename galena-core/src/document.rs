// galena-core/src/document.rs
// Documents are serde_json Values with ordered object maps. This module is
// the grab-bag of field-path helpers the write path leans on: dotted-path
// get/set, object id generation, size accounting, equality matching and the
// $set/$inc delta application used by fast updates.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use uuid::Uuid;

use crate::error::{GalenaError, Result};

/// Generate a fresh object identifier (hex, UUID v4 backed).
pub fn new_object_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Fetch a (possibly dotted) field path from a document.
pub fn get_path<'a>(doc: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return None;
    }
    let mut current = doc;
    for part in path.split('.') {
        match current {
            Value::Object(map) => {
                current = map.get(part)?;
            }
            Value::Array(arr) => {
                let idx: usize = part.parse().ok()?;
                current = arr.get(idx)?;
            }
            _ => return None,
        }
    }
    Some(current)
}

/// Set a (possibly dotted) field path, creating intermediate objects.
pub fn set_path(doc: &mut Value, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('.').collect();
    let mut current = doc;
    for part in &parts[..parts.len() - 1] {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        current = current
            .as_object_mut()
            .unwrap()
            .entry(part.to_string())
            .or_insert(Value::Object(Map::new()));
    }
    if !current.is_object() {
        *current = Value::Object(Map::new());
    }
    current
        .as_object_mut()
        .unwrap()
        .insert(parts[parts.len() - 1].to_string(), value);
}

/// Serialized size of a document, used for capped-collection accounting.
pub fn doc_size(doc: &Value) -> i64 {
    serde_json::to_string(doc).map(|s| s.len() as i64).unwrap_or(0)
}

/// Equality match with array-membership semantics: a stored array matches a
/// scalar query value when it contains it. This is what makes multikey
/// lookups behave ({a: [1, 2]} matches the query {a: 2}).
pub fn value_matches(stored: &Value, query: &Value) -> bool {
    if stored == query {
        return true;
    }
    if let Value::Array(elems) = stored {
        return elems.iter().any(|e| e == query);
    }
    false
}

/// True if every field of `query` equality-matches `doc`.
pub fn doc_matches(doc: &Value, query: &Value) -> bool {
    let Some(fields) = query.as_object() else {
        return false;
    };
    fields.iter().all(|(path, want)| {
        get_path(doc, path).map(|v| value_matches(v, want)).unwrap_or(want.is_null())
    })
}

/// The set of top-level-rooted dotted paths on which two documents differ.
/// Arrays are treated as leaves: any change inside one dirties the whole
/// path, which is the conservative answer the index-maintenance path needs.
pub fn changed_paths(old: &Value, new: &Value) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    diff_into(old, new, String::new(), &mut out);
    out
}

fn diff_into(old: &Value, new: &Value, prefix: String, out: &mut BTreeSet<String>) {
    match (old, new) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, va) in a {
                let path = join_path(&prefix, k);
                match b.get(k) {
                    Some(vb) => diff_into(va, vb, path, out),
                    None => {
                        out.insert(path);
                    }
                }
            }
            for k in b.keys() {
                if !a.contains_key(k) {
                    out.insert(join_path(&prefix, k));
                }
            }
        }
        (a, b) => {
            if a != b && !prefix.is_empty() {
                out.insert(prefix);
            }
        }
    }
}

fn join_path(prefix: &str, field: &str) -> String {
    if prefix.is_empty() {
        field.to_string()
    } else {
        format!("{}.{}", prefix, field)
    }
}

/// Apply a delta operator stream ({"$set": {...}, "$inc": {...}}) to a
/// document in place. Unknown operators are rejected; fast updates only
/// carry these two.
pub fn apply_mods(doc: &mut Value, mods: &Value) -> Result<()> {
    let Some(ops) = mods.as_object() else {
        return Err(GalenaError::InvalidOptions(
            "update mods must be an object".to_string(),
        ));
    };
    for (op, args) in ops {
        let Some(fields) = args.as_object() else {
            return Err(GalenaError::InvalidOptions(format!(
                "{} takes an object of field updates",
                op
            )));
        };
        match op.as_str() {
            "$set" => {
                for (path, value) in fields {
                    set_path(doc, path, value.clone());
                }
            }
            "$inc" => {
                for (path, delta) in fields {
                    let delta = delta.as_f64().ok_or_else(|| {
                        GalenaError::InvalidOptions(format!("$inc on {} is not numeric", path))
                    })?;
                    let current = get_path(doc, path).and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let next = current + delta;
                    let value = if next.fract() == 0.0 && next.abs() < (i64::MAX as f64) {
                        Value::from(next as i64)
                    } else {
                        Value::from(next)
                    };
                    set_path(doc, path, value);
                }
            }
            other => {
                return Err(GalenaError::OperationNotAllowed(format!(
                    "unsupported update operator {}",
                    other
                )));
            }
        }
    }
    Ok(())
}

/// Validate one primary key component. Array- and object-valued fields can
/// not be primary keys, and neither can missing fields.
pub fn validate_pk_component(field: &str, value: Option<&Value>) -> Result<Value> {
    match value {
        None => Err(GalenaError::InvalidPKField {
            field: field.to_string(),
            reason: "missing from document".to_string(),
        }),
        Some(Value::Array(_)) => Err(GalenaError::InvalidPKField {
            field: field.to_string(),
            reason: "array values cannot be part of a primary key".to_string(),
        }),
        Some(Value::Object(_)) => Err(GalenaError::InvalidPKField {
            field: field.to_string(),
            reason: "object values cannot be part of a primary key".to_string(),
        }),
        Some(v) => Ok(v.clone()),
    }
}
