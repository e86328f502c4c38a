// galena-core/src/index_details.rs
// One IndexDetails per index. It owns the dictionary handle, knows how to
// derive entry keys from a document (including multikey expansion over
// array fields), and carries the flags parsed out of its info document.

use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;

use crate::document::get_path;
use crate::error::{GalenaError, Result};
use crate::key::IndexKey;
use crate::storage::{Dictionary, DictionaryEngine};

pub struct IndexDetails {
    info: Value,
    fields: Vec<(String, i64)>,
    unique: bool,
    sparse: bool,
    clustering: bool,
    background: bool,
    dict: Arc<dyn Dictionary>,
}

/// Conventional index name for a key pattern: "a_1_b_-1".
pub fn name_for_pattern(pattern: &Value) -> String {
    let Some(fields) = pattern.as_object() else {
        return "invalid".to_string();
    };
    fields
        .iter()
        .map(|(path, dir)| format!("{}_{}", path, dir.as_i64().unwrap_or(1)))
        .collect::<Vec<_>>()
        .join("_")
}

/// Normalize an index spec into the canonical info-document field order:
/// { key, unique, ns, name, ... } with a derived name when absent.
pub fn normalize_info(ns: &str, info: &Value) -> Result<Value> {
    let Some(obj) = info.as_object() else {
        return Err(GalenaError::InvalidOptions(
            "index spec must be an object".to_string(),
        ));
    };
    let key = obj
        .get("key")
        .and_then(|k| k.as_object())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| {
            GalenaError::InvalidOptions("index spec needs a non-empty key pattern".to_string())
        })?;
    if let Some(spec_ns) = obj.get("ns").and_then(|n| n.as_str()) {
        if spec_ns != ns {
            return Err(GalenaError::InvalidOptions(format!(
                "index spec ns {} does not match collection {}",
                spec_ns, ns
            )));
        }
    }
    let name = match obj.get("name").and_then(|n| n.as_str()) {
        Some(n) => n.to_string(),
        None => name_for_pattern(&Value::Object(key.clone())),
    };

    let mut out = Map::new();
    out.insert("key".to_string(), Value::Object(key.clone()));
    if let Some(unique) = obj.get("unique") {
        out.insert("unique".to_string(), unique.clone());
    }
    out.insert("ns".to_string(), Value::String(ns.to_string()));
    out.insert("name".to_string(), Value::String(name));
    for (field, value) in obj {
        if !matches!(field.as_str(), "key" | "unique" | "ns" | "name") {
            out.insert(field.clone(), value.clone());
        }
    }
    Ok(Value::Object(out))
}

impl IndexDetails {
    /// Open the index described by a (normalized) info document, creating
    /// its dictionary if needed.
    pub fn open(engine: &Arc<dyn DictionaryEngine>, info: Value) -> Result<Arc<IndexDetails>> {
        let obj = info
            .as_object()
            .ok_or_else(|| GalenaError::InvalidOptions("index info must be an object".into()))?;
        let ns = obj
            .get("ns")
            .and_then(|n| n.as_str())
            .ok_or_else(|| GalenaError::InvalidOptions("index info missing ns".into()))?;
        let name = obj
            .get("name")
            .and_then(|n| n.as_str())
            .ok_or_else(|| GalenaError::InvalidOptions("index info missing name".into()))?;
        let key = obj
            .get("key")
            .and_then(|k| k.as_object())
            .ok_or_else(|| GalenaError::InvalidOptions("index info missing key".into()))?;

        let mut fields = Vec::with_capacity(key.len());
        for (path, dir) in key {
            let dir = dir.as_i64().unwrap_or(1);
            if dir != 1 && dir != -1 {
                return Err(GalenaError::InvalidOptions(format!(
                    "bad sort direction {} for {}",
                    dir, path
                )));
            }
            fields.push((path.clone(), dir));
        }

        let flag = |f: &str| obj.get(f).and_then(|v| v.as_bool()).unwrap_or(false);
        let dict = engine.open_dictionary(&format!("{}.${}", ns, name))?;
        Ok(Arc::new(IndexDetails {
            unique: flag("unique"),
            sparse: flag("sparse"),
            clustering: flag("clustering"),
            background: flag("background"),
            fields,
            dict,
            info,
        }))
    }

    pub fn info(&self) -> &Value {
        &self.info
    }

    pub fn name(&self) -> &str {
        self.info["name"].as_str().unwrap_or("")
    }

    pub fn key_pattern(&self) -> &Value {
        &self.info["key"]
    }

    pub fn is_id_index(&self) -> bool {
        self.key_pattern() == &json!({"_id": 1})
    }

    pub fn is_unique(&self) -> bool {
        self.unique
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse
    }

    pub fn is_clustering(&self) -> bool {
        self.clustering
    }

    pub fn is_background(&self) -> bool {
        self.background
    }

    pub fn field_paths(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|(path, _)| path.as_str())
    }

    pub fn dict(&self) -> &Arc<dyn Dictionary> {
        &self.dict
    }

    /// Derive this index's keys for a document. More than one key means the
    /// document made the index multikey. Sparse indexes produce no keys for
    /// documents missing every indexed field.
    pub fn generate_keys(&self, obj: &Value) -> Result<Vec<IndexKey>> {
        let mut per_field: Vec<Vec<IndexKey>> = Vec::with_capacity(self.fields.len());
        let mut expanded_field: Option<&str> = None;
        let mut all_missing = true;

        for (path, _dir) in &self.fields {
            match get_path(obj, path) {
                Some(Value::Array(elems)) => {
                    if let Some(first) = expanded_field {
                        return Err(GalenaError::OperationNotAllowed(format!(
                            "cannot index parallel arrays ({} and {})",
                            first, path
                        )));
                    }
                    expanded_field = Some(path);
                    all_missing = false;
                    if elems.is_empty() {
                        per_field.push(vec![IndexKey::Null]);
                    } else {
                        // Dedup repeated elements; one entry per distinct key.
                        let keys: BTreeSet<IndexKey> =
                            elems.iter().map(IndexKey::from).collect();
                        per_field.push(keys.into_iter().collect());
                    }
                }
                Some(value) => {
                    all_missing = false;
                    per_field.push(vec![IndexKey::from(value)]);
                }
                None => {
                    per_field.push(vec![IndexKey::Null]);
                }
            }
        }

        if self.sparse && all_missing {
            return Ok(Vec::new());
        }

        if self.fields.len() == 1 {
            return Ok(per_field.into_iter().next().unwrap());
        }

        // Compound: at most one field was expanded, so the product is just
        // that field's keys spliced into an otherwise fixed tuple.
        let mut keys = Vec::new();
        let expanded_at = per_field.iter().position(|k| k.len() > 1).unwrap_or(0);
        for variant in &per_field[expanded_at] {
            let parts: Vec<IndexKey> = per_field
                .iter()
                .enumerate()
                .map(|(i, candidates)| {
                    if i == expanded_at {
                        variant.clone()
                    } else {
                        candidates[0].clone()
                    }
                })
                .collect();
            keys.push(IndexKey::Compound(parts));
        }
        Ok(keys)
    }

    /// For a unique index: is there already an entry for this secondary key
    /// (under any primary key)?
    pub fn prefix_exists(&self, secondary: &IndexKey) -> Result<bool> {
        let mut parts = Vec::new();
        secondary.flatten_into(&mut parts);
        let lower = IndexKey::Compound(parts);
        match self.dict.successor(&lower)? {
            Some(next) => Ok(next.starts_with(secondary)),
            None => Ok(false),
        }
    }
}

/// The set of field paths covered by any index, used to decide quickly
/// whether an update touches indexed fields.
#[derive(Debug, Default, Clone)]
pub struct IndexPathSet {
    paths: BTreeSet<String>,
}

impl IndexPathSet {
    pub fn clear(&mut self) {
        self.paths.clear();
    }

    pub fn add_pattern(&mut self, pattern: &Value) {
        if let Some(fields) = pattern.as_object() {
            for path in fields.keys() {
                self.paths.insert(path.clone());
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    /// True if any changed path could affect an indexed path. A path
    /// affects an indexed one when either is a dotted prefix of the other.
    pub fn affected_by(&self, changed: &BTreeSet<String>) -> bool {
        changed.iter().any(|c| {
            self.paths.iter().any(|p| {
                p == c
                    || c.starts_with(&format!("{}.", p))
                    || p.starts_with(&format!("{}.", c))
            })
        })
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}
