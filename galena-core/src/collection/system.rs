// galena-core/src/collection/system.rs
// System-namespace helpers: catalog insert normalization and the extended
// system.users index.

use serde_json::{json, Map, Value};

/// Key pattern every system.users collection carries so user lookups by
/// (user, userSource) stay indexed.
pub fn extended_system_users_key_pattern() -> Value {
    json!({"user": 1, "userSource": 1})
}

pub fn extended_system_users_index_name() -> String {
    "user_1_userSource_1".to_string()
}

/// The pre-extension pattern. Collections reopened from older metadata may
/// carry only this one; that state is tolerated (with a warning) rather
/// than repaired in place.
pub fn old_system_users_key_pattern() -> Value {
    json!({"user": 1})
}

pub fn extended_system_users_index_info(ns: &str) -> Value {
    json!({
        "key": extended_system_users_key_pattern(),
        "unique": true,
        "ns": ns,
        "name": extended_system_users_index_name(),
    })
}

pub fn is_system_users_collection(ns: &str) -> bool {
    ns.ends_with(".system.users")
}

pub fn is_profile_collection(ns: &str) -> bool {
    ns.ends_with(".system.profile")
}

pub fn is_system_catalog_collection(ns: &str) -> bool {
    ns.ends_with(".system.indexes") || ns.ends_with(".system.namespaces")
}

pub fn is_oplog_collection(ns: &str) -> bool {
    ns.starts_with("local.oplog.")
}

/// True if a client may write this ".system." namespace directly.
pub fn legal_client_system_ns(ns: &str) -> bool {
    is_system_users_collection(ns) || ns.ends_with(".system.js")
}

/// Catalog rows keep a fixed leading field order, with the _id stripped:
/// { key, unique, ns, name, [everything else] }.
pub(crate) fn beautify(obj: &Value) -> Value {
    let Some(fields) = obj.as_object() else {
        return obj.clone();
    };
    let mut out = Map::new();
    for lead in ["key", "unique", "ns", "name"] {
        if let Some(v) = fields.get(lead) {
            out.insert(lead.to_string(), v.clone());
        }
    }
    for (k, v) in fields {
        if k == "_id" || out.contains_key(k) {
            continue;
        }
        out.insert(k.clone(), v.clone());
    }
    Value::Object(out)
}
