// galena-core/src/key.rs
// Typed keys for the ordered dictionaries. Every index stores its entries
// under an IndexKey; the Ord impl defines the on-"disk" ordering, so it must
// be total and stable. Bytes is ordered bytewise, which is what lets a
// big-endian GTID encoding double as an oplog primary key.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single typed key component, or a compound of them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrderedFloat),
    String(String),
    Bytes(Vec<u8>),
    /// Compound key, e.g. a secondary entry [field keys..., pk].
    Compound(Vec<IndexKey>),
}

/// f64 wrapper with a total order so keys can live in ordered maps.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OrderedFloat(pub f64);

impl PartialEq for OrderedFloat {
    fn eq(&self, other: &Self) -> bool {
        self.0.to_bits() == other.0.to_bits()
    }
}

impl Eq for OrderedFloat {}

impl std::hash::Hash for OrderedFloat {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.to_bits().hash(state);
    }
}

impl PartialOrd for OrderedFloat {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedFloat {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match (self.0.is_nan(), other.0.is_nan()) {
            (true, true) => std::cmp::Ordering::Equal,
            (true, false) => std::cmp::Ordering::Greater,
            (false, true) => std::cmp::Ordering::Less,
            (false, false) => self
                .0
                .partial_cmp(&other.0)
                .unwrap_or(std::cmp::Ordering::Equal),
        }
    }
}

impl PartialOrd for IndexKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for IndexKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use IndexKey::*;
        match (self, other) {
            (Null, Null) => std::cmp::Ordering::Equal,
            (Null, _) => std::cmp::Ordering::Less,
            (_, Null) => std::cmp::Ordering::Greater,

            (Bool(a), Bool(b)) => a.cmp(b),
            (Bool(_), _) => std::cmp::Ordering::Less,
            (_, Bool(_)) => std::cmp::Ordering::Greater,

            (Int(a), Int(b)) => a.cmp(b),
            (Int(_), _) => std::cmp::Ordering::Less,
            (_, Int(_)) => std::cmp::Ordering::Greater,

            (Float(a), Float(b)) => a.cmp(b),
            (Float(_), _) => std::cmp::Ordering::Less,
            (_, Float(_)) => std::cmp::Ordering::Greater,

            (String(a), String(b)) => a.cmp(b),
            (String(_), _) => std::cmp::Ordering::Less,
            (_, String(_)) => std::cmp::Ordering::Greater,

            (Bytes(a), Bytes(b)) => a.cmp(b),
            (Bytes(_), _) => std::cmp::Ordering::Less,
            (_, Bytes(_)) => std::cmp::Ordering::Greater,

            // Compound keys compare element by element, shorter-is-less on a
            // shared prefix. This makes Compound([k]) a lower bound for every
            // Compound([k, ...]) extension, which the prefix probes rely on.
            (Compound(a), Compound(b)) => a.cmp(b),
        }
    }
}

impl From<&Value> for IndexKey {
    fn from(value: &Value) -> Self {
        match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    IndexKey::Int(i)
                } else if let Some(f) = n.as_f64() {
                    IndexKey::Float(OrderedFloat(f))
                } else {
                    IndexKey::Null
                }
            }
            Value::String(s) => IndexKey::String(s.clone()),
            // Arrays are expanded by the caller (multikey); objects do not
            // make index keys.
            _ => IndexKey::Null,
        }
    }
}

impl IndexKey {
    /// Flatten this key's components into `out`. A compound contributes its
    /// elements, everything else contributes itself.
    pub fn flatten_into(&self, out: &mut Vec<IndexKey>) {
        match self {
            IndexKey::Compound(parts) => out.extend(parts.iter().cloned()),
            other => out.push(other.clone()),
        }
    }

    /// Build a dictionary entry key for a secondary index: the generated
    /// field key(s) followed by the primary key.
    pub fn with_pk(&self, pk: &IndexKey) -> IndexKey {
        let mut parts = Vec::new();
        self.flatten_into(&mut parts);
        parts.push(pk.clone());
        IndexKey::Compound(parts)
    }

    /// True if `self` is a compound entry whose leading components equal the
    /// (flattened) components of `prefix`.
    pub fn starts_with(&self, prefix: &IndexKey) -> bool {
        let mut want = Vec::new();
        prefix.flatten_into(&mut want);
        match self {
            IndexKey::Compound(parts) => {
                parts.len() >= want.len() && parts[..want.len()] == want[..]
            }
            _ => false,
        }
    }

    /// Render for error messages. Keys can contain user data, so this stays
    /// terse.
    pub fn display(&self) -> String {
        match self {
            IndexKey::Null => "null".to_string(),
            IndexKey::Bool(b) => b.to_string(),
            IndexKey::Int(i) => i.to_string(),
            IndexKey::Float(f) => f.0.to_string(),
            IndexKey::String(s) => format!("\"{}\"", s),
            IndexKey::Bytes(b) => format!("0x{}", hex(b)),
            IndexKey::Compound(parts) => {
                let inner: Vec<String> = parts.iter().map(|p| p.display()).collect();
                format!("({})", inner.join(", "))
            }
        }
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}
