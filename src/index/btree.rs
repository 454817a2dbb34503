//! BTreeMap-based index structures
//!
//! Each index is a `BTreeMap<IndexKey, BTreeSet<DocumentPath>>`: the key is
//! the tuple of extracted field values in index-field order, so equality
//! prefixes and range bounds become contiguous ordered scans.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::storage::DocumentPath;

use super::definition::Direction;

/// One indexed field value.
///
/// Ordering across kinds is deterministic: Null < Bool < Number < String.
/// All JSON numbers share one kind, compared as `f64`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum KeyValue {
    Null,
    /// false < true
    Bool(bool),
    /// f64 bits remapped for total ordering
    Number(u64),
    String(String),
}

impl KeyValue {
    pub fn from_float(v: f64) -> Self {
        // -0.0 and 0.0 must share a key
        let v = if v == 0.0 { 0.0 } else { v };
        let bits = v.to_bits();
        let ordered = if (bits >> 63) == 1 {
            !bits
        } else {
            bits ^ (1 << 63)
        };
        KeyValue::Number(ordered)
    }

    /// Arrays and objects are not indexable.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Null => Some(KeyValue::Null),
            Value::Bool(b) => Some(KeyValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(KeyValue::from_float),
            Value::String(s) => Some(KeyValue::String(s.clone())),
            Value::Array(_) | Value::Object(_) => None,
        }
    }

    /// Whether two values can be compared by a range operator.
    pub fn same_kind(&self, other: &KeyValue) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

/// A value placed in an index position with its direction.
///
/// Descending parts sort in reverse, so one forward scan of the tree yields
/// the declared order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyPart {
    pub value: KeyValue,
    pub direction: Direction,
}

impl KeyPart {
    pub fn new(value: KeyValue, direction: Direction) -> Self {
        Self { value, direction }
    }
}

impl Ord for KeyPart {
    fn cmp(&self, other: &Self) -> Ordering {
        let ord = self.value.cmp(&other.value);
        match self.direction {
            Direction::Asc => ord,
            Direction::Desc => ord.reverse(),
        }
    }
}

impl PartialOrd for KeyPart {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Composite key: one part per index field.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct IndexKey(pub Vec<KeyPart>);

impl IndexKey {
    pub fn parts(&self) -> &[KeyPart] {
        &self.0
    }

    pub fn starts_with(&self, prefix: &[KeyPart]) -> bool {
        self.0.starts_with(prefix)
    }
}

/// One compound index's entries.
#[derive(Debug, Default)]
pub struct IndexTree {
    tree: BTreeMap<IndexKey, BTreeSet<DocumentPath>>,
}

impl IndexTree {
    pub fn new() -> Self {
        Self {
            tree: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, key: IndexKey, path: DocumentPath) {
        self.tree.entry(key).or_default().insert(path);
    }

    /// Remove a path from a key, dropping the key once empty.
    pub fn remove(&mut self, key: &IndexKey, path: &DocumentPath) {
        if let Some(paths) = self.tree.get_mut(key) {
            paths.remove(path);
            if paths.is_empty() {
                self.tree.remove(key);
            }
        }
    }

    /// Ordered scan of every entry whose key starts with `prefix`.
    ///
    /// `lower` and `upper` bound the part immediately after the prefix, in
    /// key order (already reversed for descending fields). Both bounds are
    /// inclusive; callers re-check strict operators.
    pub fn scan(
        &self,
        prefix: Vec<KeyPart>,
        lower: Option<KeyPart>,
        upper: Option<KeyPart>,
    ) -> impl Iterator<Item = (&IndexKey, &DocumentPath)> + '_ {
        let depth = prefix.len();
        let mut start = prefix.clone();
        start.extend(lower);

        self.tree
            .range(IndexKey(start)..)
            .take_while(move |(key, _)| {
                key.starts_with(&prefix)
                    && match (&upper, key.0.get(depth)) {
                        (Some(upper), Some(part)) => part <= upper,
                        _ => true,
                    }
            })
            .flat_map(|(key, paths)| paths.iter().map(move |path| (key, path)))
    }

    /// Number of distinct keys
    pub fn key_count(&self) -> usize {
        self.tree.len()
    }

    /// Number of indexed documents
    pub fn entry_count(&self) -> usize {
        self.tree.values().map(|paths| paths.len()).sum()
    }
}
