//! Attribute key/value types shared by spans, metric points and log records.
//!
//! Keys and values are the `opentelemetry` API types; [`AttributeSet`] adds
//! the order-insensitive identity metric accumulators are keyed by.

pub use opentelemetry::{Key, KeyValue, Value};

use std::hash::{Hash, Hasher};

/// An order-insensitive set of attributes used to key metric accumulators.
///
/// Entries are sorted by key; when a key appears more than once the last
/// value wins. Float values compare by bit pattern so that equality agrees
/// with hashing.
#[derive(Debug, Clone, Default)]
pub struct AttributeSet(Vec<KeyValue>);

impl AttributeSet {
    /// Creates an empty attribute set.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the attributes in key order.
    pub fn iter(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter()
    }

    /// Looks up the value for `key`.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0
            .binary_search_by(|kv| kv.key.as_str().cmp(key))
            .ok()
            .map(|idx| &self.0[idx].value)
    }

    /// Returns the number of attributes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns whether the set has no attributes.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

fn value_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::F64(a), Value::F64(b)) => a.to_bits() == b.to_bits(),
        _ => a == b,
    }
}

impl PartialEq for AttributeSet {
    fn eq(&self, other: &Self) -> bool {
        self.0.len() == other.0.len()
            && self
                .0
                .iter()
                .zip(&other.0)
                .all(|(a, b)| a.key == b.key && value_eq(&a.value, &b.value))
    }
}

impl Eq for AttributeSet {}

impl Hash for AttributeSet {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.len().hash(state);
        for kv in &self.0 {
            kv.hash(state);
        }
    }
}

impl From<&[KeyValue]> for AttributeSet {
    fn from(attributes: &[KeyValue]) -> Self {
        let mut entries: Vec<KeyValue> = Vec::with_capacity(attributes.len());
        for kv in attributes {
            match entries.iter_mut().find(|existing| existing.key == kv.key) {
                Some(existing) => existing.value = kv.value.clone(),
                None => entries.push(kv.clone()),
            }
        }
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        Self(entries)
    }
}

impl<const N: usize> From<[KeyValue; N]> for AttributeSet {
    fn from(attributes: [KeyValue; N]) -> Self {
        Self::from(&attributes[..])
    }
}
