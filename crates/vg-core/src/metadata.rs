use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Maximum nesting depth accepted for event metadata.
pub const MAX_DEPTH: usize = 8;
/// Maximum total size (approximate serialized bytes) accepted for event
/// metadata.
pub const MAX_BYTES: usize = 10 * 1024;

// ---------------------------------------------------------------------------
// MetadataValue
// ---------------------------------------------------------------------------

/// A bounded string/number/bool tree carried on each occurrence.
///
/// Arbitrary client JSON is converted through [`MetadataMap::sanitize`],
/// which enforces [`MAX_DEPTH`] and [`MAX_BYTES`]; nulls are dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Number(f64),
    String(String),
    List(Vec<MetadataValue>),
    Map(BTreeMap<String, MetadataValue>),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata exceeds maximum depth of {MAX_DEPTH}")]
    TooDeep,
    #[error("metadata exceeds maximum size of {MAX_BYTES} bytes")]
    TooLarge,
    #[error("metadata root must be an object")]
    NotAnObject,
}

// ---------------------------------------------------------------------------
// MetadataMap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MetadataMap(pub BTreeMap<String, MetadataValue>);

impl MetadataMap {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Convert client-supplied JSON into a bounded metadata tree.
    ///
    /// Nulls are dropped. Depth beyond [`MAX_DEPTH`] or accumulated size
    /// beyond [`MAX_BYTES`] rejects the whole payload.
    pub fn sanitize(raw: &serde_json::Value) -> Result<Self, MetadataError> {
        let obj = raw.as_object().ok_or(MetadataError::NotAnObject)?;
        let mut budget = MAX_BYTES;
        let mut out = BTreeMap::new();
        for (key, value) in obj {
            charge(&mut budget, key.len())?;
            if let Some(converted) = convert(value, 1, &mut budget)? {
                out.insert(key.clone(), converted);
            }
        }
        Ok(Self(out))
    }

    /// Visit every string leaf mutably, without recursion.
    pub fn for_each_string_mut(&mut self, mut visit: impl FnMut(&mut String)) {
        let mut stack: Vec<&mut MetadataValue> = self.0.values_mut().collect();
        while let Some(value) = stack.pop() {
            match value {
                MetadataValue::String(s) => visit(s),
                MetadataValue::List(items) => stack.extend(items.iter_mut()),
                MetadataValue::Map(map) => stack.extend(map.values_mut()),
                MetadataValue::Bool(_) | MetadataValue::Number(_) => {}
            }
        }
    }

    /// Read-only string-leaf lookup by top-level key.
    pub fn get_str(&self, key: &str) -> Option<&str> {
        match self.0.get(key) {
            Some(MetadataValue::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }
}

fn charge(budget: &mut usize, cost: usize) -> Result<(), MetadataError> {
    if cost > *budget {
        return Err(MetadataError::TooLarge);
    }
    *budget -= cost;
    Ok(())
}

// Depth is capped at MAX_DEPTH, so the recursion here is bounded.
fn convert(
    value: &serde_json::Value,
    depth: usize,
    budget: &mut usize,
) -> Result<Option<MetadataValue>, MetadataError> {
    if depth > MAX_DEPTH {
        return Err(MetadataError::TooDeep);
    }
    match value {
        serde_json::Value::Null => Ok(None),
        serde_json::Value::Bool(b) => {
            charge(budget, 1)?;
            Ok(Some(MetadataValue::Bool(*b)))
        }
        serde_json::Value::Number(n) => {
            charge(budget, 8)?;
            Ok(Some(MetadataValue::Number(n.as_f64().unwrap_or(0.0))))
        }
        serde_json::Value::String(s) => {
            charge(budget, s.len())?;
            Ok(Some(MetadataValue::String(s.clone())))
        }
        serde_json::Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                if let Some(converted) = convert(item, depth + 1, budget)? {
                    out.push(converted);
                }
            }
            Ok(Some(MetadataValue::List(out)))
        }
        serde_json::Value::Object(map) => {
            let mut out = BTreeMap::new();
            for (key, item) in map {
                charge(budget, key.len())?;
                if let Some(converted) = convert(item, depth + 1, budget)? {
                    out.insert(key.clone(), converted);
                }
            }
            Ok(Some(MetadataValue::Map(out)))
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
