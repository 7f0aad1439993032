//! Typed metadata values for scan objects.
//!
//! Modules emit findings as `MetaValue`, a closed tagged variant. Conversion
//! to JSON is total: values with no native JSON form (raw bytes, non-finite
//! floats) are coerced to strings and the coercion is reported so the driver
//! can flag the owning module.

use base64::Engine as _;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// A metadata value as emitted by a module.
///
/// The variant set is closed on purpose: everything a module records must be
/// expressible here, which keeps result serialization total.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<MetaValue>),
    Map(FxHashMap<String, MetaValue>),
}

impl MetaValue {
    /// Convert to a JSON value. Returns the value plus whether any part of it
    /// had to be coerced to its string form.
    pub fn to_json(&self) -> (serde_json::Value, bool) {
        match self {
            MetaValue::Null => (serde_json::Value::Null, false),
            MetaValue::Bool(b) => (serde_json::Value::Bool(*b), false),
            MetaValue::Int(n) => (serde_json::Value::Number((*n).into()), false),
            MetaValue::Float(f) => match serde_json::Number::from_f64(*f) {
                Some(n) => (serde_json::Value::Number(n), false),
                // NaN / infinity have no JSON representation
                None => (serde_json::Value::String(f.to_string()), true),
            },
            MetaValue::String(s) => (serde_json::Value::String(s.clone()), false),
            MetaValue::Bytes(b) => {
                let encoded = base64::engine::general_purpose::STANDARD.encode(b);
                (serde_json::Value::String(encoded), true)
            }
            MetaValue::List(items) => {
                let mut coerced = false;
                let values = items
                    .iter()
                    .map(|item| {
                        let (v, c) = item.to_json();
                        coerced |= c;
                        v
                    })
                    .collect();
                (serde_json::Value::Array(values), coerced)
            }
            MetaValue::Map(entries) => {
                let mut coerced = false;
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    let (v, c) = value.to_json();
                    coerced |= c;
                    map.insert(key.clone(), v);
                }
                (serde_json::Value::Object(map), coerced)
            }
        }
    }

    /// Append `value` under list semantics: a scalar becomes a two-element
    /// list on the second write, an existing list grows.
    pub fn append(&mut self, value: MetaValue) {
        match self {
            MetaValue::List(items) => items.push(value),
            _ => {
                let previous = std::mem::replace(self, MetaValue::Null);
                *self = MetaValue::List(vec![previous, value]);
            }
        }
    }

    /// True if `value` already occurs in this value (scalar equality, or list
    /// membership when this is a list).
    pub fn contains(&self, value: &MetaValue) -> bool {
        match self {
            MetaValue::List(items) => items.contains(value),
            other => other == value,
        }
    }
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::String(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::String(s)
    }
}

impl From<i64> for MetaValue {
    fn from(n: i64) -> Self {
        MetaValue::Int(n)
    }
}

impl From<u64> for MetaValue {
    fn from(n: u64) -> Self {
        // Sizes and offsets fit i64 in practice; saturate rather than wrap.
        MetaValue::Int(i64::try_from(n).unwrap_or(i64::MAX))
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

impl From<Vec<String>> for MetaValue {
    fn from(items: Vec<String>) -> Self {
        MetaValue::List(items.into_iter().map(MetaValue::String).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_to_json() {
        assert_eq!(MetaValue::Int(42).to_json(), (serde_json::json!(42), false));
        assert_eq!(
            MetaValue::String("hi".into()).to_json(),
            (serde_json::json!("hi"), false)
        );
        assert_eq!(MetaValue::Null.to_json(), (serde_json::Value::Null, false));
    }

    #[test]
    fn test_bytes_coerce_to_base64() {
        let (value, coerced) = MetaValue::Bytes(vec![0xde, 0xad]).to_json();
        assert!(coerced);
        assert_eq!(value, serde_json::json!("3q0="));
    }

    #[test]
    fn test_nan_coerces_to_string() {
        let (value, coerced) = MetaValue::Float(f64::NAN).to_json();
        assert!(coerced);
        assert!(value.as_str().unwrap().contains("NaN"));
    }

    #[test]
    fn test_finite_float_stays_numeric() {
        let (value, coerced) = MetaValue::Float(2.5).to_json();
        assert!(!coerced);
        assert_eq!(value, serde_json::json!(2.5));
    }

    #[test]
    fn test_nested_coercion_propagates() {
        let value = MetaValue::Map(
            [(
                "payload".to_string(),
                MetaValue::List(vec![MetaValue::Int(1), MetaValue::Bytes(vec![0x00])]),
            )]
            .into_iter()
            .collect(),
        );
        let (_, coerced) = value.to_json();
        assert!(coerced);
    }

    #[test]
    fn test_append_promotes_scalar_to_list() {
        let mut value = MetaValue::String("first".into());
        value.append(MetaValue::String("second".into()));
        assert_eq!(
            value,
            MetaValue::List(vec![
                MetaValue::String("first".into()),
                MetaValue::String("second".into()),
            ])
        );
        value.append(MetaValue::Int(3));
        match &value {
            MetaValue::List(items) => assert_eq!(items.len(), 3),
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_contains() {
        let list = MetaValue::List(vec![MetaValue::Int(1), MetaValue::Int(2)]);
        assert!(list.contains(&MetaValue::Int(2)));
        assert!(!list.contains(&MetaValue::Int(3)));
        assert!(MetaValue::Bool(true).contains(&MetaValue::Bool(true)));
    }
}
