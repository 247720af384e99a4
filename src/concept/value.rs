use std::cmp::Ordering;

use serde::{Deserialize, Serialize};

/// Datatype declared on an attribute type.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Boolean,
    Long,
    Double,
    String,
}

impl DataType {
    pub fn name(self) -> &'static str {
        match self {
            DataType::Boolean => "boolean",
            DataType::Long => "long",
            DataType::Double => "double",
            DataType::String => "string",
        }
    }
}

/// Scalar value stored by an attribute instance. Tagged so the wire format
/// stays unambiguous across bindings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    Boolean(bool),
    Long(i64),
    Double(f64),
    String(String),
}

impl Value {
    pub fn datatype(&self) -> DataType {
        match self {
            Value::Boolean(_) => DataType::Boolean,
            Value::Long(_) => DataType::Long,
            Value::Double(_) => DataType::Double,
            Value::String(_) => DataType::String,
        }
    }

    /// Hashable identity of the value, used by the attribute-by-value index.
    /// Doubles are keyed by their bit pattern.
    pub fn key(&self) -> ValueKey {
        match self {
            Value::Boolean(b) => ValueKey::Boolean(*b),
            Value::Long(i) => ValueKey::Long(*i),
            Value::Double(d) => ValueKey::Double(d.to_bits()),
            Value::String(s) => ValueKey::String(s.clone()),
        }
    }

    /// Ordering used by comparator constraints. Longs and doubles compare
    /// numerically against each other; other cross-type comparisons are
    /// undefined.
    pub fn partial_cmp_value(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a.partial_cmp(b),
            (Value::Long(a), Value::Long(b)) => a.partial_cmp(b),
            (Value::Double(a), Value::Double(b)) => a.partial_cmp(b),
            (Value::Long(a), Value::Double(b)) => (*a as f64).partial_cmp(b),
            (Value::Double(a), Value::Long(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => a.partial_cmp(b),
            _ => None,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Long(i) => write!(f, "{i}"),
            Value::Double(d) => write!(f, "{d}"),
            Value::String(s) => write!(f, "'{s}'"),
        }
    }
}

/// Hashable projection of [`Value`] for index keys.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ValueKey {
    Boolean(bool),
    Long(i64),
    Double(u64),
    String(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_compare_across_types() {
        assert_eq!(
            Value::Long(3).partial_cmp_value(&Value::Double(3.5)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Double(10.0).partial_cmp_value(&Value::Long(2)),
            Some(Ordering::Greater)
        );
        assert_eq!(
            Value::String("a".into()).partial_cmp_value(&Value::Long(1)),
            None
        );
    }

    #[test]
    fn value_keys_distinguish_types() {
        assert_ne!(Value::Long(1).key(), Value::Double(1.0).key());
        assert_eq!(Value::Double(2.5).key(), Value::Double(2.5).key());
    }
}
