//! Field values carried by DNA

use crate::id::ObjectId;
use serde::{Deserialize, Serialize};
use std::hash::{Hash, Hasher};

/// A single field or collection element value.
///
/// Literals are copied by value; `Ref` points at another shared object.
/// Equality and hashing are total: floats compare by bit pattern, so
/// values can key logical maps.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Absent value / null reference
    Null,
    /// Boolean literal
    Bool(bool),
    /// Integer literal
    Int(i64),
    /// Floating point literal
    Float(f64),
    /// String literal
    Str(String),
    /// Raw bytes
    Bytes(Vec<u8>),
    /// Reference to another shared object
    Ref(ObjectId),
    /// Literal collection, elements may themselves be references
    List(Vec<Value>),
}

impl Value {
    /// Referenced id if this is a non-null reference.
    pub fn as_ref_id(&self) -> Option<ObjectId> {
        match self {
            Value::Ref(id) if !id.is_null() => Some(*id),
            _ => None,
        }
    }

    /// Integer payload.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// String payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    /// Whether this is `Null`.
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Push every non-null referenced id, including those nested in lists.
    pub fn collect_references(&self, out: &mut impl Extend<ObjectId>) {
        match self {
            Value::Ref(id) if !id.is_null() => out.extend(std::iter::once(*id)),
            Value::List(items) => {
                for item in items {
                    item.collect_references(out);
                }
            }
            _ => {}
        }
    }

    fn discriminant(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Int(_) => 2,
            Value::Float(_) => 3,
            Value::Str(_) => 4,
            Value::Bytes(_) => 5,
            Value::Ref(_) => 6,
            Value::List(_) => 7,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a.to_bits() == b.to_bits(),
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Bytes(a), Value::Bytes(b)) => a == b,
            (Value::Ref(a), Value::Ref(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.discriminant().hash(state);
        match self {
            Value::Null => {}
            Value::Bool(v) => v.hash(state),
            Value::Int(v) => v.hash(state),
            Value::Float(v) => v.to_bits().hash(state),
            Value::Str(v) => v.hash(state),
            Value::Bytes(v) => v.hash(state),
            Value::Ref(v) => v.hash(state),
            Value::List(v) => v.hash(state),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<ObjectId> for Value {
    fn from(id: ObjectId) -> Self {
        if id.is_null() {
            Value::Null
        } else {
            Value::Ref(id)
        }
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_float_total_equality() {
        assert_eq!(Value::Float(f64::NAN), Value::Float(f64::NAN));
        assert_ne!(Value::Float(0.0), Value::Float(-0.0));

        let mut set = FxHashSet::default();
        set.insert(Value::Float(f64::NAN));
        assert!(set.contains(&Value::Float(f64::NAN)));
    }

    #[test]
    fn test_nested_references() {
        let value = Value::List(vec![
            Value::Int(1),
            Value::Ref(ObjectId::new(4)),
            Value::List(vec![Value::Ref(ObjectId::new(9)), Value::Null]),
        ]);
        let mut refs = Vec::new();
        value.collect_references(&mut refs);
        assert_eq!(refs, vec![ObjectId::new(4), ObjectId::new(9)]);
    }

    #[test]
    fn test_null_id_converts_to_null() {
        assert!(Value::from(crate::NULL_OBJECT_ID).is_null());
        assert_eq!(Value::from(ObjectId::new(3)).as_ref_id(), Some(ObjectId::new(3)));
    }
}
