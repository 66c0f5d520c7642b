//! DNA: the serialized state or delta of a shared object
//!
//! A DNA record is an ordered list of actions. Physical actions assign a
//! named field; logical actions replay a collection operation (map put,
//! list add, ...) instead of diffing the collection field by field.
//! Applying the DNA produced by dehydrating a state must reproduce that
//! exact state.

use crate::id::ObjectId;
use crate::value::Value;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};

/// Whether a DNA record describes a new object or a change to an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnaKind {
    /// Complete state of a newly created object
    New,
    /// Delta applied on top of the current state
    Delta,
}

/// A replayable collection operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogicalOp {
    /// Insert or overwrite a map entry
    MapPut {
        /// Entry key
        key: Value,
        /// Entry value
        value: Value,
    },
    /// Remove a map entry
    MapRemove {
        /// Entry key
        key: Value,
    },
    /// Remove every map entry
    MapClear,
    /// Append a list element
    ListAdd(Value),
    /// Overwrite the element at `index`
    ListSet {
        /// Element position
        index: usize,
        /// New element
        value: Value,
    },
    /// Remove the element at `index`
    ListRemoveAt(usize),
    /// Remove every list element
    ListClear,
}

impl LogicalOp {
    /// Whether this op targets a map-shaped object.
    pub fn is_map_op(&self) -> bool {
        matches!(
            self,
            LogicalOp::MapPut { .. } | LogicalOp::MapRemove { .. } | LogicalOp::MapClear
        )
    }

    /// Map key touched by this op, if any.
    pub fn map_key(&self) -> Option<&Value> {
        match self {
            LogicalOp::MapPut { key, .. } | LogicalOp::MapRemove { key } => Some(key),
            _ => None,
        }
    }

    /// Push every id referenced by the op's operands.
    pub fn collect_references(&self, out: &mut impl Extend<ObjectId>) {
        match self {
            LogicalOp::MapPut { key, value } => {
                key.collect_references(out);
                value.collect_references(out);
            }
            LogicalOp::MapRemove { key } => key.collect_references(out),
            LogicalOp::ListAdd(value) | LogicalOp::ListSet { value, .. } => {
                value.collect_references(out)
            }
            LogicalOp::MapClear | LogicalOp::ListRemoveAt(_) | LogicalOp::ListClear => {}
        }
    }
}

/// One DNA entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DnaAction {
    /// Assign a field
    Physical {
        /// Field name (array slots use their decimal index)
        field: String,
        /// New value
        value: Value,
    },
    /// Replay a collection operation
    Logical(LogicalOp),
}

/// Serialized state or delta of one object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dna {
    /// Object the record describes
    pub id: ObjectId,
    /// Class descriptor used to reconstruct the object
    pub class_name: String,
    /// New object or delta
    pub kind: DnaKind,
    /// Version of the state this record was produced from
    pub version: u64,
    /// Ordered actions
    pub actions: Vec<DnaAction>,
}

impl Dna {
    /// DNA describing a brand new object.
    pub fn new_object(id: ObjectId, class_name: impl Into<String>) -> Self {
        Self {
            id,
            class_name: class_name.into(),
            kind: DnaKind::New,
            version: 0,
            actions: Vec::new(),
        }
    }

    /// DNA describing a change to an existing object.
    pub fn delta(id: ObjectId, class_name: impl Into<String>) -> Self {
        Self {
            id,
            class_name: class_name.into(),
            kind: DnaKind::Delta,
            version: 0,
            actions: Vec::new(),
        }
    }

    /// Builder: set the version stamp.
    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Builder: append a physical field assignment.
    pub fn with_field(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.actions.push(DnaAction::Physical {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Builder: append a logical op.
    pub fn with_logical(mut self, op: LogicalOp) -> Self {
        self.actions.push(DnaAction::Logical(op));
        self
    }

    /// Whether this is a delta.
    pub fn is_delta(&self) -> bool {
        self.kind == DnaKind::Delta
    }

    /// Whether any action is logical.
    pub fn has_logical_actions(&self) -> bool {
        self.actions
            .iter()
            .any(|a| matches!(a, DnaAction::Logical(_)))
    }

    /// Last value assigned to `field`, if any.
    pub fn field(&self, field: &str) -> Option<&Value> {
        self.actions.iter().rev().find_map(|action| match action {
            DnaAction::Physical { field: f, value } if f == field => Some(value),
            _ => None,
        })
    }

    /// Iterate physical assignments in order.
    pub fn physical_fields(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.actions.iter().filter_map(|action| match action {
            DnaAction::Physical { field, value } => Some((field.as_str(), value)),
            DnaAction::Logical(_) => None,
        })
    }

    /// Iterate logical ops in order.
    pub fn logical_ops(&self) -> impl Iterator<Item = &LogicalOp> {
        self.actions.iter().filter_map(|action| match action {
            DnaAction::Logical(op) => Some(op),
            DnaAction::Physical { .. } => None,
        })
    }

    /// Every distinct id referenced by any action.
    pub fn references(&self) -> FxHashSet<ObjectId> {
        let mut refs = FxHashSet::default();
        for action in &self.actions {
            match action {
                DnaAction::Physical { value, .. } => value.collect_references(&mut refs),
                DnaAction::Logical(op) => op.collect_references(&mut refs),
            }
        }
        refs
    }

    /// Encode as JSON, the format used by dumps and replication snapshots.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from JSON.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// Sink that shared objects dehydrate their fields into.
#[derive(Debug, Default)]
pub struct DnaWriter {
    actions: Vec<DnaAction>,
}

impl DnaWriter {
    /// Create an empty writer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a field value.
    pub fn field(&mut self, field: impl Into<String>, value: impl Into<Value>) -> &mut Self {
        self.actions.push(DnaAction::Physical {
            field: field.into(),
            value: value.into(),
        });
        self
    }

    /// Record a logical op (logical types dehydrate their contents as ops).
    pub fn logical(&mut self, op: LogicalOp) -> &mut Self {
        self.actions.push(DnaAction::Logical(op));
        self
    }

    /// Recorded actions.
    pub fn actions(&self) -> &[DnaAction] {
        &self.actions
    }

    /// Finish into a DNA record.
    pub fn into_dna(self, id: ObjectId, class_name: impl Into<String>, kind: DnaKind) -> Dna {
        Dna {
            id,
            class_name: class_name.into(),
            kind,
            version: 0,
            actions: self.actions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_field_write_wins() {
        let dna = Dna::delta(ObjectId::new(1), "Account")
            .with_field("balance", 10i64)
            .with_field("owner", "ada")
            .with_field("balance", 25i64);

        assert_eq!(dna.field("balance"), Some(&Value::Int(25)));
        assert_eq!(dna.field("owner"), Some(&Value::from("ada")));
        assert_eq!(dna.field("missing"), None);
        assert_eq!(dna.physical_fields().count(), 3);
    }

    #[test]
    fn test_references_cover_fields_and_logical_ops() {
        let dna = Dna::new_object(ObjectId::new(1), "Node")
            .with_field("next", ObjectId::new(2))
            .with_logical(LogicalOp::MapPut {
                key: Value::from("k"),
                value: Value::Ref(ObjectId::new(3)),
            })
            .with_logical(LogicalOp::ListAdd(Value::List(vec![Value::Ref(ObjectId::new(2))])));

        let refs = dna.references();
        assert_eq!(refs.len(), 2);
        assert!(refs.contains(&ObjectId::new(2)));
        assert!(refs.contains(&ObjectId::new(3)));
        assert!(dna.has_logical_actions());
    }

    #[test]
    fn test_json_round_trip() {
        let dna = Dna::new_object(ObjectId::new(7), "Point")
            .with_version(3)
            .with_field("x", 1.5f64)
            .with_field("label", "origin")
            .with_field("tags", Value::List(vec![Value::from("a"), Value::Null]));
        let json = dna.to_json().unwrap();
        assert_eq!(Dna::from_json(&json).unwrap(), dna);
    }

    #[test]
    fn test_writer_into_dna() {
        let mut writer = DnaWriter::new();
        writer.field("a", 1i64).logical(LogicalOp::ListAdd(Value::Int(2)));
        assert_eq!(writer.actions().len(), 2);
        let dna = writer.into_dna(ObjectId::new(5), "Thing", DnaKind::New);
        assert_eq!(dna.kind, DnaKind::New);
        assert_eq!(dna.actions.len(), 2);
    }
}
