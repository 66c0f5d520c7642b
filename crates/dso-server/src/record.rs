//! Managed object records
//!
//! A record holds the authoritative state of one shared object. Its state
//! takes its shape from the first action applied to it: field writes make a
//! physical object, map ops a logical map, list ops a logical list. Mixing
//! shapes afterwards is rejected as invalid DNA.

use dso_common::{Dna, DnaAction, DnaKind, DsoError, DsoResult, LogicalOp, ObjectId, Value};
use indexmap::IndexMap;
use rustc_hash::FxHashSet;

/// Authoritative state of a record.
#[derive(Debug, Clone, Default, PartialEq)]
pub enum ManagedObjectState {
    /// Nothing applied yet
    #[default]
    Empty,
    /// Named fields, in first-write order
    Physical(IndexMap<String, Value>),
    /// Logical map, in insertion order
    Map(IndexMap<Value, Value>),
    /// Logical list
    List(Vec<Value>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Shape {
    Empty,
    Physical,
    Map,
    List,
}

impl ManagedObjectState {
    fn shape(&self) -> Shape {
        match self {
            ManagedObjectState::Empty => Shape::Empty,
            ManagedObjectState::Physical(_) => Shape::Physical,
            ManagedObjectState::Map(_) => Shape::Map,
            ManagedObjectState::List(_) => Shape::List,
        }
    }

    /// Whether this is a logical map.
    pub fn is_map(&self) -> bool {
        matches!(self, ManagedObjectState::Map(_))
    }

    /// Check that every action of `dna` fits, without mutating anything.
    pub fn validate(&self, dna: &Dna) -> DsoResult<()> {
        let mut shape = self.shape();
        let mut list_len = match self {
            ManagedObjectState::List(items) => items.len(),
            _ => 0,
        };

        for action in &dna.actions {
            let wanted = match action {
                DnaAction::Physical { .. } => Shape::Physical,
                DnaAction::Logical(op) if op.is_map_op() => Shape::Map,
                DnaAction::Logical(_) => Shape::List,
            };
            if shape == Shape::Empty {
                shape = wanted;
            } else if shape != wanted {
                return Err(DsoError::invalid_dna(
                    dna.id,
                    format!("{wanted:?} action on a {shape:?} object"),
                ));
            }

            if let DnaAction::Logical(op) = action {
                match op {
                    LogicalOp::ListAdd(_) => list_len += 1,
                    LogicalOp::ListClear => list_len = 0,
                    LogicalOp::ListSet { index, .. } if *index >= list_len => {
                        return Err(DsoError::invalid_dna(
                            dna.id,
                            format!("list index {index} out of bounds (len {list_len})"),
                        ));
                    }
                    LogicalOp::ListRemoveAt(index) => {
                        if *index >= list_len {
                            return Err(DsoError::invalid_dna(
                                dna.id,
                                format!("list index {index} out of bounds (len {list_len})"),
                            ));
                        }
                        list_len -= 1;
                    }
                    _ => {}
                }
            }
        }
        Ok(())
    }

    /// Apply one action. The DNA it came from must have passed [`validate`](Self::validate).
    fn apply_action(&mut self, action: &DnaAction) {
        if matches!(self, ManagedObjectState::Empty) {
            *self = match action {
                DnaAction::Physical { .. } => ManagedObjectState::Physical(IndexMap::new()),
                DnaAction::Logical(op) if op.is_map_op() => ManagedObjectState::Map(IndexMap::new()),
                DnaAction::Logical(_) => ManagedObjectState::List(Vec::new()),
            };
        }

        match (self, action) {
            (ManagedObjectState::Physical(fields), DnaAction::Physical { field, value }) => {
                fields.insert(field.clone(), value.clone());
            }
            (ManagedObjectState::Map(map), DnaAction::Logical(op)) => match op {
                LogicalOp::MapPut { key, value } => {
                    map.insert(key.clone(), value.clone());
                }
                LogicalOp::MapRemove { key } => {
                    map.shift_remove(key);
                }
                LogicalOp::MapClear => map.clear(),
                _ => {}
            },
            (ManagedObjectState::List(items), DnaAction::Logical(op)) => match op {
                LogicalOp::ListAdd(value) => items.push(value.clone()),
                LogicalOp::ListSet { index, value } => items[*index] = value.clone(),
                LogicalOp::ListRemoveAt(index) => {
                    items.remove(*index);
                }
                LogicalOp::ListClear => items.clear(),
                _ => {}
            },
            _ => {}
        }
    }

    /// Every distinct id the state references.
    pub fn references(&self) -> FxHashSet<ObjectId> {
        let mut refs = FxHashSet::default();
        match self {
            ManagedObjectState::Empty => {}
            ManagedObjectState::Physical(fields) => {
                for value in fields.values() {
                    value.collect_references(&mut refs);
                }
            }
            ManagedObjectState::Map(map) => {
                for (key, value) in map {
                    key.collect_references(&mut refs);
                    value.collect_references(&mut refs);
                }
            }
            ManagedObjectState::List(items) => {
                for item in items {
                    item.collect_references(&mut refs);
                }
            }
        }
        refs
    }

    /// Append actions that rebuild this state from `Empty`.
    pub fn dehydrate_into(&self, actions: &mut Vec<DnaAction>) {
        match self {
            ManagedObjectState::Empty => {}
            ManagedObjectState::Physical(fields) => {
                actions.extend(fields.iter().map(|(field, value)| DnaAction::Physical {
                    field: field.clone(),
                    value: value.clone(),
                }));
            }
            ManagedObjectState::Map(map) => {
                actions.extend(map.iter().map(|(key, value)| {
                    DnaAction::Logical(LogicalOp::MapPut {
                        key: key.clone(),
                        value: value.clone(),
                    })
                }));
            }
            ManagedObjectState::List(items) => {
                actions.extend(
                    items
                        .iter()
                        .map(|item| DnaAction::Logical(LogicalOp::ListAdd(item.clone()))),
                );
            }
        }
    }

    /// Map lookup; `None` for non-map states.
    pub fn map_get(&self, key: &Value) -> Option<&Value> {
        match self {
            ManagedObjectState::Map(map) => map.get(key),
            _ => None,
        }
    }

    /// Entry or element count.
    pub fn len(&self) -> usize {
        match self {
            ManagedObjectState::Empty => 0,
            ManagedObjectState::Physical(fields) => fields.len(),
            ManagedObjectState::Map(map) => map.len(),
            ManagedObjectState::List(items) => items.len(),
        }
    }

    /// Whether nothing has been applied or the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Reference edges added and removed by one applied DNA record.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReferenceChanges {
    /// Children referenced now but not before
    pub added: Vec<ObjectId>,
    /// Children no longer referenced
    pub removed: Vec<ObjectId>,
}

/// The store's record for one object.
///
/// The checkout count lives beside the record (see the store) so it can be
/// read without taking the record lock.
#[derive(Debug, Clone)]
pub struct ManagedObjectRecord {
    pub(crate) id: ObjectId,
    pub(crate) class_name: String,
    pub(crate) state: ManagedObjectState,
    pub(crate) version: u64,
    pub(crate) is_new: bool,
    pub(crate) is_dirty: bool,
    /// Forward references of `state`, kept in sync on every apply
    pub(crate) references: FxHashSet<ObjectId>,
}

impl ManagedObjectRecord {
    /// Fresh record with no state.
    pub fn new(id: ObjectId, class_name: impl Into<String>) -> Self {
        Self {
            id,
            class_name: class_name.into(),
            state: ManagedObjectState::Empty,
            version: 0,
            is_new: true,
            is_dirty: false,
            references: FxHashSet::default(),
        }
    }

    /// Object id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Class descriptor.
    pub fn class_name(&self) -> &str {
        &self.class_name
    }

    /// Current state.
    pub fn state(&self) -> &ManagedObjectState {
        &self.state
    }

    /// Version of the last committed change.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Created but not yet released by its creator.
    pub fn is_new(&self) -> bool {
        self.is_new
    }

    /// Changed since its last release.
    pub fn is_dirty(&self) -> bool {
        self.is_dirty
    }

    /// Forward references.
    pub fn references(&self) -> &FxHashSet<ObjectId> {
        &self.references
    }

    /// Validate and apply every action, returning the edge changes.
    ///
    /// Nothing is mutated when validation fails.
    pub fn apply(&mut self, dna: &Dna) -> DsoResult<ReferenceChanges> {
        if dna.id != self.id {
            return Err(DsoError::invalid_dna(
                self.id,
                format!("DNA addressed to {}", dna.id),
            ));
        }
        self.state.validate(dna)?;
        for action in &dna.actions {
            self.state.apply_action(action);
        }

        let after = self.state.references();
        let changes = ReferenceChanges {
            added: after.difference(&self.references).copied().collect(),
            removed: self.references.difference(&after).copied().collect(),
        };
        self.references = after;
        self.is_dirty = true;
        Ok(changes)
    }

    /// Full-state DNA stamped with the current version.
    pub fn dehydrate(&self) -> Dna {
        let mut dna = Dna::new_object(self.id, self.class_name.clone()).with_version(self.version);
        dna.kind = DnaKind::New;
        self.state.dehydrate_into(&mut dna.actions);
        dna
    }
}
