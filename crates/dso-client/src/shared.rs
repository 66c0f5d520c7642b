//! Shared object trait, class registry and reference fields

use crate::peer::Peer;
use dso_common::{Dna, DnaWriter, DsoError, DsoResult, LogicalOp, NULL_OBJECT_ID, ObjectId, Value};
use rustc_hash::FxHashMap;
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// An application type whose instances can be shared through the cluster.
///
/// Physical types dehydrate their fields with [`DnaWriter::field`]; logical
/// (collection) types dehydrate their contents as ops and apply incremental
/// changes through [`SharedObject::apply_logical`].
pub trait SharedObject: Send + Sync + 'static {
    /// Class descriptor used to reconstruct instances on fault-in.
    fn class_name(&self) -> &str;

    /// Write the current state.
    fn dehydrate(&self, writer: &mut DnaWriter);

    /// Load state from a full-state record.
    fn hydrate(&mut self, dna: &Dna) -> DsoResult<()>;

    /// Visit every reference field. Used for eager faulting and for
    /// clearing resolved references under memory pressure.
    fn visit_references(&mut self, _visitor: &mut dyn FnMut(&mut Reference)) {}

    /// Apply one collection operation.
    fn apply_logical(&mut self, op: &LogicalOp) -> DsoResult<()> {
        Err(DsoError::invalid_dna(
            NULL_OBJECT_ID,
            format!("{} does not support {op:?}", self.class_name()),
        ))
    }

    /// Downcast support.
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

type Factory = Arc<dyn Fn() -> Box<dyn SharedObject> + Send + Sync>;

/// Constructors for every class this process can fault in.
#[derive(Clone, Default)]
pub struct ClassRegistry {
    factories: FxHashMap<String, Factory>,
}

impl fmt::Debug for ClassRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.factories.keys().collect();
        names.sort();
        f.debug_struct("ClassRegistry").field("classes", &names).finish()
    }
}

impl ClassRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a constructor for `class_name`, replacing any previous one.
    pub fn register<F>(&mut self, class_name: impl Into<String>, factory: F) -> &mut Self
    where
        F: Fn() -> Box<dyn SharedObject> + Send + Sync + 'static,
    {
        self.factories.insert(class_name.into(), Arc::new(factory));
        self
    }

    /// Register `T::default()` as the constructor for `class_name`.
    pub fn register_default<T>(&mut self, class_name: impl Into<String>) -> &mut Self
    where
        T: SharedObject + Default,
    {
        self.register(class_name, || Box::new(T::default()))
    }

    /// Whether `class_name` can be constructed.
    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    /// Number of registered classes.
    pub fn len(&self) -> usize {
        self.factories.len()
    }

    /// Whether nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }

    /// Fresh, unhydrated instance of `class_name`.
    pub fn instantiate(&self, class_name: &str) -> DsoResult<Box<dyn SharedObject>> {
        self.factories
            .get(class_name)
            .map(|factory| factory())
            .ok_or_else(|| DsoError::ClassNotFound(class_name.to_string()))
    }
}

/// A reference field: the target's id plus, once resolved, a strong
/// handle on its local peer.
#[derive(Clone, Default)]
pub struct Reference {
    id: ObjectId,
    peer: Option<Arc<Peer>>,
}

impl fmt::Debug for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reference")
            .field("id", &self.id)
            .field("resolved", &self.peer.is_some())
            .finish()
    }
}

impl Reference {
    /// Unresolved reference to `id`.
    pub fn new(id: ObjectId) -> Self {
        Self { id, peer: None }
    }

    /// The null reference.
    pub fn null() -> Self {
        Self::default()
    }

    /// Reference read from a field value; anything but `Ref` is null.
    pub fn from_value(value: &Value) -> Self {
        Self::new(value.as_ref_id().unwrap_or(NULL_OBJECT_ID))
    }

    pub(crate) fn resolved(id: ObjectId, peer: Arc<Peer>) -> Self {
        Self {
            id,
            peer: Some(peer),
        }
    }

    /// Target id.
    pub fn id(&self) -> ObjectId {
        self.id
    }

    /// Whether this points nowhere.
    pub fn is_null(&self) -> bool {
        self.id.is_null()
    }

    /// Whether the local peer is attached.
    pub fn is_resolved(&self) -> bool {
        self.peer.is_some()
    }

    /// The attached peer, if resolved.
    pub fn get(&self) -> Option<&Arc<Peer>> {
        self.peer.as_ref()
    }

    pub(crate) fn attach(&mut self, peer: Arc<Peer>) {
        self.peer = Some(peer);
    }

    /// Drop the attached peer, keeping the id. Returns whether one was attached.
    pub fn clear(&mut self) -> bool {
        self.peer.take().is_some()
    }

    /// Field value for dehydration.
    pub fn to_value(&self) -> Value {
        if self.id.is_null() {
            Value::Null
        } else {
            Value::Ref(self.id)
        }
    }
}
