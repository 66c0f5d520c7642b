//! Object, client and lock-scope identifiers

use serde::{Deserialize, Serialize};
use std::fmt;

/// Cluster-wide identifier of a shared object.
///
/// Ids are assigned monotonically by the server, starting at 1. Zero is
/// reserved for [`NULL_OBJECT_ID`], which is also the default.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectId(u64);

/// Sentinel meaning "no object".
pub const NULL_OBJECT_ID: ObjectId = ObjectId(0);

impl ObjectId {
    /// Wrap a raw id.
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw numeric value.
    pub const fn to_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the null sentinel.
    pub const fn is_null(self) -> bool {
        self.0 == NULL_OBJECT_ID.0
    }
}

impl From<u64> for ObjectId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            f.write_str("ObjectID=[null]")
        } else {
            write!(f, "ObjectID=[{}]", self.0)
        }
    }
}

/// Identifier of a connected client process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientID[{}]", self.0)
    }
}

/// Scope token issued by the external lock manager.
///
/// Every mutating call carries one. The runtime never arbitrates on it; it
/// only records it (the map cache uses it to drop entries when a lock is
/// recalled).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LockScope(String);

impl LockScope {
    /// Scope for a named lock.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Scope used for unlocked (incoherent) operations.
    pub fn unlocked() -> Self {
        Self(String::new())
    }

    /// Whether this token names no lock.
    pub fn is_unlocked(&self) -> bool {
        self.0.is_empty()
    }

    /// Lock name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_unlocked() {
            f.write_str("LockScope[unlocked]")
        } else {
            write!(f, "LockScope[{}]", self.0)
        }
    }
}

/// A contiguous range of ids handed out by the server.
///
/// Clients draw new ids from their current batch and ask for another one
/// when it runs dry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdBatch {
    next: u64,
    end: u64,
}

impl ObjectIdBatch {
    /// Batch covering `start..end`.
    pub fn new(start: u64, end: u64) -> Self {
        Self {
            next: start,
            end: end.max(start),
        }
    }

    /// An exhausted batch.
    pub const fn empty() -> Self {
        Self { next: 0, end: 0 }
    }

    /// Take the next id, if any remain.
    pub fn next_id(&mut self) -> Option<ObjectId> {
        if self.next < self.end {
            let id = ObjectId(self.next);
            self.next += 1;
            Some(id)
        } else {
            None
        }
    }

    /// Ids left in this batch.
    pub fn remaining(&self) -> u64 {
        self.end - self.next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_object_id() {
        assert!(NULL_OBJECT_ID.is_null());
        assert!(!ObjectId::new(1).is_null());
        assert_eq!(ObjectId::default(), NULL_OBJECT_ID);
        assert_eq!(NULL_OBJECT_ID.to_string(), "ObjectID=[null]");
        assert_eq!(ObjectId::new(42).to_string(), "ObjectID=[42]");
    }

    #[test]
    fn test_batch_exhaustion() {
        let mut batch = ObjectIdBatch::new(10, 12);
        assert_eq!(batch.remaining(), 2);
        assert_eq!(batch.next_id(), Some(ObjectId::new(10)));
        assert_eq!(batch.next_id(), Some(ObjectId::new(11)));
        assert_eq!(batch.next_id(), None);
        assert_eq!(ObjectIdBatch::empty().remaining(), 0);
    }

    #[test]
    fn test_lock_scope() {
        assert!(LockScope::unlocked().is_unlocked());
        let scope = LockScope::new("cache:users");
        assert_eq!(scope.name(), "cache:users");
        assert!(!scope.is_unlocked());
    }
}
