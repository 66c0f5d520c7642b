//! Range-compressed ordered set of object ids
//!
//! Ids are allocated sequentially, so live and collected id populations are
//! dominated by long runs. Storing disjoint inclusive ranges keeps those sets
//! small no matter how many ids they cover.

use crate::id::ObjectId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Ordered set of [`ObjectId`]s stored as maximal disjoint ranges.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectIdSet {
    /// start -> inclusive end; ranges never touch or overlap
    ranges: BTreeMap<u64, u64>,
    len: usize,
}

impl ObjectIdSet {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ids in the set.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of stored ranges.
    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Check membership.
    pub fn contains(&self, id: ObjectId) -> bool {
        let v = id.to_u64();
        self.ranges
            .range(..=v)
            .next_back()
            .is_some_and(|(_, &end)| v <= end)
    }

    /// Insert an id. Returns `true` if it was not present.
    pub fn insert(&mut self, id: ObjectId) -> bool {
        let v = id.to_u64();
        let successor = v.checked_add(1);

        if let Some((&start, &end)) = self.ranges.range(..=v).next_back() {
            if v <= end {
                return false;
            }
            if end.checked_add(1) == Some(v) {
                // Extend the left neighbour, swallowing the right one if it now touches
                let merged_end = successor
                    .and_then(|next| self.ranges.remove(&next))
                    .unwrap_or(v);
                self.ranges.insert(start, merged_end);
                self.len += 1;
                return true;
            }
        }

        let end = successor
            .and_then(|next| self.ranges.remove(&next))
            .unwrap_or(v);
        self.ranges.insert(v, end);
        self.len += 1;
        true
    }

    /// Remove an id. Returns `true` if it was present.
    pub fn remove(&mut self, id: ObjectId) -> bool {
        let v = id.to_u64();
        let Some((&start, &end)) = self.ranges.range(..=v).next_back() else {
            return false;
        };
        if v > end {
            return false;
        }

        self.ranges.remove(&start);
        if start < v {
            self.ranges.insert(start, v - 1);
        }
        if v < end {
            self.ranges.insert(v + 1, end);
        }
        self.len -= 1;
        true
    }

    /// Smallest id.
    pub fn first(&self) -> Option<ObjectId> {
        self.ranges.first_key_value().map(|(&s, _)| ObjectId::new(s))
    }

    /// Largest id.
    pub fn last(&self) -> Option<ObjectId> {
        self.ranges.last_key_value().map(|(_, &e)| ObjectId::new(e))
    }

    /// Remove everything.
    pub fn clear(&mut self) {
        self.ranges.clear();
        self.len = 0;
    }

    /// Iterate ids in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.ranges
            .iter()
            .flat_map(|(&start, &end)| (start..=end).map(ObjectId::new))
    }

    /// Insert every id from `other`.
    pub fn union_with(&mut self, other: &ObjectIdSet) {
        for id in other.iter() {
            self.insert(id);
        }
    }

    /// Remove every id found in `other`.
    pub fn subtract(&mut self, other: &ObjectIdSet) {
        for id in other.iter() {
            self.remove(id);
        }
    }
}

impl Extend<ObjectId> for ObjectIdSet {
    fn extend<I: IntoIterator<Item = ObjectId>>(&mut self, iter: I) {
        for id in iter {
            self.insert(id);
        }
    }
}

impl FromIterator<ObjectId> for ObjectIdSet {
    fn from_iter<I: IntoIterator<Item = ObjectId>>(iter: I) -> Self {
        let mut set = Self::new();
        set.extend(iter);
        set
    }
}

impl fmt::Debug for ObjectIdSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut list = f.debug_list();
        for (start, end) in &self.ranges {
            if start == end {
                list.entry(&format_args!("{start}"));
            } else {
                list.entry(&format_args!("{start}..={end}"));
            }
        }
        list.finish()
    }
}
