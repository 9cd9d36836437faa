//! Dual-indexed directory structure.
//!
//! Each directory keeps its children under two total orderings over the same
//! entry set: one keyed by name (lookup) and one keyed by a monotonically
//! assigned ordinal position (restartable positional enumeration). Positions
//! are never reused within a directory's lifetime, so an enumeration started
//! before a concurrent removal still yields the surviving entries in their
//! original relative order.
//!
//! Both maps live in this one container and are always mutated together; the
//! owning directory's mutex serializes access.

use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use crate::types::{BackendError, BackendResult, HandleToken, InodeId};

/// One child entry of a directory.
///
/// The child is referenced by inode number plus its persistent token, never
/// by pointer: if the child handle has been evicted, the token re-resolves it
/// from durable storage.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Entry name, unique within the directory.
    pub name: String,
    /// Ordinal position, stable for the directory's lifetime.
    pub position: u64,
    /// Inode number of the child handle.
    pub child: InodeId,
    /// Persistent token of the child handle.
    pub token: HandleToken,
}

/// The by-name and by-position orderings of one directory's children.
pub struct DirIndex {
    /// Inode of the owning directory, for error reporting.
    dir: InodeId,
    by_name: BTreeMap<String, DirEntry>,
    by_pos: BTreeMap<u64, DirEntry>,
    /// Next ordinal to assign. Never decremented, never reused.
    next_pos: u64,
    /// Recorded child count, kept alongside the maps so divergence is
    /// detectable as corruption.
    numkids: u32,
}

impl DirIndex {
    /// Creates an empty index for the directory with inode `dir`.
    pub fn new(dir: InodeId) -> Self {
        Self {
            dir,
            by_name: BTreeMap::new(),
            by_pos: BTreeMap::new(),
            next_pos: 0,
            numkids: 0,
        }
    }

    /// Rebuilds an index from previously persisted entries.
    ///
    /// `next_pos` must be at least one past the highest persisted position so
    /// ordinals stay unique across the eviction.
    pub fn restore(dir: InodeId, entries: Vec<DirEntry>, next_pos: u64) -> Self {
        let mut idx = Self::new(dir);
        for entry in entries {
            idx.by_name.insert(entry.name.clone(), entry.clone());
            idx.by_pos.insert(entry.position, entry);
            idx.numkids += 1;
        }
        idx.next_pos = next_pos;
        idx
    }

    /// Snapshot of all entries plus the next ordinal, for persistence.
    pub fn snapshot(&self) -> (Vec<DirEntry>, u64) {
        (
            self.by_pos.values().cloned().collect(),
            self.next_pos,
        )
    }

    /// Inserts a child under `name`, assigning the next ordinal position.
    ///
    /// Returns the assigned position. Fails with `EntryExists` if the name
    /// is already present; the index is unchanged in that case.
    pub fn insert(&mut self, name: &str, child: InodeId, token: HandleToken) -> BackendResult<u64> {
        if self.by_name.contains_key(name) {
            return Err(BackendError::EntryExists {
                parent: self.dir,
                name: name.to_string(),
            });
        }
        let position = self.next_pos;
        self.next_pos += 1;
        let entry = DirEntry {
            name: name.to_string(),
            position,
            child,
            token,
        };
        self.by_name.insert(name.to_string(), entry.clone());
        self.by_pos.insert(position, entry);
        self.numkids += 1;
        Ok(position)
    }

    /// Removes the entry under `name` from both orderings.
    pub fn remove(&mut self, name: &str) -> BackendResult<DirEntry> {
        let entry = self
            .by_name
            .remove(name)
            .ok_or_else(|| BackendError::EntryNotFound {
                parent: self.dir,
                name: name.to_string(),
            })?;
        self.by_pos.remove(&entry.position);
        self.numkids -= 1;
        Ok(entry)
    }

    /// Looks up an entry by name.
    pub fn find_by_name(&self, name: &str) -> Option<&DirEntry> {
        self.by_name.get(name)
    }

    /// Returns up to `limit` entries starting at ordinal `position`,
    /// inclusive, in position order.
    ///
    /// Restartable: pass the last returned position plus one to continue.
    pub fn enumerate_from(&self, position: u64, limit: usize) -> Vec<DirEntry> {
        self.by_pos
            .range((Bound::Included(position), Bound::Unbounded))
            .take(limit)
            .map(|(_, e)| e.clone())
            .collect()
    }

    /// Number of children currently in the directory.
    pub fn count(&self) -> u32 {
        self.numkids
    }

    /// Checks that both orderings and the recorded child count agree.
    ///
    /// Divergence is structural corruption: the operation that detects it
    /// must abort, and the export is considered damaged.
    pub fn verify(&self) -> BackendResult<()> {
        let names = self.by_name.len();
        let positions = self.by_pos.len();
        if names != positions || names != self.numkids as usize {
            return Err(BackendError::InvariantViolation {
                detail: format!(
                    "directory {}: by-name {} entries, by-position {} entries, recorded count {}",
                    self.dir, names, positions, self.numkids
                ),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tok(n: u64) -> HandleToken {
        HandleToken::from_parts(1, InodeId::new(n), 0)
    }

    fn index() -> DirIndex {
        DirIndex::new(InodeId::new(1))
    }

    #[test]
    fn test_insert_assigns_sequential_positions() {
        let mut idx = index();
        assert_eq!(idx.insert("a", InodeId::new(10), tok(10)).unwrap(), 0);
        assert_eq!(idx.insert("b", InodeId::new(11), tok(11)).unwrap(), 1);
        assert_eq!(idx.insert("c", InodeId::new(12), tok(12)).unwrap(), 2);
        assert_eq!(idx.count(), 3);
        idx.verify().unwrap();
    }

    #[test]
    fn test_insert_duplicate_name() {
        let mut idx = index();
        idx.insert("a", InodeId::new(10), tok(10)).unwrap();
        match idx.insert("a", InodeId::new(11), tok(11)) {
            Err(BackendError::EntryExists { name, .. }) => assert_eq!(name, "a"),
            other => panic!("expected EntryExists, got {:?}", other),
        }
        // Failed insert must not disturb either ordering.
        assert_eq!(idx.count(), 1);
        idx.verify().unwrap();
    }

    #[test]
    fn test_remove_missing_name() {
        let mut idx = index();
        assert!(matches!(
            idx.remove("ghost"),
            Err(BackendError::EntryNotFound { .. })
        ));
    }

    #[test]
    fn test_positions_not_reused_after_removal() {
        let mut idx = index();
        idx.insert("a", InodeId::new(10), tok(10)).unwrap();
        idx.insert("b", InodeId::new(11), tok(11)).unwrap();
        idx.remove("b").unwrap();
        // The freed ordinal must not be handed out again.
        assert_eq!(idx.insert("c", InodeId::new(12), tok(12)).unwrap(), 2);
        idx.verify().unwrap();
    }

    #[test]
    fn test_enumerate_in_assignment_order() {
        let mut idx = index();
        for (i, name) in ["zeta", "alpha", "mid"].iter().enumerate() {
            idx.insert(name, InodeId::new(10 + i as u64), tok(10 + i as u64)).unwrap();
        }
        let entries = idx.enumerate_from(0, 16);
        let names: Vec<&str> = entries.iter().map(|e| e.name.as_str()).collect();
        // Positional order is assignment order, not name order.
        assert_eq!(names, vec!["zeta", "alpha", "mid"]);
    }

    #[test]
    fn test_enumerate_restartable_across_removal() {
        let mut idx = index();
        for i in 0..6 {
            idx.insert(&format!("f{i}"), InodeId::new(100 + i), tok(100 + i)).unwrap();
        }
        let first = idx.enumerate_from(0, 3);
        assert_eq!(first.len(), 3);
        let resume = first.last().unwrap().position + 1;

        // Remove an entry from the already-returned page and one that is
        // still ahead of the cursor.
        idx.remove("f1").unwrap();
        idx.remove("f4").unwrap();

        let second = idx.enumerate_from(resume, 16);
        let names: Vec<&str> = second.iter().map(|e| e.name.as_str()).collect();
        // No surviving entry skipped or duplicated.
        assert_eq!(names, vec!["f3", "f5"]);
    }

    #[test]
    fn test_enumerate_limit() {
        let mut idx = index();
        for i in 0..10 {
            idx.insert(&format!("f{i}"), InodeId::new(i), tok(i)).unwrap();
        }
        assert_eq!(idx.enumerate_from(0, 4).len(), 4);
        assert_eq!(idx.enumerate_from(8, 4).len(), 2);
        assert!(idx.enumerate_from(10, 4).is_empty());
    }

    #[test]
    fn test_find_by_name() {
        let mut idx = index();
        idx.insert("hello", InodeId::new(42), tok(42)).unwrap();
        assert_eq!(idx.find_by_name("hello").unwrap().child, InodeId::new(42));
        assert!(idx.find_by_name("world").is_none());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        #[derive(Clone, Debug)]
        enum Op {
            Insert(u8),
            Remove(u8),
        }

        fn op_strategy() -> impl Strategy<Value = Op> {
            prop_oneof![
                (0u8..24).prop_map(Op::Insert),
                (0u8..24).prop_map(Op::Remove),
            ]
        }

        proptest! {
            // After every operation the two orderings hold the same entry
            // set and the recorded count matches both sizes.
            #[test]
            fn indices_stay_consistent(ops in proptest::collection::vec(op_strategy(), 1..200)) {
                let mut idx = DirIndex::new(InodeId::new(1));
                let mut model: std::collections::BTreeSet<String> = Default::default();
                for op in ops {
                    match op {
                        Op::Insert(n) => {
                            let name = format!("n{n}");
                            let res = idx.insert(&name, InodeId::new(n as u64), tok(n as u64));
                            prop_assert_eq!(res.is_ok(), model.insert(name));
                        }
                        Op::Remove(n) => {
                            let name = format!("n{n}");
                            let res = idx.remove(&name);
                            prop_assert_eq!(res.is_ok(), model.remove(&name));
                        }
                    }
                    idx.verify().unwrap();
                    prop_assert_eq!(idx.count() as usize, model.len());
                    let enumerated = idx.enumerate_from(0, usize::MAX);
                    let mut names: Vec<String> =
                        enumerated.iter().map(|e| e.name.clone()).collect();
                    names.sort();
                    let expected: Vec<String> = model.iter().cloned().collect();
                    prop_assert_eq!(names, expected);
                    // Positional order is strictly increasing.
                    for pair in enumerated.windows(2) {
                        prop_assert!(pair[0].position < pair[1].position);
                    }
                }
            }
        }
    }
}
