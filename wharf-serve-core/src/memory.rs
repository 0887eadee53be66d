//! In-memory storage backends.
//!
//! These back the test suites of the engine crates and are useful for
//! embedders that serve synthetic repositories.

use std::collections::{BTreeMap, HashMap};

use wharf_hash::ObjectId;

use crate::store::{Link, ObjectDatabase, ObjectInfo, ObjectKind, RefDatabase, RefEdit, StoreError};
use crate::visibility::{RefRecord, RefTarget};

/// An object database backed by a hash map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryObjectDatabase {
    objects: HashMap<ObjectId, ObjectInfo>,
}

impl InMemoryObjectDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a commit with the given parents and root tree.
    pub fn insert_commit(&mut self, id: ObjectId, parents: &[ObjectId], tree: Option<ObjectId>, time: i64) {
        let mut links: Vec<Link> = parents
            .iter()
            .map(|p| Link {
                id: *p,
                kind: Some(ObjectKind::Commit),
            })
            .collect();
        if let Some(tree) = tree {
            links.push(Link {
                id: tree,
                kind: Some(ObjectKind::Tree),
            });
        }
        self.objects.insert(
            id,
            ObjectInfo {
                kind: ObjectKind::Commit,
                size: 0,
                commit_time: time,
                links,
            },
        );
    }

    /// Insert a tree with the given entries.
    pub fn insert_tree(&mut self, id: ObjectId, entries: &[(ObjectId, ObjectKind)]) {
        self.objects.insert(
            id,
            ObjectInfo {
                kind: ObjectKind::Tree,
                size: 0,
                commit_time: 0,
                links: entries
                    .iter()
                    .map(|(id, kind)| Link {
                        id: *id,
                        kind: Some(*kind),
                    })
                    .collect(),
            },
        );
    }

    /// Insert a blob.
    pub fn insert_blob(&mut self, id: ObjectId) {
        self.insert_blob_sized(id, 0);
    }

    /// Insert a blob recording its uncompressed size.
    pub fn insert_blob_sized(&mut self, id: ObjectId, size: u64) {
        self.objects.insert(
            id,
            ObjectInfo {
                kind: ObjectKind::Blob,
                size,
                commit_time: 0,
                links: Vec::new(),
            },
        );
    }

    /// Insert an annotated tag pointing at `target`.
    pub fn insert_tag(&mut self, id: ObjectId, target: ObjectId, target_kind: ObjectKind) {
        self.objects.insert(
            id,
            ObjectInfo {
                kind: ObjectKind::Tag,
                size: 0,
                commit_time: 0,
                links: vec![Link {
                    id: target,
                    kind: Some(target_kind),
                }],
            },
        );
    }

    /// Remove an object, e.g. to simulate a corrupted repository.
    pub fn remove(&mut self, id: &ObjectId) {
        self.objects.remove(id);
    }

    /// The number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    /// Whether the database holds no objects.
    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectDatabase for InMemoryObjectDatabase {
    fn contains(&self, id: &ObjectId) -> bool {
        self.objects.contains_key(id)
    }

    fn info(&self, id: &ObjectId) -> Result<Option<ObjectInfo>, StoreError> {
        Ok(self.objects.get(id).cloned())
    }
}

/// A reference database backed by an ordered map, yielding refs in name
/// order like packed-refs does.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRefDatabase {
    refs: BTreeMap<String, RefRecord>,
    checked_out: Option<String>,
}

impl InMemoryRefDatabase {
    /// Create an empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a reference snapshot.
    pub fn insert(&mut self, record: RefRecord) {
        self.refs.insert(record.name.clone(), record);
    }

    /// Mark a branch as checked out in a working tree.
    pub fn set_checked_out(&mut self, branch: Option<String>) {
        self.checked_out = branch;
    }

    /// The number of references.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Whether no references exist.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }
}

impl RefDatabase for InMemoryRefDatabase {
    fn refs(&self) -> Result<Vec<RefRecord>, StoreError> {
        Ok(self.refs.values().cloned().collect())
    }

    fn find(&self, name: &str) -> Result<Option<RefRecord>, StoreError> {
        Ok(self.refs.get(name).cloned())
    }

    fn checked_out_branch(&self) -> Result<Option<String>, StoreError> {
        Ok(self.checked_out.clone())
    }

    fn apply(&mut self, edit: &RefEdit) -> Result<(), StoreError> {
        if let Some(expected) = edit.expected_old {
            let current = self.refs.get(&edit.name).and_then(RefRecord::object_id);
            let matches = if expected.is_null() {
                current.is_none()
            } else {
                current == Some(expected)
            };
            if !matches {
                return Err(StoreError::RefUpdateRefused(format!(
                    "{}: expected {} but found {}",
                    edit.name,
                    expected,
                    current.map_or_else(|| "absent".to_owned(), |id| id.to_hex()),
                )));
            }
        }
        match edit.new {
            Some(new) => {
                self.refs.insert(
                    edit.name.clone(),
                    RefRecord {
                        name: edit.name.clone(),
                        target: RefTarget::Object(new),
                        peeled: None,
                        storage: Default::default(),
                    },
                );
            }
            None => {
                self.refs.remove(&edit.name);
            }
        }
        Ok(())
    }

    fn supports_transactions(&self) -> bool {
        true
    }

    fn apply_all(&mut self, edits: &[RefEdit]) -> Result<(), StoreError> {
        // Stage against a copy so a failure leaves the database untouched.
        let mut staged = self.clone();
        for edit in edits {
            staged.apply(edit)?;
        }
        *self = staged;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oid(hex40: &str) -> ObjectId {
        ObjectId::from_hex(hex40.as_bytes()).expect("valid hex")
    }

    #[test]
    fn ref_edits_respect_expected_old() {
        let mut refs = InMemoryRefDatabase::new();
        let a = oid("1111111111111111111111111111111111111111");
        let b = oid("2222222222222222222222222222222222222222");
        refs.insert(RefRecord::new(a, "refs/heads/main"));

        let stale = RefEdit {
            name: "refs/heads/main".into(),
            expected_old: Some(b),
            new: Some(b),
        };
        assert!(matches!(refs.apply(&stale), Err(StoreError::RefUpdateRefused(_))));

        let fresh = RefEdit {
            name: "refs/heads/main".into(),
            expected_old: Some(a),
            new: Some(b),
        };
        refs.apply(&fresh).unwrap();
        assert_eq!(refs.find("refs/heads/main").unwrap().unwrap().object_id(), Some(b));
    }

    #[test]
    fn transactional_apply_all_rolls_back() {
        let mut refs = InMemoryRefDatabase::new();
        let a = oid("1111111111111111111111111111111111111111");
        let b = oid("2222222222222222222222222222222222222222");
        refs.insert(RefRecord::new(a, "refs/heads/main"));

        let edits = vec![
            RefEdit {
                name: "refs/heads/feature".into(),
                expected_old: Some(ObjectId::null(wharf_hash::Kind::Sha1)),
                new: Some(b),
            },
            RefEdit {
                name: "refs/heads/main".into(),
                expected_old: Some(b), // stale on purpose
                new: Some(b),
            },
        ];
        assert!(refs.apply_all(&edits).is_err());
        assert!(refs.find("refs/heads/feature").unwrap().is_none(), "rolled back");
    }

    #[test]
    fn commit_graph_links() {
        let mut odb = InMemoryObjectDatabase::new();
        let parent = oid("1111111111111111111111111111111111111111");
        let tree = oid("3333333333333333333333333333333333333333");
        let tip = oid("2222222222222222222222222222222222222222");
        odb.insert_commit(parent, &[], None, 100);
        odb.insert_commit(tip, &[parent], Some(tree), 200);

        let info = odb.info(&tip).unwrap().unwrap();
        assert_eq!(info.parents().collect::<Vec<_>>(), vec![parent]);
        assert_eq!(info.links.len(), 2);
    }
}
