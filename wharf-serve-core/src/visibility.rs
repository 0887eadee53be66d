//! Reference records and visibility filtering for advertisement.

use std::sync::Arc;

use wharf_hash::ObjectId;

use crate::store::{RefDatabase, StoreError};

/// Where a reference snapshot was read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefStorage {
    /// A loose file under `refs/`.
    #[default]
    Loose,
    /// The packed-refs file.
    Packed,
    /// Learned from a peer's advertisement.
    Network,
}

/// The target of a reference: direct or symbolic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefTarget {
    /// Points directly at an object.
    Object(ObjectId),
    /// Points at another reference by name.
    Symbolic(String),
}

/// A value-type snapshot of one reference.
///
/// The ref database remains the authoritative mutator; records are
/// read-only views taken at advertisement time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefRecord {
    /// The fully qualified reference name.
    pub name: String,
    /// What the reference points at.
    pub target: RefTarget,
    /// The target of an annotated tag, where peeling was cheap.
    pub peeled: Option<ObjectId>,
    /// Where this snapshot was read from.
    pub storage: RefStorage,
}

impl RefRecord {
    /// Create a direct reference record.
    pub fn new(id: ObjectId, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: RefTarget::Object(id),
            peeled: None,
            storage: RefStorage::default(),
        }
    }

    /// Create a symbolic reference record.
    pub fn symbolic(target: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            target: RefTarget::Symbolic(target.into()),
            peeled: None,
            storage: RefStorage::default(),
        }
    }

    /// Attach a peeled object id.
    pub fn with_peeled(mut self, peeled: ObjectId) -> Self {
        self.peeled = Some(peeled);
        self
    }

    /// The direct object id, or `None` for symbolic refs.
    pub fn object_id(&self) -> Option<ObjectId> {
        match &self.target {
            RefTarget::Object(id) => Some(*id),
            RefTarget::Symbolic(_) => None,
        }
    }
}

/// A predicate that determines whether a ref should be hidden.
pub type HiddenRefPredicate = dyn Fn(&RefRecord) -> bool + Send + Sync;

/// Resolver for collecting visible reference roots from a ref database.
pub struct VisibleRoots<'r, D: ?Sized> {
    refs: &'r D,
    hidden: Arc<HiddenRefPredicate>,
}

impl<'r, D: RefDatabase + ?Sized> VisibleRoots<'r, D> {
    /// Create a new resolver.
    pub fn new(refs: &'r D, hidden: Arc<HiddenRefPredicate>) -> Self {
        Self { refs, hidden }
    }

    /// Collect visible refs with symbolic targets resolved to object ids.
    ///
    /// Symbolic refs whose chain does not end at an object are skipped, as
    /// are hidden refs.
    pub fn collect(&self) -> Result<Vec<RefRecord>, StoreError> {
        let mut out = Vec::new();
        for record in self.refs.refs()? {
            if (self.hidden)(&record) {
                continue;
            }
            match &record.target {
                RefTarget::Object(_) => out.push(record),
                RefTarget::Symbolic(target) => match self.resolve(target, 0)? {
                    Some(id) => {
                        let mut resolved = record.clone();
                        resolved.target = RefTarget::Object(id);
                        out.push(resolved);
                    }
                    None => continue,
                },
            }
        }
        Ok(out)
    }

    fn resolve(&self, name: &str, depth: u8) -> Result<Option<ObjectId>, StoreError> {
        // Symbolic chains deeper than 5 are treated as broken, as git does.
        if depth > 5 {
            return Ok(None);
        }
        match self.refs.find(name)? {
            Some(record) => match record.target {
                RefTarget::Object(id) => Ok(Some(id)),
                RefTarget::Symbolic(next) => self.resolve(&next, depth + 1),
            },
            None => Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryRefDatabase;

    fn oid(hex40: &str) -> ObjectId {
        ObjectId::from_hex(hex40.as_bytes()).expect("valid hex")
    }

    #[test]
    fn hidden_refs_are_filtered() {
        let mut refs = InMemoryRefDatabase::default();
        refs.insert(RefRecord::new(oid("1111111111111111111111111111111111111111"), "refs/heads/main"));
        refs.insert(RefRecord::new(oid("2222222222222222222222222222222222222222"), "refs/hidden/secret"));

        let roots = VisibleRoots::new(&refs, Arc::new(|r: &RefRecord| r.name.starts_with("refs/hidden/")));
        let visible = roots.collect().unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].name, "refs/heads/main");
    }

    #[test]
    fn symbolic_refs_resolve_to_objects() {
        let mut refs = InMemoryRefDatabase::default();
        refs.insert(RefRecord::new(oid("1111111111111111111111111111111111111111"), "refs/heads/main"));
        refs.insert(RefRecord::symbolic("refs/heads/main", "HEAD"));

        let roots = VisibleRoots::new(&refs, Arc::new(|_: &RefRecord| false));
        let visible = roots.collect().unwrap();
        let head = visible.iter().find(|r| r.name == "HEAD").expect("resolved");
        assert_eq!(
            head.object_id(),
            Some(oid("1111111111111111111111111111111111111111"))
        );
    }

    #[test]
    fn dangling_symbolic_refs_are_skipped() {
        let mut refs = InMemoryRefDatabase::default();
        refs.insert(RefRecord::symbolic("refs/heads/unborn", "HEAD"));
        let roots = VisibleRoots::new(&refs, Arc::new(|_: &RefRecord| false));
        assert!(roots.collect().unwrap().is_empty());
    }
}
