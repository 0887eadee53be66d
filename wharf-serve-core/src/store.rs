//! Storage collaborator traits.
//!
//! The transport layer never touches disk itself; it consumes object
//! lookup and reference mutation services through these traits. Concrete
//! repositories implement them; [`crate::memory`] provides in-memory
//! versions for tests and embedders.

use wharf_hash::ObjectId;

use crate::visibility::RefRecord;

/// The error produced by storage collaborators.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// An I/O failure in the backing store.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),
    /// The backend rejected the operation.
    #[error("store error: {0}")]
    Backend(String),
    /// A single reference update was refused, e.g. due to a lock conflict
    /// or a stale expected value.
    #[error("ref update refused: {0}")]
    RefUpdateRefused(String),
}

/// The type of a Git object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// A commit.
    Commit,
    /// A tree.
    Tree,
    /// A blob.
    Blob,
    /// An annotated tag.
    Tag,
}

/// One outgoing edge of an object in the object graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Link {
    /// The referenced object.
    pub id: ObjectId,
    /// The kind the referencing object declares for the target, when it
    /// does (tree entries do, commit parents are always commits).
    pub kind: Option<ObjectKind>,
}

/// Structural information about one object, enough to walk the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectInfo {
    /// The object's own kind.
    pub kind: ObjectKind,
    /// The size of the object's uncompressed content in bytes.
    pub size: u64,
    /// The commit timestamp in seconds since epoch, for commits.
    pub commit_time: i64,
    /// Outgoing edges: parents then tree for commits, entries for trees,
    /// the target for tags.
    pub links: Vec<Link>,
}

impl ObjectInfo {
    /// The parent commits of a commit object.
    pub fn parents(&self) -> impl Iterator<Item = ObjectId> + '_ {
        let is_commit = self.kind == ObjectKind::Commit;
        self.links
            .iter()
            .filter(move |l| is_commit && l.kind == Some(ObjectKind::Commit))
            .map(|l| l.id)
    }
}

/// Read access to an object database.
pub trait ObjectDatabase {
    /// Whether the object exists.
    fn contains(&self, id: &ObjectId) -> bool;
    /// Structural information about the object, or `None` if absent.
    fn info(&self, id: &ObjectId) -> Result<Option<ObjectInfo>, StoreError>;
}

/// One requested reference mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefEdit {
    /// The fully qualified reference name.
    pub name: String,
    /// The value the caller believes the ref currently has; `None` skips
    /// the compare step, a null id asserts the ref does not exist.
    pub expected_old: Option<ObjectId>,
    /// The new value, or `None` to delete.
    pub new: Option<ObjectId>,
}

/// Read and write access to a reference database.
///
/// Implementations provide their own concurrency control; the engines
/// treat this as a black box that may fail a single update or the whole
/// batch.
pub trait RefDatabase {
    /// Snapshot all references.
    fn refs(&self) -> Result<Vec<RefRecord>, StoreError>;

    /// Look up one reference by name.
    fn find(&self, name: &str) -> Result<Option<RefRecord>, StoreError>;

    /// The branch HEAD points at when a working tree has it checked out,
    /// if any. Pushes to it are refused unless policy allows.
    fn checked_out_branch(&self) -> Result<Option<String>, StoreError>;

    /// Apply a single edit, comparing against `expected_old` when set.
    fn apply(&mut self, edit: &RefEdit) -> Result<(), StoreError>;

    /// Whether [`apply_all`](Self::apply_all) is atomic.
    fn supports_transactions(&self) -> bool {
        false
    }

    /// Apply a batch of edits. The default applies them one by one and
    /// stops at the first failure; transactional stores override this.
    fn apply_all(&mut self, edits: &[RefEdit]) -> Result<(), StoreError> {
        for edit in edits {
            self.apply(edit)?;
        }
        Ok(())
    }
}
