//! Pack ingestion collaborator and the `.keep` lock lifecycle.

use std::io;
use std::path::PathBuf;

use wharf_hash::ObjectId;

use crate::progress::ProgressMonitor;

/// The error produced by a pack ingestor.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Reading the stream failed.
    #[error("pack read failed: {0}")]
    Io(#[from] io::Error),
    /// The stream is not a valid pack.
    #[error("{0}")]
    Malformed(String),
}

/// A sentinel `.keep` file whose existence forbids garbage collection of
/// the just-received pack until its refs are durable.
///
/// Created by the pack parser, released exactly once by the receive
/// engine on success or failure.
#[derive(Debug)]
pub struct PackLock {
    keep_path: PathBuf,
    unlocked: bool,
}

impl PackLock {
    /// Take ownership of an existing `.keep` file.
    pub fn new(keep_path: impl Into<PathBuf>) -> Self {
        Self {
            keep_path: keep_path.into(),
            unlocked: false,
        }
    }

    /// The path of the sentinel file.
    pub fn keep_path(&self) -> &std::path::Path {
        &self.keep_path
    }

    /// Whether [`unlock`](Self::unlock) already succeeded.
    pub fn is_unlocked(&self) -> bool {
        self.unlocked
    }

    /// Remove the sentinel. A second call is a no-op; a failed removal
    /// leaves the lock held so the call can be retried.
    pub fn unlock(&mut self) -> io::Result<()> {
        if self.unlocked {
            return Ok(());
        }
        match std::fs::remove_file(&self.keep_path) {
            Ok(()) => {
                self.unlocked = true;
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                self.unlocked = true;
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

/// What a successful ingestion produced.
#[derive(Debug, Default)]
pub struct IngestedPack {
    /// The `.keep` lock protecting the pack, if one was taken.
    pub lock: Option<PackLock>,
    /// Ids of all objects the pack introduced.
    pub new_objects: Vec<ObjectId>,
    /// Base objects referenced by thin-pack deltas but not contained.
    pub external_bases: Vec<ObjectId>,
}

/// Parses an incoming pack into the object store, holding it under a
/// [`PackLock`] until the engine releases it.
pub trait PackIngestor {
    /// Record the message written into the `.keep` file.
    fn set_lock_message(&mut self, message: &str);

    /// Consume the raw pack stream.
    fn ingest(
        &mut self,
        input: &mut dyn io::Read,
        progress: &mut dyn ProgressMonitor,
    ) -> Result<IngestedPack, IngestError>;

    /// Discard a previously ingested pack after the push was refused.
    fn abandon(&mut self);
}

/// Scoped release for a [`PackLock`]: guarantees `unlock` runs exactly
/// once on every path out of the receive engine.
#[derive(Debug, Default)]
pub struct LockGuard {
    lock: Option<PackLock>,
}

impl LockGuard {
    /// Guard the given lock, if any.
    pub fn new(lock: Option<PackLock>) -> Self {
        Self { lock }
    }

    /// Release now, reporting failures to the caller.
    pub fn unlock(&mut self) -> io::Result<()> {
        match self.lock.as_mut() {
            Some(lock) => lock.unlock(),
            None => Ok(()),
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // Abnormal exits release the lock best-effort.
        if let Some(lock) = self.lock.as_mut() {
            let _ = lock.unlock();
        }
    }
}
