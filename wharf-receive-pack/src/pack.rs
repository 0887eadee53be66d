//! Pack ingestion collaborator and the `.keep` lock lifecycle.
//!
//! The types live in the shared core because the fetch client holds the
//! same lock over packs it receives; this module re-exports them for the
//! receive engine's callers.

pub use wharf_serve_core::pack::{IngestError, IngestedPack, LockGuard, PackIngestor, PackLock};
