//! Server-side protocol types and request envelope.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// The kind of server-side service to handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceKind {
    /// Upload-pack: fetch/clone.
    UploadPack,
    /// Receive-pack: push.
    ReceivePack,
}

/// Supported Git protocol versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// v0 smart protocol.
    #[default]
    V0,
    /// v1 smart protocol: v0 with an explicit `version 1` announcement.
    V1,
    /// v2 command-based protocol.
    V2,
}

impl ProtocolVersion {
    /// Parse the value of a `version=` transport parameter.
    pub fn from_announcement(value: &str) -> Option<Self> {
        match value {
            "0" => Some(ProtocolVersion::V0),
            "1" => Some(ProtocolVersion::V1),
            "2" => Some(ProtocolVersion::V2),
            _ => None,
        }
    }
}

/// Options shared by a single protocol session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Whether the transport is stateless (HTTP) vs stateful (SSH/git-daemon).
    pub stateless: bool,
    /// Optional trace identifier for correlation.
    pub trace_id: Option<String>,
    /// Optional cancellation flag, polled at round and batch boundaries.
    pub cancellation: Option<Arc<AtomicBool>>,
    /// Read timeout in seconds applied by the transport; 0 means none.
    pub timeout_secs: u32,
}

impl SessionOptions {
    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancellation
            .as_ref()
            .is_some_and(|flag| flag.load(Ordering::Relaxed))
    }
}

/// A server request encapsulating the context and I/O streams.
pub struct ServerRequest<'a, R, W> {
    /// Which service to invoke.
    pub kind: ServiceKind,
    /// Which protocol version is negotiated/selected.
    pub version: ProtocolVersion,
    /// Input stream.
    pub input: R,
    /// Output stream.
    pub output: W,
    /// Session options.
    pub options: &'a SessionOptions,
}
