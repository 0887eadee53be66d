//! Error taxonomy for the push side.

use wharf_hash::ObjectId;

/// Result type alias for receive-pack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for receive-pack operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure on the underlying stream; fatal to the session.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Packetline encode error.
    #[error("packetline error: {0}")]
    Packetline(#[from] wharf_pktline::encode::Error),

    /// Packetline decode error.
    #[error("packetline decode error: {0}")]
    PacketlineDecode(#[from] wharf_pktline::decode::Error),

    /// Storage collaborator error.
    #[error("store error: {0}")]
    Store(#[from] wharf_serve_core::store::StoreError),

    /// Malformed packet, out-of-order phase, or bad command line; fatal.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Input validation error, e.g. unadvertised capabilities.
    #[error("validation error: {0}")]
    Validation(String),

    /// The push certificate was structurally invalid.
    #[error("invalid push certificate: {0}")]
    Certificate(String),

    /// The pack parser rejected the stream; every command is rejected and
    /// the failure is reported as `unpack <reason>`.
    #[error("unpack failed: {0}")]
    Unpack(String),

    /// An object required by the new tips is neither local nor in the
    /// received pack.
    #[error("missing object: {oid}")]
    MissingObject {
        /// The absent object.
        oid: ObjectId,
    },

    /// The session was cancelled; partial work is discarded.
    #[error("session cancelled")]
    Cancelled,

    /// A second push was attempted on the same connection.
    #[error("only one operation is allowed per connection")]
    OperationAlreadyExecuted,
}

impl Error {
    /// Create a protocol error with a message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
