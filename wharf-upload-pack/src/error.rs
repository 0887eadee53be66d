//! Error types for upload-pack operations.

use wharf_hash::ObjectId;

/// Result type alias for upload-pack operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for upload-pack operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error on the underlying stream; fatal to the session.
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

    /// Malformed request line or out-of-order phase.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid object ID in a request line.
    #[error("invalid object id: {oid}")]
    InvalidObjectId {
        /// The offending hex string.
        oid: String,
    },

    /// A want was refused by the active request policy.
    #[error("want {oid} not allowed by request policy")]
    WantNotAllowed {
        /// The refused object id.
        oid: ObjectId,
    },

    /// An unknown v2 command was requested.
    #[error("unknown command: {command}")]
    UnknownCommand {
        /// The command name the client sent.
        command: String,
    },

    /// Invalid filter specification.
    #[error("invalid filter: {0}")]
    InvalidFilter(#[from] wharf_serve_core::filter::FilterParseError),

    /// Pack generation failed after the header was committed; reported on
    /// channel 3 where possible.
    #[error("pack generation error: {0}")]
    Pack(String),

    /// The session was cancelled by the progress monitor or transport.
    #[error("session cancelled")]
    Cancelled,

    /// A second fetch was attempted on the same connection.
    #[error("only one operation is allowed per connection")]
    OperationAlreadyExecuted,
}

impl Error {
    /// Create a protocol error with a message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    /// Whether this error should be reported to the client before closing.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::Protocol(_)
                | Self::InvalidObjectId { .. }
                | Self::WantNotAllowed { .. }
                | Self::UnknownCommand { .. }
                | Self::InvalidFilter(_)
        )
    }
}
