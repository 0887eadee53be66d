//! Error types for client operations.

/// Result type alias for client operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for fetch and push clients.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O failure on the transport stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Packetline encode error.
    #[error("packetline error: {0}")]
    Packetline(#[from] wharf_pktline::encode::Error),

    /// Packetline decode error.
    #[error("packetline decode error: {0}")]
    PacketlineDecode(#[from] wharf_pktline::decode::Error),

    /// Local storage collaborator error.
    #[error("store error: {0}")]
    Store(#[from] wharf_serve_core::store::StoreError),

    /// The server answered something the protocol does not allow here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The server aborted the session with an `ERR` line.
    #[error("remote error: {0}")]
    Remote(String),

    /// A refspec could not be parsed.
    #[error("invalid refspec '{0}'")]
    InvalidRefSpec(String),

    /// The received pack could not be verified or indexed.
    #[error("pack verification failed: {0}")]
    Pack(String),

    /// A bundle file was malformed or of an unsupported version.
    #[error("invalid bundle: {0}")]
    Bundle(String),
}

impl Error {
    /// Create a protocol error with a message.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }
}
