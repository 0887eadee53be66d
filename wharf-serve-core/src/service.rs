//! Service trait implemented by server-side protocol handlers.

use crate::protocol::ServerRequest;

/// The error type used by services in this crate.
///
/// Keep this minimal in core; service crates wrap their own error types
/// into this where the orchestrator needs a uniform view.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A generic I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Protocol-level error in server handling.
    #[error("protocol error: {0}")]
    Protocol(String),
    /// Input validation error.
    #[error("validation error: {0}")]
    Validation(String),
    /// A storage collaborator failed.
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
    /// An internal error - implementation detail.
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<wharf_pktline::encode::Error> for Error {
    fn from(err: wharf_pktline::encode::Error) -> Self {
        match err {
            wharf_pktline::encode::Error::Io(io) => Error::Io(io),
            other => Error::Protocol(other.to_string()),
        }
    }
}

impl From<wharf_pktline::decode::Error> for Error {
    fn from(err: wharf_pktline::decode::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}

/// Server-side service handling a single request.
pub trait Service<R, W> {
    /// Handle a single request.
    fn handle(&mut self, req: ServerRequest<'_, R, W>) -> Result<(), Error>;
}
