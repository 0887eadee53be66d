//! Server side of the Git fetch protocol.
//!
//! [`UploadPack`] drives one session over a packet-framed duplex stream:
//! it advertises references, parses the client's want/have negotiation
//! (protocol v0/v1 or the v2 command envelope), answers with ACK/NAK
//! lines, and streams a pack produced by a [`pack::PackWriter`]
//! collaborator, multiplexed over side-band channels when negotiated.
#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod engine;
pub mod error;
pub mod negotiate;
pub mod options;
pub mod pack;
pub mod policy;
pub mod request;
pub mod shallow;
pub mod v2;

pub use engine::UploadPack;
pub use error::{Error, Result};
pub use options::ServerOptions;
pub use policy::RequestPolicy;

/// The version of this crate, used in the default agent string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
