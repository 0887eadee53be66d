//! Client side of the Git fetch and push protocols.
//!
//! The clients mirror the server state machines: they read the
//! advertisement, select capabilities, drive want/have negotiation or
//! send reference update commands, move the pack, and translate the
//! server's report into per-ref results.
#![deny(rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod bundle;
pub mod error;
pub mod fetch;
pub mod push;
pub mod refs;
pub mod refspec;

pub use error::{Error, Result};
pub use fetch::{FetchClient, FetchOptions, FetchResult, TrackingRefUpdate};
pub use push::{PushClient, PushOptions, PushResult, RemoteRefUpdate, Status};
pub use refspec::RefSpec;

/// The version of this crate, used in the default agent string.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
