//! Object identifiers as used on the Git wire.
//!
//! An [`ObjectId`] is an immutable 20-byte (SHA-1) or 32-byte (SHA-256)
//! digest with a total order defined by byte comparison. Its string form is
//! lowercase hex.
#![deny(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::fmt;

/// The hash algorithm an [`ObjectId`] was produced by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// SHA-1, 20 bytes, 40 hex characters.
    Sha1,
    /// SHA-256, 32 bytes, 64 hex characters.
    Sha256,
}

impl Kind {
    /// The digest length in bytes.
    pub const fn len_in_bytes(self) -> usize {
        match self {
            Kind::Sha1 => 20,
            Kind::Sha256 => 32,
        }
    }

    /// The digest length in hexadecimal characters.
    pub const fn len_in_hex(self) -> usize {
        self.len_in_bytes() * 2
    }

    /// Determine the kind from a hex digest length, if it matches one.
    pub const fn from_hex_len(len: usize) -> Option<Self> {
        match len {
            40 => Some(Kind::Sha1),
            64 => Some(Kind::Sha256),
            _ => None,
        }
    }

    /// The name of this object format as used in `object-format=` tokens.
    pub const fn name(self) -> &'static str {
        match self {
            Kind::Sha1 => "sha1",
            Kind::Sha256 => "sha256",
        }
    }

    /// Parse an `object-format` token value.
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "sha1" => Some(Kind::Sha1),
            "sha256" => Some(Kind::Sha256),
            _ => None,
        }
    }
}

/// The error returned when decoding an [`ObjectId`] from hex fails.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    /// The input length does not match any known digest length.
    #[error("hex digest of length {0} matches no object format")]
    InvalidLength(usize),
    /// The input contained a byte that is not a hex digit.
    #[error("invalid hex digit in digest")]
    InvalidHex(#[from] hex::FromHexError),
}

/// An immutable object identifier, ordered by byte comparison.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectId {
    /// A SHA-1 digest.
    Sha1([u8; 20]),
    /// A SHA-256 digest.
    Sha256([u8; 32]),
}

impl ObjectId {
    /// The all-zero id of the given kind, used on the wire as a placeholder
    /// for "no object" in create and delete commands.
    pub const fn null(kind: Kind) -> Self {
        match kind {
            Kind::Sha1 => ObjectId::Sha1([0; 20]),
            Kind::Sha256 => ObjectId::Sha256([0; 32]),
        }
    }

    /// `true` if every byte of this id is zero.
    pub fn is_null(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// The algorithm that produced this id.
    pub const fn kind(&self) -> Kind {
        match self {
            ObjectId::Sha1(_) => Kind::Sha1,
            ObjectId::Sha256(_) => Kind::Sha256,
        }
    }

    /// The raw digest bytes.
    pub fn as_bytes(&self) -> &[u8] {
        match self {
            ObjectId::Sha1(b) => b,
            ObjectId::Sha256(b) => b,
        }
    }

    /// Decode an id from its lowercase or uppercase hex form.
    pub fn from_hex(hex_digest: &[u8]) -> Result<Self, DecodeError> {
        let kind =
            Kind::from_hex_len(hex_digest.len()).ok_or(DecodeError::InvalidLength(hex_digest.len()))?;
        match kind {
            Kind::Sha1 => {
                let mut buf = [0u8; 20];
                hex::decode_to_slice(hex_digest, &mut buf)?;
                Ok(ObjectId::Sha1(buf))
            }
            Kind::Sha256 => {
                let mut buf = [0u8; 32];
                hex::decode_to_slice(hex_digest, &mut buf)?;
                Ok(ObjectId::Sha256(buf))
            }
        }
    }

    /// Create an id from raw digest bytes.
    ///
    /// Panics if the length matches no known digest; only use with
    /// lengths validated beforehand, e.g. in tests.
    pub fn from_bytes_or_panic(bytes: &[u8]) -> Self {
        match bytes.len() {
            20 => {
                let mut buf = [0u8; 20];
                buf.copy_from_slice(bytes);
                ObjectId::Sha1(buf)
            }
            32 => {
                let mut buf = [0u8; 32];
                buf.copy_from_slice(bytes);
                ObjectId::Sha256(buf)
            }
            other => panic!("invalid digest length {other}"),
        }
    }

    /// The lowercase hex form of this id.
    pub fn to_hex(&self) -> String {
        hex::encode(self.as_bytes())
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectId::Sha1(_) => write!(f, "Sha1({self})"),
            ObjectId::Sha256(_) => write!(f, "Sha256({self})"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn hex_round_trip_sha1() {
        let hex = "deadbeefdeadbeefdeadbeefdeadbeefdeadbeef";
        let id = ObjectId::from_hex(hex.as_bytes()).unwrap();
        assert_eq!(id.kind(), Kind::Sha1);
        assert_eq!(id.to_hex(), hex);
    }

    #[test]
    fn hex_round_trip_sha256() {
        let hex = "af5626b4a114abcb82d63db7c8082c3c4756e51b16f542a045d4456e2c5a286a";
        let id = ObjectId::from_hex(hex.as_bytes()).unwrap();
        assert_eq!(id.kind(), Kind::Sha256);
        assert_eq!(id.to_hex(), hex);
    }

    #[test]
    fn invalid_length_is_rejected() {
        assert!(matches!(
            ObjectId::from_hex(b"abcd"),
            Err(DecodeError::InvalidLength(4))
        ));
    }

    #[test]
    fn invalid_digit_is_rejected() {
        let hex = "zzzzbeefdeadbeefdeadbeefdeadbeefdeadbeef";
        assert!(matches!(
            ObjectId::from_hex(hex.as_bytes()),
            Err(DecodeError::InvalidHex(_))
        ));
    }

    #[test]
    fn null_is_null() {
        assert!(ObjectId::null(Kind::Sha1).is_null());
        assert!(ObjectId::null(Kind::Sha256).is_null());
        let id = ObjectId::from_hex(b"deadbeefdeadbeefdeadbeefdeadbeefdeadbeef").unwrap();
        assert!(!id.is_null());
    }

    #[test]
    fn order_is_byte_order() {
        let a = ObjectId::from_hex(b"0000000000000000000000000000000000000001").unwrap();
        let b = ObjectId::from_hex(b"00000000000000000000000000000000000000ff").unwrap();
        assert!(a < b);
    }
}
