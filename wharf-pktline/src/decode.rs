//! Decode pkt-lines from raw bytes.

use crate::{PacketLineRef, MAX_LINE_LEN, U16_HEX_BYTES};

/// The error returned when decoding a pkt-line fails.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum Error {
    /// The four length bytes were not valid ASCII hex.
    #[error("invalid hex length prefix {prefix:?}")]
    HexDecode {
        /// The offending prefix bytes, lossily decoded.
        prefix: String,
    },
    /// The framed length was `0003` or `0004`, which are reserved.
    #[error("reserved packet length {0:#06x}")]
    ReservedLength(u16),
    /// The framed length exceeds the 65520-byte maximum.
    #[error("framed length of {length} exceeds the maximum of {max}", max = MAX_LINE_LEN)]
    DataLengthLimitExceeded {
        /// The length announced by the prefix.
        length: usize,
    },
    /// A data packet announced a zero-byte payload.
    #[error("data packets must carry at least one payload byte")]
    DataIsEmpty,
    /// A side-band frame was requested from a control packet.
    #[error("control packets carry no side-band frame")]
    BandOnControlPacket,
    /// The first payload byte was not a known side-band channel.
    #[error("invalid side-band channel {0}")]
    InvalidChannel(u8),
}

/// The outcome of attempting to decode a line from a (possibly partial) buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream<'a> {
    /// A complete line was decoded.
    Complete {
        /// The decoded line.
        line: PacketLineRef<'a>,
        /// How many input bytes the line occupied.
        bytes_consumed: usize,
    },
    /// More input is required.
    Incomplete {
        /// How many additional bytes are needed at minimum.
        bytes_needed: usize,
    },
}

/// Decode the four ASCII-hex length bytes of a packet prefix.
pub fn hex_prefix_len(prefix: &[u8; U16_HEX_BYTES]) -> Result<u16, Error> {
    let as_str = std::str::from_utf8(prefix).map_err(|_| Error::HexDecode {
        prefix: String::from_utf8_lossy(prefix).into_owned(),
    })?;
    u16::from_str_radix(as_str, 16).map_err(|_| Error::HexDecode {
        prefix: String::from_utf8_lossy(prefix).into_owned(),
    })
}

/// Decode one line from `data`, which may hold more than one line.
pub fn streaming(data: &[u8]) -> Result<Stream<'_>, Error> {
    let mut prefix = [0u8; U16_HEX_BYTES];
    if data.len() < U16_HEX_BYTES {
        return Ok(Stream::Incomplete {
            bytes_needed: U16_HEX_BYTES - data.len(),
        });
    }
    prefix.copy_from_slice(&data[..U16_HEX_BYTES]);
    let length = hex_prefix_len(&prefix)?;

    match length {
        0 => {
            return Ok(Stream::Complete {
                line: PacketLineRef::Flush,
                bytes_consumed: U16_HEX_BYTES,
            })
        }
        1 => {
            return Ok(Stream::Complete {
                line: PacketLineRef::Delimiter,
                bytes_consumed: U16_HEX_BYTES,
            })
        }
        2 => {
            return Ok(Stream::Complete {
                line: PacketLineRef::ResponseEnd,
                bytes_consumed: U16_HEX_BYTES,
            })
        }
        3 | 4 => return Err(Error::ReservedLength(length)),
        _ => {}
    }

    let length = usize::from(length);
    if length > MAX_LINE_LEN {
        return Err(Error::DataLengthLimitExceeded { length });
    }
    if data.len() < length {
        return Ok(Stream::Incomplete {
            bytes_needed: length - data.len(),
        });
    }
    Ok(Stream::Complete {
        line: PacketLineRef::Data(&data[U16_HEX_BYTES..length]),
        bytes_consumed: length,
    })
}
