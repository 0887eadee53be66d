//! Read and write the pkt-line format used by all Git network services, as
//! well as the side-band multiplexing layered on top of it.
//!
//! A pkt-line is a length-prefixed record: four ASCII-hex bytes encode the
//! framed length, followed by `length - 4` payload bytes. The lengths
//! `0000`, `0001` and `0002` are the *flush*, *delim* and *response-end*
//! control packets; `0003` and `0004` are reserved and invalid on the wire.
#![deny(missing_docs, rust_2018_idioms)]
#![forbid(unsafe_code)]

use std::io;

pub mod decode;
pub mod encode;
pub mod progress;

mod read;
mod sidebands;
mod write;

pub use read::StreamingPeekableIter;
pub use sidebands::WithSidebands;
pub use write::Writer;

/// The number of bytes of the ASCII-hex length prefix.
pub const U16_HEX_BYTES: usize = 4;
/// The maximum number of payload bytes a single data packet may carry.
pub const MAX_DATA_LEN: usize = 65516;
/// The maximum framed length of a single packet, prefix included.
pub const MAX_LINE_LEN: usize = MAX_DATA_LEN + U16_HEX_BYTES;
/// The prefix marking an error line that aborts a session before the
/// advertisement.
pub const ERR_PREFIX: &[u8] = b"ERR ";

/// One decoded pkt-line, borrowing its payload from the input buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketLineRef<'a> {
    /// A data packet with its payload.
    Data(&'a [u8]),
    /// The `0000` flush packet terminating a section.
    Flush,
    /// The `0001` delimiter packet separating sections (protocol v2).
    Delimiter,
    /// The `0002` response-end packet (protocol v2 only).
    ResponseEnd,
}

impl<'a> PacketLineRef<'a> {
    /// The payload of a data packet, or `None` for control packets.
    pub fn as_slice(&self) -> Option<&'a [u8]> {
        match self {
            PacketLineRef::Data(d) => Some(d),
            _ => None,
        }
    }

    /// The payload as text with a single trailing newline removed.
    pub fn as_text(&self) -> Option<&'a [u8]> {
        self.as_slice().map(trim_trailing_newline)
    }

    /// Serialize this line to `out`, returning the number of bytes written.
    pub fn write_to(&self, out: &mut dyn io::Write) -> Result<usize, encode::Error> {
        match self {
            PacketLineRef::Data(d) => encode::data_to_write(d, out),
            PacketLineRef::Flush => encode::flush_to_write(out),
            PacketLineRef::Delimiter => encode::delim_to_write(out),
            PacketLineRef::ResponseEnd => encode::response_end_to_write(out),
        }
    }

    /// Interpret the payload of a data packet as a side-band frame.
    pub fn decode_band(&self) -> Result<BandRef<'a>, decode::Error> {
        let data = self.as_slice().ok_or(decode::Error::BandOnControlPacket)?;
        let (channel, rest) = data.split_first().ok_or(decode::Error::BandOnControlPacket)?;
        let channel = Channel::from_byte(*channel).ok_or(decode::Error::InvalidChannel(*channel))?;
        Ok(BandRef { channel, data: rest })
    }
}

/// The in-band channel a side-band frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Channel 1: pack data.
    Data = 1,
    /// Channel 2: progress messages, scraped but not part of the payload.
    Progress = 2,
    /// Channel 3: a fatal error that terminates the session.
    Error = 3,
}

impl Channel {
    /// Map a wire byte to a channel.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Channel::Data),
            2 => Some(Channel::Progress),
            3 => Some(Channel::Error),
            _ => None,
        }
    }
}

/// A decoded side-band frame: channel byte plus payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BandRef<'a> {
    /// The channel this frame belongs to.
    pub channel: Channel,
    /// The payload bytes following the channel byte.
    pub data: &'a [u8],
}

fn trim_trailing_newline(mut data: &[u8]) -> &[u8] {
    if data.last() == Some(&b'\n') {
        data = &data[..data.len() - 1];
    }
    if data.last() == Some(&b'\r') {
        data = &data[..data.len() - 1];
    }
    data
}
