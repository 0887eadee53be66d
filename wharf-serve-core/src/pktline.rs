//! pkt-line re-exports and helpers for server usage.

pub use wharf_pktline::{
    Channel as SidebandChannel, PacketLineRef, StreamingPeekableIter as PktIter, Writer as PktWriter,
};

use wharf_pktline::encode;

/// Write a flush packet.
pub fn write_flush<W: std::io::Write>(w: &mut PktWriter<W>) -> std::io::Result<()> {
    w.write_flush()
}

/// Write a delimiter packet.
pub fn write_delimiter<W: std::io::Write>(w: &mut PktWriter<W>) -> std::io::Result<()> {
    w.write_delim()
}

/// Write a response-end packet.
pub fn write_response_end<W: std::io::Write>(w: &mut PktWriter<W>) -> std::io::Result<()> {
    w.write_response_end()
}

/// Write a sideband progress message (channel 2).
pub fn write_sideband_progress<W: std::io::Write>(w: &mut PktWriter<W>, msg: &[u8]) -> std::io::Result<()> {
    encode::band_to_write(SidebandChannel::Progress, msg, w.inner_mut())
        .map(|_| ())
        .map_err(into_io)
}

/// Write a sideband error message (channel 3).
pub fn write_sideband_error<W: std::io::Write>(w: &mut PktWriter<W>, msg: &[u8]) -> std::io::Result<()> {
    encode::band_to_write(SidebandChannel::Error, msg, w.inner_mut())
        .map(|_| ())
        .map_err(into_io)
}

fn into_io(err: encode::Error) -> std::io::Error {
    match err {
        encode::Error::Io(io) => io,
        other => std::io::Error::new(std::io::ErrorKind::InvalidInput, other.to_string()),
    }
}
