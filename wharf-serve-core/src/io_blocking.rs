//! Blocking I/O helpers for server flows.

use crate::pktline::{write_delimiter, write_flush, PktWriter};

/// Create a pkt-line writer over a blocking `Write`.
pub fn pkt_writer<W: std::io::Write>(w: W) -> PktWriter<W> {
    PktWriter::new(w)
}

/// Create a pkt-line writer in text mode, for line-oriented phases.
pub fn text_writer<W: std::io::Write>(w: W) -> PktWriter<W> {
    let mut writer = PktWriter::new(w);
    writer.enable_text_mode();
    writer
}

/// Write a typical v2 section trailer: delimiter then flush.
pub fn write_section_trailer<W: std::io::Write>(w: &mut PktWriter<W>) -> std::io::Result<()> {
    write_delimiter(w)?;
    write_flush(w)
}
