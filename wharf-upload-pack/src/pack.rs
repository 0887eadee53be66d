//! The pack generation collaborator and side-band plumbing.

use std::io;

use wharf_hash::ObjectId;
use wharf_pktline::{encode, Channel};
use wharf_serve_core::filter::FilterSpec;
use wharf_serve_core::progress::ProgressMonitor;
use wharf_serve_core::store::StoreError;

/// What the negotiation decided the pack must contain.
#[derive(Debug)]
pub struct PackRequest<'a> {
    /// Tips the client asked for.
    pub wants: &'a [ObjectId],
    /// Objects known to exist on both sides; their closure is excluded.
    pub common: &'a [ObjectId],
    /// Commits whose parents must be omitted.
    pub shallow: &'a [ObjectId],
    /// Object filter, applied lazily during generation.
    pub filter: Option<&'a FilterSpec>,
    /// Deltas may reference bases outside the pack.
    pub thin_pack: bool,
    /// Deltas may use offsets instead of base ids.
    pub ofs_delta: bool,
    /// Include annotated tags whose targets enter the pack.
    pub include_tag: bool,
}

/// Statistics about one generated pack.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PackStats {
    /// Number of objects in the pack.
    pub objects: u64,
    /// Total pack size in bytes.
    pub size: u64,
    /// Number of deltified objects.
    pub deltas: u64,
}

/// Produces a pack stream for the negotiated object set.
///
/// The transport layer does not compress or delta anything itself; a
/// repository-backed implementation is injected per session.
pub trait PackWriter {
    /// Write the pack for `request` to `out`, reporting progress.
    fn write_pack(
        &mut self,
        request: &PackRequest<'_>,
        out: &mut dyn io::Write,
        progress: &mut dyn ProgressMonitor,
    ) -> Result<PackStats, StoreError>;
}

/// An `io::Write` adapter that frames everything onto one side-band
/// channel, splitting at the negotiated frame size.
pub struct BandWriter<W> {
    out: W,
    channel: Channel,
    max_payload: usize,
}

impl<W: io::Write> BandWriter<W> {
    /// Write to `channel`, with frames of at most `max_payload` bytes.
    pub fn new(out: W, channel: Channel, max_payload: usize) -> Self {
        Self {
            out,
            channel,
            max_payload: max_payload.min(encode::MAX_BAND_DATA_LEN),
        }
    }

    /// Consume self and return the wrapped writer.
    pub fn into_inner(self) -> W {
        self.out
    }
}

impl<W: io::Write> io::Write for BandWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        for chunk in buf.chunks(self.max_payload) {
            encode::band_to_write(self.channel, chunk, &mut self.out).map_err(|e| match e {
                encode::Error::Io(io) => io,
                other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
            })?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.out.flush()
    }
}
