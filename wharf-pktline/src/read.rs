use std::io;

use crate::{decode, PacketLineRef, ERR_PREFIX, U16_HEX_BYTES};

/// What kind of line currently sits in the internal buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LineKind {
    Data,
    Flush,
    Delimiter,
    ResponseEnd,
}

impl LineKind {
    fn as_static(self) -> PacketLineRef<'static> {
        match self {
            LineKind::Data => unreachable!("data lines are never stored as delimiters"),
            LineKind::Flush => PacketLineRef::Flush,
            LineKind::Delimiter => PacketLineRef::Delimiter,
            LineKind::ResponseEnd => PacketLineRef::ResponseEnd,
        }
    }
}

/// A reader of pkt-lines that stops at configurable delimiter packets and
/// supports peeking at the next line.
///
/// Once a delimiter is encountered, [`read_line`](Self::read_line) returns
/// `None` until [`reset`](Self::reset) is called, which allows parsing
/// section-structured requests without consuming past section boundaries.
pub struct StreamingPeekableIter<R> {
    read: R,
    buf: Vec<u8>,
    peeked: Option<LineKind>,
    delimiters: &'static [PacketLineRef<'static>],
    fail_on_err_lines: bool,
    stopped_at: Option<PacketLineRef<'static>>,
}

impl<R: io::Read> StreamingPeekableIter<R> {
    /// Create a new iterator over `read`, stopping at any of `delimiters`.
    ///
    /// If `fail_on_err_lines` is set, a data line starting with `ERR ` is
    /// turned into an `io::Error` carrying the remote message.
    pub fn new(read: R, delimiters: &'static [PacketLineRef<'static>], fail_on_err_lines: bool) -> Self {
        Self {
            read,
            buf: Vec::with_capacity(512),
            peeked: None,
            delimiters,
            fail_on_err_lines,
            stopped_at: None,
        }
    }

    /// The delimiter that most recently stopped iteration, if any.
    pub fn stopped_at(&self) -> Option<PacketLineRef<'static>> {
        self.stopped_at
    }

    /// Forget a previously seen delimiter so that reading can continue.
    pub fn reset(&mut self) {
        self.stopped_at = None;
    }

    /// Like [`reset`](Self::reset), but also replaces the set of delimiters.
    pub fn reset_with(&mut self, delimiters: &'static [PacketLineRef<'static>]) {
        self.delimiters = delimiters;
        self.stopped_at = None;
    }

    /// Change whether `ERR ` data lines abort with an error.
    pub fn fail_on_err_lines(&mut self, enabled: bool) {
        self.fail_on_err_lines = enabled;
    }

    /// Consume self and return the wrapped reader.
    pub fn into_inner(self) -> R {
        self.read
    }

    /// Access the wrapped reader, e.g. to read a raw pack stream that
    /// follows the framed phase. Any peeked line is discarded.
    pub fn inner_mut(&mut self) -> &mut R {
        self.peeked = None;
        &mut self.read
    }

    /// Read the four-byte length prefix, distinguishing clean EOF from a
    /// truncated packet.
    fn read_prefix(&mut self) -> Option<io::Result<[u8; U16_HEX_BYTES]>> {
        let mut prefix = [0u8; U16_HEX_BYTES];
        let mut filled = 0;
        while filled < U16_HEX_BYTES {
            match self.read.read(&mut prefix[filled..]) {
                Ok(0) if filled == 0 => return None,
                Ok(0) => {
                    return Some(Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stream ended inside a packet length prefix",
                    )))
                }
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Some(Err(e)),
            }
        }
        Some(Ok(prefix))
    }

    /// Decode the next line into the internal buffer, returning its kind.
    fn next_kind(&mut self) -> Option<io::Result<Result<LineKind, decode::Error>>> {
        let prefix = match self.read_prefix()? {
            Ok(p) => p,
            Err(e) => return Some(Err(e)),
        };
        let length = match decode::hex_prefix_len(&prefix) {
            Ok(l) => l,
            Err(e) => return Some(Ok(Err(e))),
        };
        match length {
            0 => return Some(Ok(Ok(LineKind::Flush))),
            1 => return Some(Ok(Ok(LineKind::Delimiter))),
            2 => return Some(Ok(Ok(LineKind::ResponseEnd))),
            3 | 4 => return Some(Ok(Err(decode::Error::ReservedLength(length)))),
            _ => {}
        }
        if usize::from(length) > crate::MAX_LINE_LEN {
            return Some(Ok(Err(decode::Error::DataLengthLimitExceeded {
                length: usize::from(length),
            })));
        }
        let payload = usize::from(length) - U16_HEX_BYTES;
        self.buf.resize(payload, 0);
        if let Err(e) = self.read.read_exact(&mut self.buf) {
            return Some(Err(e));
        }
        if self.fail_on_err_lines && self.buf.starts_with(ERR_PREFIX) {
            let message = String::from_utf8_lossy(crate::trim_trailing_newline(&self.buf[ERR_PREFIX.len()..]))
                .into_owned();
            return Some(Err(io::Error::new(io::ErrorKind::Other, message)));
        }
        Some(Ok(Ok(LineKind::Data)))
    }

    fn fetch(&mut self) -> Option<io::Result<Result<LineKind, decode::Error>>> {
        if self.stopped_at.is_some() {
            return None;
        }
        let kind = if let Some(peeked) = self.peeked.take() {
            peeked
        } else {
            match self.next_kind()? {
                Ok(Ok(kind)) => kind,
                Ok(Err(e)) => return Some(Ok(Err(e))),
                Err(e) => return Some(Err(e)),
            }
        };
        if kind != LineKind::Data {
            let as_line = kind.as_static();
            if self.delimiters.contains(&as_line) {
                self.stopped_at = Some(as_line);
                return None;
            }
        }
        Some(Ok(Ok(kind)))
    }

    /// Read the next line, or `None` at EOF or when a delimiter was reached.
    #[allow(clippy::type_complexity)]
    pub fn read_line(&mut self) -> Option<io::Result<Result<PacketLineRef<'_>, decode::Error>>> {
        match self.fetch()? {
            Ok(Ok(LineKind::Data)) => Some(Ok(Ok(PacketLineRef::Data(&self.buf)))),
            Ok(Ok(kind)) => Some(Ok(Ok(kind.as_static()))),
            Ok(Err(e)) => Some(Ok(Err(e))),
            Err(e) => Some(Err(e)),
        }
    }

    /// Look at the next line without consuming it.
    #[allow(clippy::type_complexity)]
    pub fn peek_line(&mut self) -> Option<io::Result<Result<PacketLineRef<'_>, decode::Error>>> {
        match self.fetch()? {
            Ok(Ok(kind)) => {
                self.peeked = Some(kind);
                match kind {
                    LineKind::Data => Some(Ok(Ok(PacketLineRef::Data(&self.buf)))),
                    other => Some(Ok(Ok(other.as_static()))),
                }
            }
            Ok(Err(e)) => Some(Ok(Err(e))),
            Err(e) => Some(Err(e)),
        }
    }

    /// Turn this iterator into a byte reader that demultiplexes side-band
    /// frames: channel 1 becomes the payload, channel 2 is passed to
    /// `handle_progress`, channel 3 aborts with an error carrying the
    /// remote message.
    pub fn as_read_with_sidebands<F>(&mut self, handle_progress: F) -> crate::WithSidebands<'_, R, F>
    where
        F: FnMut(&[u8]),
    {
        crate::WithSidebands::with_progress(self, handle_progress)
    }

    /// Turn this iterator into a plain byte reader over data-line payloads,
    /// without side-band decoding.
    pub fn as_read(&mut self) -> crate::WithSidebands<'_, R, fn(&[u8])> {
        crate::WithSidebands::without_sidebands(self)
    }

    pub(crate) fn next_data_into_buf(&mut self) -> Option<io::Result<Result<bool, decode::Error>>> {
        match self.fetch()? {
            Ok(Ok(LineKind::Data)) => Some(Ok(Ok(true))),
            Ok(Ok(_)) => Some(Ok(Ok(false))),
            Ok(Err(e)) => Some(Ok(Err(e))),
            Err(e) => Some(Err(e)),
        }
    }

    pub(crate) fn buf(&self) -> &[u8] {
        &self.buf
    }
}
