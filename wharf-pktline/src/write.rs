use std::io;

use crate::{encode, MAX_DATA_LEN};

/// A writer that frames every `write` call as one or more pkt-lines.
///
/// In text mode each packet payload is newline-terminated; in binary mode
/// payloads are emitted verbatim. Payloads longer than a single packet are
/// split transparently.
pub struct Writer<W> {
    inner: W,
    binary: bool,
}

impl<W: io::Write> Writer<W> {
    /// Create a writer in binary mode.
    pub fn new(inner: W) -> Self {
        Self { inner, binary: true }
    }

    /// Enable text mode: every packet payload gains a trailing newline.
    pub fn enable_text_mode(&mut self) {
        self.binary = false;
    }

    /// Enable binary mode, the default.
    pub fn enable_binary_mode(&mut self) {
        self.binary = true;
    }

    /// Whether this writer currently appends newlines to payloads.
    pub fn is_text_mode(&self) -> bool {
        !self.binary
    }

    /// Access the wrapped writer, e.g. to emit control packets.
    pub fn inner_mut(&mut self) -> &mut W {
        &mut self.inner
    }

    /// Consume self and return the wrapped writer.
    pub fn into_inner(self) -> W {
        self.inner
    }

    /// Write one newline-terminated text packet.
    pub fn write_text(&mut self, text: impl AsRef<str>) -> Result<usize, encode::Error> {
        encode::text_to_write(text.as_ref().as_bytes(), &mut self.inner)
    }

    /// Write a flush packet, then flush the underlying stream.
    pub fn write_flush(&mut self) -> io::Result<()> {
        encode::flush_to_write(&mut self.inner).map_err(into_io)?;
        self.inner.flush()
    }

    /// Write a delimiter packet.
    pub fn write_delim(&mut self) -> io::Result<()> {
        encode::delim_to_write(&mut self.inner).map_err(into_io).map(|_| ())
    }

    /// Write a response-end packet.
    pub fn write_response_end(&mut self) -> io::Result<()> {
        encode::response_end_to_write(&mut self.inner).map_err(into_io).map(|_| ())
    }
}

fn into_io(err: encode::Error) -> io::Error {
    match err {
        encode::Error::Io(err) => err,
        other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
    }
}

impl<W: io::Write> io::Write for Writer<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "empty packets are not representable",
            ));
        }
        let mut written = 0;
        for chunk in buf.chunks(MAX_DATA_LEN) {
            if self.binary {
                encode::data_to_write(chunk, &mut self.inner)
            } else {
                encode::text_to_write(chunk, &mut self.inner)
            }
            .map_err(into_io)?;
            written += chunk.len();
        }
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
