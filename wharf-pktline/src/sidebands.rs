use std::io;

use crate::{decode, Channel, StreamingPeekableIter};

/// A byte reader over the data lines of a [`StreamingPeekableIter`],
/// optionally demultiplexing side-band frames.
///
/// With side-band decoding active, channel 1 bytes are yielded to the
/// caller, channel 2 frames are handed to the progress callback, and a
/// channel 3 frame terminates reading with an error carrying the remote
/// message. Reading ends at the parent's configured delimiter, which is
/// left consumed but recorded in [`StreamingPeekableIter::stopped_at`].
pub struct WithSidebands<'a, R, F>
where
    F: FnMut(&[u8]),
{
    parent: &'a mut StreamingPeekableIter<R>,
    handle_progress: Option<F>,
    pos: usize,
    cap: usize,
}

impl<'a, R, F> WithSidebands<'a, R, F>
where
    R: io::Read,
    F: FnMut(&[u8]),
{
    pub(crate) fn with_progress(parent: &'a mut StreamingPeekableIter<R>, handle_progress: F) -> Self {
        Self {
            parent,
            handle_progress: Some(handle_progress),
            pos: 0,
            cap: 0,
        }
    }

    pub(crate) fn without_sidebands(parent: &'a mut StreamingPeekableIter<R>) -> Self {
        Self {
            parent,
            handle_progress: None,
            pos: 0,
            cap: 0,
        }
    }

    fn decode_error(err: decode::Error) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err.to_string())
    }
}

impl<R, F> io::BufRead for WithSidebands<'_, R, F>
where
    R: io::Read,
    F: FnMut(&[u8]),
{
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        while self.pos >= self.cap {
            let is_data = match self.parent.next_data_into_buf() {
                None => return Ok(&[]),
                Some(Ok(Ok(is_data))) => is_data,
                Some(Ok(Err(e))) => return Err(Self::decode_error(e)),
                Some(Err(e)) => return Err(e),
            };
            if !is_data {
                // A non-delimiter control line; treat as end of payload.
                return Ok(&[]);
            }
            match self.handle_progress.as_mut() {
                None => {
                    self.pos = 0;
                    self.cap = self.parent.buf().len();
                }
                Some(handler) => {
                    let buf = self.parent.buf();
                    let (channel, _rest) = buf
                        .split_first()
                        .ok_or_else(|| Self::decode_error(decode::Error::BandOnControlPacket))?;
                    match Channel::from_byte(*channel) {
                        Some(Channel::Data) => {
                            self.pos = 1;
                            self.cap = buf.len();
                        }
                        Some(Channel::Progress) => {
                            handler(&buf[1..]);
                            continue;
                        }
                        Some(Channel::Error) => {
                            let message =
                                String::from_utf8_lossy(crate::trim_trailing_newline(&buf[1..])).into_owned();
                            return Err(io::Error::new(io::ErrorKind::Other, message));
                        }
                        None => return Err(Self::decode_error(decode::Error::InvalidChannel(*channel))),
                    }
                }
            }
        }
        Ok(&self.parent.buf()[self.pos..self.cap])
    }

    fn consume(&mut self, amt: usize) {
        self.pos = (self.pos + amt).min(self.cap);
    }
}

impl<R, F> io::Read for WithSidebands<'_, R, F>
where
    R: io::Read,
    F: FnMut(&[u8]),
{
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let available = io::BufRead::fill_buf(self)?;
        let n = available.len().min(buf.len());
        buf[..n].copy_from_slice(&available[..n]);
        io::BufRead::consume(self, n);
        Ok(n)
    }
}
