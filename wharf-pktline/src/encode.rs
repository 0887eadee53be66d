//! Serialize pkt-lines and side-band frames.

use std::io;

use crate::{Channel, MAX_DATA_LEN, U16_HEX_BYTES};

/// The maximum payload of a side-band frame, leaving room for the channel byte.
pub const MAX_BAND_DATA_LEN: usize = MAX_DATA_LEN - 1;

/// The error returned by the encoding functions of this module.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Writing to the underlying stream failed.
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The payload does not fit into a single packet.
    #[error("data of {len} bytes exceeds the maximum packet payload of {max} bytes", max = MAX_DATA_LEN)]
    DataLengthLimitExceeded {
        /// The length of the rejected payload.
        len: usize,
    },
    /// Empty data packets are not representable.
    #[error("empty data packets are invalid")]
    DataIsEmpty,
}

fn u16_to_hex(value: u16) -> [u8; U16_HEX_BYTES] {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut buf = [0u8; U16_HEX_BYTES];
    for (i, slot) in buf.iter_mut().enumerate() {
        *slot = HEX[usize::from((value >> ((3 - i) * 4)) & 0xf)];
    }
    buf
}

fn control_to_write(prefix: &[u8; U16_HEX_BYTES], out: &mut dyn io::Write) -> Result<usize, Error> {
    out.write_all(prefix)?;
    Ok(U16_HEX_BYTES)
}

/// Write a `0000` flush packet.
pub fn flush_to_write(out: &mut dyn io::Write) -> Result<usize, Error> {
    control_to_write(b"0000", out)
}

/// Write a `0001` delimiter packet.
pub fn delim_to_write(out: &mut dyn io::Write) -> Result<usize, Error> {
    control_to_write(b"0001", out)
}

/// Write a `0002` response-end packet.
pub fn response_end_to_write(out: &mut dyn io::Write) -> Result<usize, Error> {
    control_to_write(b"0002", out)
}

/// Write one data packet carrying `data`, returning the framed length.
pub fn data_to_write(data: &[u8], out: &mut dyn io::Write) -> Result<usize, Error> {
    if data.is_empty() {
        return Err(Error::DataIsEmpty);
    }
    if data.len() > MAX_DATA_LEN {
        return Err(Error::DataLengthLimitExceeded { len: data.len() });
    }
    let framed = data.len() + U16_HEX_BYTES;
    out.write_all(&u16_to_hex(framed as u16))?;
    out.write_all(data)?;
    Ok(framed)
}

/// Write `text` as a single data packet, appending a newline unless one is
/// already present.
pub fn text_to_write(text: &[u8], out: &mut dyn io::Write) -> Result<usize, Error> {
    if text.last() == Some(&b'\n') {
        data_to_write(text, out)
    } else {
        if text.len() + 1 > MAX_DATA_LEN {
            return Err(Error::DataLengthLimitExceeded { len: text.len() + 1 });
        }
        let framed = text.len() + 1 + U16_HEX_BYTES;
        out.write_all(&u16_to_hex(framed as u16))?;
        out.write_all(text)?;
        out.write_all(b"\n")?;
        Ok(framed)
    }
}

/// Write `data` onto the given side-band channel, splitting it into as many
/// frames as needed. Returns the total number of bytes written to `out`.
pub fn band_to_write(channel: Channel, data: &[u8], out: &mut dyn io::Write) -> Result<usize, Error> {
    let mut written = 0;
    if data.is_empty() {
        return Ok(0);
    }
    for chunk in data.chunks(MAX_BAND_DATA_LEN) {
        let framed = chunk.len() + 1 + U16_HEX_BYTES;
        out.write_all(&u16_to_hex(framed as u16))?;
        out.write_all(&[channel as u8])?;
        out.write_all(chunk)?;
        written += framed;
    }
    Ok(written)
}

/// Write a fatal message on channel 3. The message is a single frame.
pub fn error_to_write(message: &[u8], out: &mut dyn io::Write) -> Result<usize, Error> {
    if message.len() > MAX_BAND_DATA_LEN {
        return Err(Error::DataLengthLimitExceeded { len: message.len() });
    }
    band_to_write(Channel::Error, message, out)
}
