//! The `report-status` block sent after a push.

use std::io;

use wharf_pktline::{encode, Channel};
use wharf_serve_core::capabilities::SideBandMode;

use crate::commands::ReceiveCommand;

/// Write the status report: exactly one `unpack` line, one `ok`/`ng` line
/// per command, then a flush.
///
/// With side-band active the whole report is itself wrapped in channel-1
/// frames, followed by a raw flush ending the session.
pub fn write_report<W: io::Write>(
    out: &mut W,
    unpack_error: Option<&str>,
    commands: &[ReceiveCommand],
    side_band: SideBandMode,
) -> io::Result<()> {
    let mut inner = Vec::new();
    write_lines(&mut inner, unpack_error, commands).map_err(into_io)?;

    match side_band.max_payload() {
        Some(max) => {
            for chunk in inner.chunks(max) {
                encode::band_to_write(Channel::Data, chunk, out).map_err(into_io)?;
            }
            encode::flush_to_write(out).map_err(into_io)?;
        }
        None => out.write_all(&inner)?,
    }
    out.flush()
}

fn write_lines(
    out: &mut Vec<u8>,
    unpack_error: Option<&str>,
    commands: &[ReceiveCommand],
) -> Result<(), encode::Error> {
    match unpack_error {
        None => encode::text_to_write(b"unpack ok", out)?,
        Some(reason) => encode::text_to_write(format!("unpack {reason}").as_bytes(), out)?,
    };
    for command in commands {
        if command.is_ok() {
            encode::text_to_write(format!("ok {}", command.name).as_bytes(), out)?;
        } else {
            let reason = command.result().report_reason(command.message());
            encode::text_to_write(format!("ng {} {reason}", command.name).as_bytes(), out)?;
        }
    }
    encode::flush_to_write(out)?;
    Ok(())
}

fn into_io(err: encode::Error) -> io::Error {
    match err {
        encode::Error::Io(io) => io,
        other => io::Error::new(io::ErrorKind::InvalidInput, other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::CommandResult;
    use wharf_hash::ObjectId;

    fn oid(byte: u8) -> ObjectId {
        ObjectId::from_bytes_or_panic(&[byte; 20])
    }

    fn commands() -> Vec<ReceiveCommand> {
        let mut ok = ReceiveCommand::new(ObjectId::null(wharf_hash::Kind::Sha1), oid(1), "refs/heads/a").unwrap();
        ok.set_result(CommandResult::Ok, "");
        let mut ng = ReceiveCommand::new(oid(1), oid(2), "refs/heads/b").unwrap();
        ng.set_result(CommandResult::RejectedNonFastForward, "");
        vec![ok, ng]
    }

    #[test]
    fn plain_report() {
        let mut out = Vec::new();
        write_report(&mut out, None, &commands(), SideBandMode::None).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("unpack ok\n"));
        assert!(text.contains("ok refs/heads/a\n"));
        assert!(text.contains("ng refs/heads/b non-fast-forward\n"));
        assert!(text.ends_with("0000"));
    }

    #[test]
    fn unpack_failure_is_reported_once() {
        let mut out = Vec::new();
        write_report(&mut out, Some("index-pack abnormal exit"), &commands(), SideBandMode::None).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert_eq!(text.matches("unpack").count(), 1);
        assert!(text.contains("unpack index-pack abnormal exit\n"));
    }

    #[test]
    fn sideband_report_is_wrapped_in_channel_one() {
        let mut out = Vec::new();
        write_report(&mut out, None, &commands(), SideBandMode::SideBand64k).unwrap();
        // First frame: length prefix then the channel byte.
        assert_eq!(out[4], 1);
        assert!(out.ends_with(b"0000"));
    }
}
