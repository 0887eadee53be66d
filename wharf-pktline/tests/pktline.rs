//! Round-trip properties of the pkt-line codec.

use std::io::Cursor;

use wharf_pktline::{decode, encode, PacketLineRef, StreamingPeekableIter, Writer};

/// Reading a text line and re-emitting it reproduces the packet byte for
/// byte, as long as the line is not empty.
#[test]
fn text_lines_round_trip_byte_for_byte() {
    for payload in ["want deadbeef", "NAK", "unpack ok", "0", "x"] {
        let mut wire = Vec::new();
        encode::text_to_write(payload.as_bytes(), &mut wire).unwrap();

        let mut rd = StreamingPeekableIter::new(Cursor::new(wire.clone()), &[PacketLineRef::Flush], false);
        let line = rd.read_line().unwrap().unwrap().unwrap();
        let text = line.as_text().unwrap().to_vec();
        assert_eq!(text, payload.as_bytes());

        let mut rewritten = Vec::new();
        encode::text_to_write(&text, &mut rewritten).unwrap();
        assert_eq!(rewritten, wire);
    }
}

#[test]
fn binary_payloads_round_trip_through_writer() {
    let payload = b"\x00\x01binary\xff";
    let mut w = Writer::new(Vec::new());
    std::io::Write::write_all(&mut w, payload).unwrap();
    let wire = w.into_inner();

    let mut rd = StreamingPeekableIter::new(Cursor::new(wire), &[PacketLineRef::Flush], false);
    let line = rd.read_line().unwrap().unwrap().unwrap();
    assert_eq!(line.as_slice().unwrap(), payload);
}

#[test]
fn control_packets_round_trip() {
    let mut wire = Vec::new();
    for line in [PacketLineRef::Flush, PacketLineRef::Delimiter, PacketLineRef::ResponseEnd] {
        line.write_to(&mut wire).unwrap();
    }
    assert_eq!(wire, b"000000010002");

    let mut offset = 0;
    let mut seen = Vec::new();
    while offset < wire.len() {
        match decode::streaming(&wire[offset..]).unwrap() {
            decode::Stream::Complete { line, bytes_consumed } => {
                seen.push(line);
                offset += bytes_consumed;
            }
            decode::Stream::Incomplete { .. } => panic!("complete input"),
        }
    }
    assert_eq!(
        seen,
        vec![PacketLineRef::Flush, PacketLineRef::Delimiter, PacketLineRef::ResponseEnd]
    );
}

/// A session-shaped exchange: request lines, flush, response lines, then
/// side-band frames, exactly as the engines produce them.
#[test]
fn section_structured_stream() {
    let mut wire = Vec::new();
    encode::text_to_write(b"want 1111", &mut wire).unwrap();
    encode::flush_to_write(&mut wire).unwrap();
    encode::text_to_write(b"NAK", &mut wire).unwrap();
    encode::band_to_write(wharf_pktline::Channel::Data, b"PACK", &mut wire).unwrap();
    encode::flush_to_write(&mut wire).unwrap();

    let mut rd = StreamingPeekableIter::new(Cursor::new(wire), &[PacketLineRef::Flush], false);
    assert_eq!(
        rd.read_line().unwrap().unwrap().unwrap().as_text().unwrap(),
        b"want 1111"
    );
    assert!(rd.read_line().is_none());
    rd.reset();
    assert_eq!(rd.read_line().unwrap().unwrap().unwrap().as_text().unwrap(), b"NAK");

    let mut pack = Vec::new();
    std::io::Read::read_to_end(&mut rd.as_read_with_sidebands(|_| {}), &mut pack).unwrap();
    assert_eq!(pack, b"PACK");
}
