//! Parse the server's reference advertisement.

use std::io;

use wharf_hash::ObjectId;
use wharf_pktline::{PacketLineRef, StreamingPeekableIter};
use wharf_serve_core::capabilities::CapabilitySet;
use wharf_serve_core::visibility::{RefRecord, RefStorage, RefTarget};

use crate::error::{Error, Result};

/// The parsed v0/v1 advertisement.
#[derive(Debug, Clone, Default)]
pub struct Advertisement {
    /// The advertised refs, peeled ids folded into their records.
    pub refs: Vec<RefRecord>,
    /// The server's capability set from the first line.
    pub capabilities: CapabilitySet,
    /// True when the server advertised nothing but capabilities, i.e. the
    /// remote repository is empty.
    pub empty_repository: bool,
}

impl Advertisement {
    /// Look up an advertised ref by name.
    pub fn find(&self, name: &str) -> Option<&RefRecord> {
        self.refs.iter().find(|r| r.name == name)
    }

    /// All advertised object ids, peeled ids included.
    pub fn ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.refs
            .iter()
            .flat_map(|r| r.object_id().into_iter().chain(r.peeled))
    }
}

/// Read the advertisement from the transport, up to its flush.
///
/// An `ERR <msg>` line aborts with [`Error::Remote`]. A `version 2` first
/// line is refused here; the v2 client path negotiates differently.
pub fn read_advertisement<R: io::Read>(input: &mut StreamingPeekableIter<R>) -> Result<Advertisement> {
    let mut advertisement = Advertisement::default();
    let mut first = true;

    while let Some(line) = input.read_line() {
        let line = line??;
        let text = match line {
            PacketLineRef::Data(_) => line.as_text().expect("data line has text"),
            _ => return Err(Error::protocol("unexpected control packet in advertisement")),
        };
        let text = std::str::from_utf8(text).map_err(|_| Error::protocol("advertisement is not valid UTF-8"))?;

        if let Some(message) = text.strip_prefix("ERR ") {
            return Err(Error::Remote(message.to_owned()));
        }
        if first && text == "version 2" {
            return Err(Error::protocol("server selected protocol v2"));
        }

        let (refline, caps) = match text.split_once('\0') {
            Some((refline, caps)) => (refline, Some(caps)),
            None => (text, None),
        };
        if first {
            let Some(caps) = caps else {
                return Err(Error::protocol("first advertisement line carries no capabilities"));
            };
            advertisement.capabilities = CapabilitySet::parse(caps);
            first = false;
        } else if caps.is_some() {
            return Err(Error::protocol("capabilities outside the first line"));
        }

        let (hex, name) = refline
            .split_once(' ')
            .ok_or_else(|| Error::protocol(format!("malformed ref line '{refline}'")))?;
        let id = ObjectId::from_hex(hex.as_bytes())
            .map_err(|_| Error::protocol(format!("invalid object id '{hex}'")))?;

        if name == "capabilities^{}" {
            // Placeholder line of an empty repository; not a real ref.
            advertisement.empty_repository = true;
            continue;
        }
        if let Some(base) = name.strip_suffix("^{}") {
            match advertisement.refs.iter_mut().rev().find(|r| r.name == base) {
                Some(record) => record.peeled = Some(id),
                None => return Err(Error::protocol(format!("peeled line for unknown ref '{base}'"))),
            }
            continue;
        }
        advertisement.refs.push(RefRecord {
            name: name.to_owned(),
            target: RefTarget::Object(id),
            peeled: None,
            storage: RefStorage::Network,
        });
    }
    if first && input.stopped_at().is_none() {
        return Err(Error::protocol("connection closed before the advertisement"));
    }
    Ok(advertisement)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use wharf_pktline::encode;

    fn reader(lines: &[&str]) -> StreamingPeekableIter<Cursor<Vec<u8>>> {
        let mut buf = Vec::new();
        for line in lines {
            encode::text_to_write(line.as_bytes(), &mut buf).unwrap();
        }
        encode::flush_to_write(&mut buf).unwrap();
        StreamingPeekableIter::new(Cursor::new(buf), &[PacketLineRef::Flush], false)
    }

    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";
    const C: &str = "3333333333333333333333333333333333333333";

    #[test]
    fn parses_refs_and_capabilities() {
        let mut rd = reader(&[
            &format!("{A} refs/heads/main\0multi_ack side-band-64k ofs-delta agent=wharf/1.0"),
            &format!("{B} refs/tags/v1"),
            &format!("{C} refs/tags/v1^{{}}"),
        ]);
        let advertisement = read_advertisement(&mut rd).unwrap();
        assert_eq!(advertisement.refs.len(), 2);
        assert!(advertisement.capabilities.ofs_delta);
        assert_eq!(advertisement.capabilities.agent.as_deref(), Some("wharf/1.0"));

        let tag = advertisement.find("refs/tags/v1").unwrap();
        assert_eq!(tag.peeled, Some(ObjectId::from_hex(C.as_bytes()).unwrap()));
        assert_eq!(advertisement.ids().count(), 3);
    }

    #[test]
    fn empty_repository_placeholder() {
        let zero = "0".repeat(40);
        let mut rd = reader(&[&format!("{zero} capabilities^{{}}\0report-status delete-refs")]);
        let advertisement = read_advertisement(&mut rd).unwrap();
        assert!(advertisement.empty_repository);
        assert!(advertisement.refs.is_empty());
        assert!(advertisement.capabilities.report_status);
    }

    #[test]
    fn err_line_aborts_visibly() {
        let mut rd = reader(&["ERR access denied"]);
        let err = read_advertisement(&mut rd).unwrap_err();
        assert!(matches!(err, Error::Remote(message) if message == "access denied"));
    }

    #[test]
    fn eof_before_advertisement_is_an_error() {
        let mut rd = StreamingPeekableIter::new(Cursor::new(Vec::new()), &[PacketLineRef::Flush], false);
        assert!(read_advertisement(&mut rd).is_err());
    }
}
