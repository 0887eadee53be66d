//! The reference advertisement a server emits on accepting a connection.

use std::io::{self, Write as _};

use wharf_hash::{Kind, ObjectId};
use wharf_pktline::{encode, Writer};

use crate::capabilities::{CapabilityOrdering, CapabilitySet};
use crate::hooks::AdvertiseRefsHook;
use crate::visibility::RefRecord;

/// Writes v0/v1-style advertisements (blocking).
///
/// Format (first line):
///   `<oid> <refname>\0<capabilities space-separated>`
/// Subsequent lines:
///   `<oid> <refname>` with `<oid> <refname>^{}` peeled lines for
///   annotated tags. Finalized with a flush packet.
///
/// For empty repositories a single synthetic line is emitted using a zero
/// oid and the refname `capabilities^{}`.
pub struct Advertiser<W: io::Write> {
    out: Writer<W>,
    ordering: CapabilityOrdering,
    object_format: Kind,
}

impl<W: io::Write> Advertiser<W> {
    /// Create a new advertiser over the given writer, in text mode.
    pub fn new(write: W) -> Self {
        let mut out = Writer::new(write);
        out.enable_text_mode();
        Self {
            out,
            ordering: CapabilityOrdering::PreserveIdiomatic,
            object_format: Kind::Sha1,
        }
    }

    /// Set the capability ordering policy.
    pub fn with_ordering(mut self, ordering: CapabilityOrdering) -> Self {
        self.ordering = ordering;
        self
    }

    /// Set the object format used for the zero-id placeholder line.
    pub fn with_object_format(mut self, format: Kind) -> Self {
        self.object_format = format;
        self
    }

    /// Run the given hook, then write the v0/v1 advertisement.
    ///
    /// A hook failure is forwarded to the peer as a single `ERR` packet
    /// and returned as `Err` with the hook's message.
    pub fn write_advertisement(
        &mut self,
        refs: &[RefRecord],
        caps: &CapabilitySet,
        hook: &AdvertiseRefsHook,
    ) -> Result<(), crate::service::Error> {
        let mut refs: Vec<RefRecord> = refs.to_vec();
        if let Err(message) = hook.invoke(&mut refs) {
            self.write_error(&message)?;
            return Err(crate::service::Error::Validation(message));
        }

        let caps_line = caps.encode(self.ordering);
        tracing::debug!(refs = refs.len(), "writing ref advertisement");

        let mut refs = refs.iter().filter(|r| r.object_id().is_some());
        match refs.next() {
            None => {
                let zero = ObjectId::null(self.object_format);
                self.out.write_text(format!("{zero} capabilities^{{}}\0{caps_line}"))?;
            }
            Some(first) => {
                let id = first.object_id().expect("filtered to direct refs");
                self.out.write_text(format!("{id} {}\0{caps_line}", first.name))?;
                self.write_peeled(first)?;
                for r in refs {
                    let id = r.object_id().expect("filtered to direct refs");
                    self.out.write_text(format!("{id} {}", r.name))?;
                    self.write_peeled(r)?;
                }
            }
        }
        self.out.write_flush()?;
        Ok(())
    }

    /// Write the v2 capability advertisement: `version 2`, one capability
    /// per packet, then flush.
    pub fn write_v2_advertisement(&mut self, caps: &[(String, Option<String>)]) -> Result<(), crate::service::Error> {
        self.out.write_text("version 2")?;
        for (name, value) in caps {
            match value {
                Some(value) => self.out.write_text(format!("{name}={value}"))?,
                None => self.out.write_text(name.as_str())?,
            };
        }
        self.out.write_flush()?;
        Ok(())
    }

    /// Abort the session visibly with a single `ERR <msg>` packet before
    /// any advertisement.
    pub fn write_error(&mut self, message: &str) -> Result<(), crate::service::Error> {
        self.out.write_text(format!("ERR {message}"))?;
        self.out.inner_mut().flush()?;
        Ok(())
    }

    fn write_peeled(&mut self, record: &RefRecord) -> Result<(), encode::Error> {
        if let Some(peeled) = record.peeled {
            self.out.write_text(format!("{peeled} {}^{{}}", record.name))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wharf_pktline::{PacketLineRef, StreamingPeekableIter};

    fn oid(hex40: &str) -> ObjectId {
        ObjectId::from_hex(hex40.as_bytes()).expect("valid hex")
    }

    fn collect_data_lines(buf: &[u8]) -> Vec<Vec<u8>> {
        let mut rd = StreamingPeekableIter::new(std::io::Cursor::new(buf.to_vec()), &[PacketLineRef::Flush], false);
        let mut out = Vec::new();
        while let Some(next) = rd.read_line() {
            match next.expect("io ok").expect("decode ok") {
                PacketLineRef::Data(d) => out.push(d.to_vec()),
                PacketLineRef::Flush | PacketLineRef::Delimiter | PacketLineRef::ResponseEnd => break,
            }
        }
        out
    }

    #[test]
    fn first_line_carries_caps_after_nul() {
        let refs = vec![
            RefRecord::new(oid("1111111111111111111111111111111111111111"), "refs/heads/main"),
            RefRecord::new(oid("2222222222222222222222222222222222222222"), "refs/tags/v1")
                .with_peeled(oid("3333333333333333333333333333333333333333")),
        ];
        let caps = CapabilitySet::receive_pack_defaults().with_agent(Some("wharf/1.0".into()));
        let mut buf = Vec::new();
        let mut adv = Advertiser::new(&mut buf);
        adv.write_advertisement(&refs, &caps, &AdvertiseRefsHook::Default).unwrap();

        let lines = collect_data_lines(&buf);
        assert_eq!(lines.len(), 3);

        let first = &lines[0];
        let nul = first.iter().position(|b| *b == 0).expect("nul present");
        assert!(first[..nul].starts_with(b"1111111111111111111111111111111111111111 refs/heads/main"));
        let caps_str = std::str::from_utf8(&first[nul + 1..]).unwrap();
        assert!(caps_str.contains("report-status"));
        assert!(caps_str.contains("agent=wharf/1.0"));

        assert!(lines[1].starts_with(b"2222222222222222222222222222222222222222 refs/tags/v1"));
        assert!(lines[2].starts_with(b"3333333333333333333333333333333333333333 refs/tags/v1^{}"));
        assert!(buf.ends_with(b"0000"));
    }

    #[test]
    fn empty_repository_gets_placeholder_line() {
        let caps = CapabilitySet::receive_pack_defaults();
        let mut buf = Vec::new();
        let mut adv = Advertiser::new(&mut buf);
        adv.write_advertisement(&[], &caps, &AdvertiseRefsHook::Default).unwrap();

        let lines = collect_data_lines(&buf);
        assert_eq!(lines.len(), 1);
        assert!(lines[0].starts_with(b"0000000000000000000000000000000000000000 capabilities^{}\0"));
    }

    #[test]
    fn hook_failure_becomes_err_packet() {
        let hook = AdvertiseRefsHook::new(|_| Err("service is read-only".to_owned()));
        let caps = CapabilitySet::receive_pack_defaults();
        let mut buf = Vec::new();
        let mut adv = Advertiser::new(&mut buf);
        let err = adv.write_advertisement(&[], &caps, &hook).unwrap_err();
        assert!(matches!(err, crate::service::Error::Validation(_)));
        assert!(buf.starts_with(b"001dERR service is read-only\n"));
    }

    #[test]
    fn v2_advertisement_lists_capabilities() {
        let mut buf = Vec::new();
        let mut adv = Advertiser::new(&mut buf);
        adv.write_v2_advertisement(&[
            ("ls-refs".to_owned(), None),
            ("fetch".to_owned(), Some("shallow filter".to_owned())),
            ("object-info".to_owned(), None),
            ("agent".to_owned(), Some("wharf/1.0".to_owned())),
        ])
        .unwrap();

        let lines = collect_data_lines(&buf);
        assert_eq!(lines[0], b"version 2\n");
        assert_eq!(lines[2], b"fetch=shallow filter\n");
        assert!(buf.ends_with(b"0000"));
    }
}
