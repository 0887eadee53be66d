//! Read the header of a v2 bundle file.
//!
//! A bundle is a ref advertisement frozen into a file: a magic line,
//! `-<oid>[ <msg>]` prerequisite lines, `<oid> <refname>` ref lines, a
//! blank line, then a raw pack. v3 bundles are recognised and refused.

use std::io::BufRead;

use wharf_hash::ObjectId;
use wharf_serve_core::visibility::{RefRecord, RefStorage, RefTarget};

use crate::error::{Error, Result};

/// The first line of a version-2 bundle.
pub const V2_SIGNATURE: &str = "# v2 git bundle";
/// The first line of a version-3 bundle, not yet supported.
pub const V3_SIGNATURE: &str = "# v3 git bundle";

/// The parsed header; the pack starts where the reader is left.
#[derive(Debug, Clone, Default)]
pub struct BundleHeader {
    /// Objects the receiving repository must already have, with the
    /// optional human-readable note.
    pub prerequisites: Vec<(ObjectId, Option<String>)>,
    /// The refs the bundle carries.
    pub refs: Vec<RefRecord>,
}

/// Read the header, leaving `input` positioned at the first pack byte.
pub fn read_header<R: BufRead>(input: &mut R) -> Result<BundleHeader> {
    let mut line = String::new();
    input.read_line(&mut line).map_err(Error::Io)?;
    match line.trim_end() {
        V2_SIGNATURE => {}
        V3_SIGNATURE => return Err(Error::Bundle("v3 bundles are not supported".into())),
        other => return Err(Error::Bundle(format!("unrecognised signature '{other}'"))),
    }

    let mut header = BundleHeader::default();
    loop {
        line.clear();
        let read = input.read_line(&mut line).map_err(Error::Io)?;
        if read == 0 {
            return Err(Error::Bundle("truncated header".into()));
        }
        let text = line.trim_end_matches(['\r', '\n']);
        if text.is_empty() {
            // The blank line; the pack follows.
            break;
        }
        if let Some(rest) = text.strip_prefix('-') {
            let (hex, note) = match rest.split_once(' ') {
                Some((hex, note)) => (hex, Some(note.to_owned())),
                None => (rest, None),
            };
            header.prerequisites.push((parse_oid(hex)?, note));
        } else {
            let (hex, name) = text
                .split_once(' ')
                .ok_or_else(|| Error::Bundle(format!("malformed ref line '{text}'")))?;
            header.refs.push(RefRecord {
                name: name.to_owned(),
                target: RefTarget::Object(parse_oid(hex)?),
                peeled: None,
                storage: RefStorage::Network,
            });
        }
    }
    Ok(header)
}

fn parse_oid(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex.as_bytes()).map_err(|_| Error::Bundle(format!("invalid object id '{hex}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Read};

    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";

    #[test]
    fn parses_prerequisites_refs_and_pack_offset() {
        let bundle = format!("# v2 git bundle\n-{A} shallow base\n{B} refs/heads/main\n\nPACK...",);
        let mut input = Cursor::new(bundle.into_bytes());
        let header = read_header(&mut input).unwrap();

        assert_eq!(header.prerequisites.len(), 1);
        assert_eq!(header.prerequisites[0].1.as_deref(), Some("shallow base"));
        assert_eq!(header.refs.len(), 1);
        assert_eq!(header.refs[0].name, "refs/heads/main");

        let mut pack = Vec::new();
        input.read_to_end(&mut pack).unwrap();
        assert_eq!(pack, b"PACK...");
    }

    #[test]
    fn v3_is_refused() {
        let mut input = Cursor::new(b"# v3 git bundle\n\n".to_vec());
        let err = read_header(&mut input).unwrap_err();
        assert!(matches!(err, Error::Bundle(_)));
    }

    #[test]
    fn garbage_is_refused() {
        let mut input = Cursor::new(b"PK\x03\x04not a bundle".to_vec());
        assert!(read_header(&mut input).is_err());
    }

    #[test]
    fn truncated_header_is_refused() {
        let bundle = format!("# v2 git bundle\n{B} refs/heads/main\n");
        let mut input = Cursor::new(bundle.into_bytes());
        assert!(matches!(read_header(&mut input), Err(Error::Bundle(_))));
    }
}
