//! Parse the v0/v1 want phase into a [`FetchRequest`].

use std::io;

use wharf_hash::ObjectId;
use wharf_pktline::{PacketLineRef, StreamingPeekableIter};
use wharf_serve_core::capabilities::CapabilitySet;
use wharf_serve_core::filter::{DeepenSpec, FilterSpec};

use crate::error::{Error, Result};
use crate::options::ServerOptions;

/// A fully parsed v0/v1 fetch request, built up line by line and emitted
/// as a value object on the terminating flush.
#[derive(Debug, Clone, Default)]
pub struct FetchRequest {
    /// The tips the client wants, in request order, without duplicates.
    pub wants: Vec<ObjectId>,
    /// The capability selection from the first want line.
    pub capabilities: CapabilitySet,
    /// Shallow/deepen parameters.
    pub deepen: DeepenSpec,
    /// Object filter, when the server advertised `filter`.
    pub filter: Option<FilterSpec>,
}

/// Parse the want phase from `input`, which must stop at flush packets.
///
/// Returns `None` when the client hung up before sending anything, which
/// is tolerated only on the very first line of a session.
pub fn parse_fetch_request<R: io::Read>(
    input: &mut StreamingPeekableIter<R>,
    options: &ServerOptions,
) -> Result<Option<FetchRequest>> {
    let mut request = FetchRequest::default();
    let mut seen_first_line = false;
    let mut seen = std::collections::HashSet::new();

    while let Some(line) = input.read_line() {
        let line = line??;
        let text = match line {
            PacketLineRef::Data(_) => line.as_text().expect("data line has text"),
            PacketLineRef::Delimiter | PacketLineRef::ResponseEnd => {
                return Err(Error::protocol("unexpected control packet in want phase"))
            }
            PacketLineRef::Flush => unreachable!("flush is a configured delimiter"),
        };
        let text = std::str::from_utf8(text)
            .map_err(|_| Error::protocol("request line is not valid UTF-8"))?;

        if let Some(rest) = text.strip_prefix("want ") {
            let (hex, caps) = match rest.split_once(' ') {
                Some((hex, caps)) => (hex, Some(caps)),
                None => (rest, None),
            };
            let oid = parse_oid(hex)?;
            if !seen_first_line {
                if let Some(caps) = caps {
                    request.capabilities = CapabilitySet::parse(caps);
                    options
                        .capabilities
                        .validate_selection(&request.capabilities)
                        .map_err(Error::Protocol)?;
                }
            } else if caps.is_some() {
                return Err(Error::protocol("capabilities are only valid on the first want line"));
            }
            seen_first_line = true;
            if seen.insert(oid) {
                if request.wants.len() >= options.max_wants {
                    return Err(Error::protocol(format!(
                        "too many wants, limit is {}",
                        options.max_wants
                    )));
                }
                request.wants.push(oid);
            }
        } else if let Some(rest) = text.strip_prefix("shallow ") {
            seen_first_line = true;
            request.deepen.client_shallow.push(parse_oid(rest)?);
        } else if let Some(rest) = text.strip_prefix("deepen ") {
            seen_first_line = true;
            let depth: i64 = rest
                .parse()
                .map_err(|_| Error::protocol(format!("invalid deepen value '{rest}'")))?;
            if depth <= 0 {
                return Err(Error::protocol(format!("invalid deepen depth {depth}")));
            }
            request.deepen.depth = depth as u32;
        } else if let Some(rest) = text.strip_prefix("deepen-since ") {
            seen_first_line = true;
            let since: i64 = rest
                .parse()
                .map_err(|_| Error::protocol(format!("invalid deepen-since value '{rest}'")))?;
            if since <= 0 {
                return Err(Error::protocol(format!("invalid deepen-since timestamp {since}")));
            }
            request.deepen.since = since;
        } else if let Some(rest) = text.strip_prefix("deepen-not ") {
            seen_first_line = true;
            request.deepen.not.push(rest.to_owned());
        } else if let Some(rest) = text.strip_prefix("filter ") {
            seen_first_line = true;
            if !options.capabilities.filter {
                return Err(Error::protocol("filtering not advertised"));
            }
            if request.filter.is_some() {
                return Err(Error::protocol("duplicate filter line"));
            }
            request.filter = Some(FilterSpec::parse(rest)?);
        } else {
            return Err(Error::protocol(format!("unexpected line '{text}' in want phase")));
        }
    }

    if !seen_first_line && input.stopped_at().is_none() {
        // The client hung up before sending anything.
        return Ok(None);
    }

    validate(&request)?;
    Ok(Some(request))
}

fn validate(request: &FetchRequest) -> Result<()> {
    if request.deepen.depth > 0 && request.deepen.since > 0 {
        return Err(Error::protocol("deepen and deepen-since are mutually exclusive"));
    }
    if request.deepen.depth > 0 && !request.deepen.not.is_empty() {
        return Err(Error::protocol("deepen and deepen-not are mutually exclusive"));
    }
    Ok(())
}

pub(crate) fn parse_oid(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex.trim().as_bytes()).map_err(|_| Error::InvalidObjectId { oid: hex.to_owned() })
}
