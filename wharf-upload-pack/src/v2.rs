//! The protocol v2 command envelope and its request parsers.
//!
//! A v2 request is `command=<name>`, common arguments, a delimiter, then
//! command-specific arguments terminated by a flush. Recognised commands
//! are `ls-refs`, `fetch` and `object-info`; anything else is fatal.

use std::io;

use wharf_hash::{Kind, ObjectId};
use wharf_pktline::{PacketLineRef, StreamingPeekableIter};
use wharf_serve_core::filter::{DeepenSpec, FilterSpec};

use crate::error::{Error, Result};
use crate::options::ServerOptions;
use crate::request::parse_oid;

/// Arguments every v2 command accepts before the delimiter.
#[derive(Debug, Clone, Default)]
pub struct CommonArgs {
    /// The client's `agent=` value.
    pub agent: Option<String>,
    /// The client's `session-id=` value.
    pub session_id: Option<String>,
    /// The negotiated object format.
    pub object_format: Option<Kind>,
    /// Transparent `server-option=` values.
    pub server_options: Vec<String>,
}

/// A parsed `ls-refs` request.
#[derive(Debug, Clone, Default)]
pub struct LsRefsRequest {
    /// Report symref targets.
    pub symrefs: bool,
    /// Report peeled ids of annotated tags.
    pub peel: bool,
    /// Restrict output to refs matching any of these prefixes.
    pub prefixes: Vec<String>,
}

/// A parsed v2 `fetch` request.
#[derive(Debug, Clone, Default)]
pub struct FetchV2Request {
    /// Requested tips.
    pub wants: Vec<ObjectId>,
    /// Requested refs by name (`want-ref`).
    pub want_refs: Vec<String>,
    /// Objects the client claims to have.
    pub haves: Vec<ObjectId>,
    /// Shallow/deepen parameters.
    pub deepen: DeepenSpec,
    /// Object filter.
    pub filter: Option<FilterSpec>,
    /// `thin-pack` flag.
    pub thin_pack: bool,
    /// `no-progress` flag.
    pub no_progress: bool,
    /// `include-tag` flag.
    pub include_tag: bool,
    /// `ofs-delta` flag.
    pub ofs_delta: bool,
    /// The client will not send further haves.
    pub done: bool,
}

/// A parsed `object-info` request.
#[derive(Debug, Clone, Default)]
pub struct ObjectInfoRequest {
    /// The `size` attribute was requested.
    pub size: bool,
    /// The objects to report on.
    pub oids: Vec<ObjectId>,
}

/// One complete v2 request.
#[derive(Debug, Clone)]
pub enum V2Request {
    /// `command=ls-refs`
    LsRefs(LsRefsRequest),
    /// `command=fetch`
    Fetch(FetchV2Request),
    /// `command=object-info`
    ObjectInfo(ObjectInfoRequest),
}

const ENVELOPE_DELIMITERS: &[PacketLineRef<'static>] =
    &[PacketLineRef::Flush, PacketLineRef::Delimiter];

/// Parse one request envelope. Returns `None` when the client ended the
/// session with a bare flush or EOF.
pub fn parse_request<R: io::Read>(
    input: &mut StreamingPeekableIter<R>,
    options: &ServerOptions,
) -> Result<Option<(V2Request, CommonArgs)>> {
    input.reset_with(ENVELOPE_DELIMITERS);

    let mut command: Option<String> = None;
    let mut common = CommonArgs::default();

    while let Some(line) = input.read_line() {
        let text = data_text(line??)?;
        if let Some(name) = text.strip_prefix("command=") {
            if command.replace(name.to_owned()).is_some() {
                return Err(Error::protocol("duplicate command line"));
            }
        } else if let Some(value) = text.strip_prefix("agent=") {
            common.agent = Some(value.to_owned());
        } else if let Some(value) = text.strip_prefix("session-id=") {
            common.session_id = Some(value.to_owned());
        } else if let Some(value) = text.strip_prefix("object-format=") {
            common.object_format =
                Some(Kind::from_name(value).ok_or_else(|| {
                    Error::protocol(format!("unsupported object format '{value}'"))
                })?);
        } else if let Some(value) = text.strip_prefix("server-option=") {
            common.server_options.push(value.to_owned());
        } else {
            return Err(Error::protocol(format!(
                "unexpected envelope line '{text}'"
            )));
        }
    }

    let Some(command) = command else {
        // Bare flush or EOF: the client is finished with this connection.
        return Ok(None);
    };
    if let Some(agent) = &common.agent {
        tracing::debug!(agent = %agent, command = %command, "v2 request");
    }

    let has_args = input.stopped_at() == Some(PacketLineRef::Delimiter);
    input.reset_with(&[PacketLineRef::Flush]);

    let request = match command.as_str() {
        "ls-refs" => V2Request::LsRefs(parse_ls_refs(input, has_args)?),
        "fetch" => V2Request::Fetch(parse_fetch(input, has_args, options)?),
        "object-info" => V2Request::ObjectInfo(parse_object_info(input, has_args)?),
        other => return Err(Error::UnknownCommand { command: other.to_owned() }),
    };
    Ok(Some((request, common)))
}

fn parse_ls_refs<R: io::Read>(
    input: &mut StreamingPeekableIter<R>,
    has_args: bool,
) -> Result<LsRefsRequest> {
    let mut request = LsRefsRequest::default();
    if !has_args {
        return Ok(request);
    }
    while let Some(line) = input.read_line() {
        let text = data_text(line??)?;
        match text {
            "symrefs" => request.symrefs = true,
            "peel" => request.peel = true,
            _ => {
                if let Some(prefix) = text.strip_prefix("ref-prefix ") {
                    request.prefixes.push(prefix.to_owned());
                } else {
                    return Err(Error::protocol(format!("unexpected ls-refs argument '{text}'")));
                }
            }
        }
    }
    Ok(request)
}

fn parse_fetch<R: io::Read>(
    input: &mut StreamingPeekableIter<R>,
    has_args: bool,
    options: &ServerOptions,
) -> Result<FetchV2Request> {
    let mut request = FetchV2Request::default();
    if !has_args {
        return Err(Error::protocol("fetch requires at least one want"));
    }
    while let Some(line) = input.read_line() {
        let text = data_text(line??)?;
        match text {
            "thin-pack" => request.thin_pack = true,
            "no-progress" => request.no_progress = true,
            "include-tag" => request.include_tag = true,
            "ofs-delta" => request.ofs_delta = true,
            "done" => request.done = true,
            _ => {
                if let Some(rest) = text.strip_prefix("want ") {
                    if request.wants.len() >= options.max_wants {
                        return Err(Error::protocol(format!(
                            "too many wants, limit is {}",
                            options.max_wants
                        )));
                    }
                    request.wants.push(parse_oid(rest)?);
                } else if let Some(rest) = text.strip_prefix("want-ref ") {
                    request.want_refs.push(rest.to_owned());
                } else if let Some(rest) = text.strip_prefix("have ") {
                    request.haves.push(parse_oid(rest)?);
                } else if let Some(rest) = text.strip_prefix("shallow ") {
                    request.deepen.client_shallow.push(parse_oid(rest)?);
                } else if let Some(rest) = text.strip_prefix("deepen ") {
                    let depth: i64 = rest
                        .parse()
                        .map_err(|_| Error::protocol(format!("invalid deepen value '{rest}'")))?;
                    if depth <= 0 {
                        return Err(Error::protocol(format!("invalid deepen depth {depth}")));
                    }
                    request.deepen.depth = depth as u32;
                } else if let Some(rest) = text.strip_prefix("deepen-since ") {
                    let since: i64 = rest
                        .parse()
                        .map_err(|_| Error::protocol(format!("invalid deepen-since value '{rest}'")))?;
                    if since <= 0 {
                        return Err(Error::protocol(format!("invalid deepen-since timestamp {since}")));
                    }
                    request.deepen.since = since;
                } else if let Some(rest) = text.strip_prefix("deepen-not ") {
                    request.deepen.not.push(rest.to_owned());
                } else if let Some(rest) = text.strip_prefix("filter ") {
                    if !options.capabilities.filter {
                        return Err(Error::protocol("filtering not advertised"));
                    }
                    if request.filter.is_some() {
                        return Err(Error::protocol("duplicate filter line"));
                    }
                    request.filter = Some(FilterSpec::parse(rest)?);
                } else {
                    return Err(Error::protocol(format!("unexpected fetch argument '{text}'")));
                }
            }
        }
    }
    if request.wants.is_empty() && request.want_refs.is_empty() {
        return Err(Error::protocol("fetch requires at least one want"));
    }
    if request.deepen.depth > 0 && request.deepen.since > 0 {
        return Err(Error::protocol("deepen and deepen-since are mutually exclusive"));
    }
    if request.deepen.depth > 0 && !request.deepen.not.is_empty() {
        return Err(Error::protocol("deepen and deepen-not are mutually exclusive"));
    }
    Ok(request)
}

fn parse_object_info<R: io::Read>(
    input: &mut StreamingPeekableIter<R>,
    has_args: bool,
) -> Result<ObjectInfoRequest> {
    let mut request = ObjectInfoRequest::default();
    if !has_args {
        return Ok(request);
    }
    while let Some(line) = input.read_line() {
        let text = data_text(line??)?;
        if text == "size" {
            request.size = true;
        } else if let Some(rest) = text.strip_prefix("oid ") {
            request.oids.push(parse_oid(rest)?);
        } else {
            return Err(Error::protocol(format!("unexpected object-info argument '{text}'")));
        }
    }
    Ok(request)
}

fn data_text(line: PacketLineRef<'_>) -> Result<&str> {
    let text = line
        .as_text()
        .ok_or_else(|| Error::protocol("unexpected control packet in v2 request"))?;
    std::str::from_utf8(text).map_err(|_| Error::protocol("request line is not valid UTF-8"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use wharf_pktline::encode;

    const OID1: &str = "1111111111111111111111111111111111111111";
    const OID2: &str = "2222222222222222222222222222222222222222";

    enum L<'a> {
        D(&'a str),
        Delim,
        Flush,
    }

    fn wire(lines: &[L<'_>]) -> Vec<u8> {
        let mut buf = Vec::new();
        for line in lines {
            match line {
                L::D(text) => {
                    encode::text_to_write(text.as_bytes(), &mut buf).unwrap();
                }
                L::Delim => {
                    encode::delim_to_write(&mut buf).unwrap();
                }
                L::Flush => {
                    encode::flush_to_write(&mut buf).unwrap();
                }
            }
        }
        buf
    }

    fn parse(lines: &[L<'_>]) -> Result<Option<(V2Request, CommonArgs)>> {
        let mut input = StreamingPeekableIter::new(
            Cursor::new(wire(lines)),
            &[PacketLineRef::Flush, PacketLineRef::Delimiter],
            false,
        );
        parse_request(&mut input, &ServerOptions::default())
    }

    #[test]
    fn ls_refs_with_prefixes() {
        let (request, common) = parse(&[
            L::D("command=ls-refs"),
            L::D("agent=git/2.43.0"),
            L::Delim,
            L::D("symrefs"),
            L::D("peel"),
            L::D("ref-prefix refs/heads/"),
            L::D("ref-prefix refs/tags/"),
            L::Flush,
        ])
        .unwrap()
        .unwrap();

        assert_eq!(common.agent.as_deref(), Some("git/2.43.0"));
        match request {
            V2Request::LsRefs(ls) => {
                assert!(ls.symrefs);
                assert!(ls.peel);
                assert_eq!(ls.prefixes, vec!["refs/heads/", "refs/tags/"]);
            }
            _ => panic!("expected ls-refs"),
        }
    }

    #[test]
    fn fetch_with_wants_and_flags() {
        let want1 = format!("want {OID1}");
        let have = format!("have {OID2}");
        let (request, _) = parse(&[
            L::D("command=fetch"),
            L::Delim,
            L::D(&want1),
            L::D(&have),
            L::D("thin-pack"),
            L::D("ofs-delta"),
            L::D("done"),
            L::Flush,
        ])
        .unwrap()
        .unwrap();

        match request {
            V2Request::Fetch(fetch) => {
                assert_eq!(fetch.wants.len(), 1);
                assert_eq!(fetch.haves.len(), 1);
                assert!(fetch.thin_pack);
                assert!(fetch.ofs_delta);
                assert!(fetch.done);
            }
            _ => panic!("expected fetch"),
        }
    }

    #[test]
    fn object_info_collects_oids() {
        let oid_line = format!("oid {OID1}");
        let (request, _) = parse(&[
            L::D("command=object-info"),
            L::Delim,
            L::D("size"),
            L::D(&oid_line),
            L::Flush,
        ])
        .unwrap()
        .unwrap();

        match request {
            V2Request::ObjectInfo(info) => {
                assert!(info.size);
                assert_eq!(info.oids.len(), 1);
            }
            _ => panic!("expected object-info"),
        }
    }

    #[test]
    fn unknown_command_is_fatal() {
        let err = parse(&[L::D("command=frobnicate"), L::Flush]).unwrap_err();
        assert!(matches!(err, Error::UnknownCommand { .. }));
    }

    #[test]
    fn bare_flush_ends_session() {
        assert!(parse(&[L::Flush]).unwrap().is_none());
    }

    #[test]
    fn fetch_without_wants_is_fatal() {
        let err = parse(&[L::D("command=fetch"), L::Delim, L::D("done"), L::Flush]).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
