//! The upload-pack session driver.
//!
//! Phases are strictly sequential: ADVERTISE, WANT, HAVE, PACK. A session
//! serves exactly one fetch; attempting a second one fails.

use std::cell::RefCell;
use std::io;
use std::rc::Rc;

use wharf_hash::ObjectId;
use wharf_pktline::{encode, Channel, PacketLineRef, StreamingPeekableIter, Writer};
use wharf_serve_core::advertise::Advertiser;
use wharf_serve_core::capabilities::{CapabilitySet, SideBandMode};
use wharf_serve_core::filter::DeepenSpec;
use wharf_serve_core::progress::{CancellableMonitor, NoopMonitor, ProgressMonitor, SideBandProgressMonitor};
use wharf_serve_core::protocol::SessionOptions;
use wharf_serve_core::store::{ObjectDatabase, RefDatabase};
use wharf_serve_core::visibility::{RefRecord, RefTarget, VisibleRoots};

use crate::error::{Error, Result};
use crate::negotiate::Negotiator;
use crate::options::ServerOptions;
use crate::pack::{BandWriter, PackRequest, PackWriter};
use crate::request::{parse_fetch_request, FetchRequest};
use crate::shallow::{self, ShallowUpdate};
use crate::v2::{self, FetchV2Request, LsRefsRequest, ObjectInfoRequest, V2Request};

/// The server side of one fetch session.
pub struct UploadPack<'a, O, D> {
    odb: &'a O,
    refs: &'a D,
    options: ServerOptions,
    session: SessionOptions,
    executed: bool,
}

impl<'a, O, D> UploadPack<'a, O, D>
where
    O: ObjectDatabase,
    D: RefDatabase,
{
    /// Create an engine over the given storage collaborators.
    pub fn new(odb: &'a O, refs: &'a D, options: ServerOptions) -> Self {
        Self {
            odb,
            refs,
            options,
            session: SessionOptions::default(),
            executed: false,
        }
    }

    /// Attach session options (cancellation, tracing).
    pub fn with_session(mut self, session: SessionOptions) -> Self {
        self.session = session;
        self
    }

    fn begin_operation(&mut self) -> Result<()> {
        if self.executed {
            return Err(Error::OperationAlreadyExecuted);
        }
        self.executed = true;
        Ok(())
    }

    fn visible_refs(&self) -> Result<Vec<RefRecord>> {
        Ok(VisibleRoots::new(self.refs, self.options.hidden.clone()).collect()?)
    }

    fn all_refs(&self) -> Result<Vec<RefRecord>> {
        Ok(VisibleRoots::new(self.refs, std::sync::Arc::new(|_: &RefRecord| false)).collect()?)
    }

    /// Run a protocol v0/v1 session: advertisement, want and have phases,
    /// then the pack.
    pub fn run_v0<In, Out>(&mut self, input: In, mut output: Out, pack: &mut dyn PackWriter) -> Result<()>
    where
        In: io::Read,
        Out: io::Write,
    {
        self.begin_operation()?;
        let advertised = self.visible_refs()?;

        let mut advertiser = Advertiser::new(&mut output);
        advertiser
            .write_advertisement(&advertised, &self.options.capabilities, &self.options.advertise_hook)
            .map_err(|e| Error::Protocol(e.to_string()))?;

        let mut input = StreamingPeekableIter::new(input, &[PacketLineRef::Flush], false);
        let Some(request) = parse_fetch_request(&mut input, &self.options)? else {
            tracing::debug!("client hung up after advertisement");
            return Ok(());
        };
        if request.wants.is_empty() {
            // Nothing wanted; the client is already up to date.
            return Ok(());
        }

        if let Err(err) = crate::policy::validate_wants(
            self.options.request_policy,
            &request.wants,
            &advertised,
            &self.all_refs()?,
            self.odb,
        ) {
            let _ = encode::text_to_write(format!("ERR upload-pack: {err}").as_bytes(), &mut output);
            return Err(err);
        }

        let shallow_update = self.announce_shallow(&request.deepen, &request.wants, &mut output)?;

        if self.session.is_cancelled() {
            return Err(Error::Cancelled);
        }

        input.reset();
        let mut monitor: Box<dyn ProgressMonitor> = match &self.session.cancellation {
            Some(flag) => Box::new(CancellableMonitor::new(NoopMonitor, flag.clone())),
            None => Box::new(NoopMonitor),
        };
        let negotiation = Negotiator::new(
            self.odb,
            &request.wants,
            request.capabilities.multi_ack,
            request.capabilities.no_done,
        )
        .run(&mut input, &mut output, monitor.as_mut())?;

        self.write_pack_phase(&request, &shallow_update, &negotiation.common, &mut output, pack)
    }

    /// Announce `shallow`/`unshallow` boundaries, flush-terminated, when
    /// the request asked for any trimming.
    fn announce_shallow<Out: io::Write>(
        &self,
        deepen: &DeepenSpec,
        wants: &[ObjectId],
        output: &mut Out,
    ) -> Result<ShallowUpdate> {
        if !deepen.is_active() {
            return Ok(ShallowUpdate::default());
        }
        let update = shallow::compute(deepen, wants, self.odb, self.refs)?;
        for oid in &update.shallow {
            encode::text_to_write(format!("shallow {oid}").as_bytes(), output)?;
        }
        for oid in &update.unshallow {
            encode::text_to_write(format!("unshallow {oid}").as_bytes(), output)?;
        }
        encode::flush_to_write(output)?;
        output.flush()?;
        Ok(update)
    }

    fn write_pack_phase<Out: io::Write>(
        &self,
        request: &FetchRequest,
        shallow_update: &ShallowUpdate,
        common: &[ObjectId],
        output: &mut Out,
        pack: &mut dyn PackWriter,
    ) -> Result<()> {
        if self.session.is_cancelled() {
            let _ = encode::error_to_write(b"fatal: session cancelled\n", output);
            return Err(Error::Cancelled);
        }

        let mut boundary: Vec<ObjectId> = request.deepen.client_shallow.clone();
        boundary.extend_from_slice(&shallow_update.shallow);
        boundary.retain(|id| !shallow_update.unshallow.contains(id));
        boundary.sort_unstable();
        boundary.dedup();

        let pack_request = PackRequest {
            wants: &request.wants,
            common,
            shallow: &boundary,
            filter: request.filter.as_ref(),
            thin_pack: request.capabilities.thin_pack,
            ofs_delta: request.capabilities.ofs_delta,
            include_tag: request.capabilities.include_tag,
        };

        match request.capabilities.side_band {
            SideBandMode::None => {
                let stats = pack
                    .write_pack(&pack_request, output, &mut NoopMonitor)
                    .map_err(|e| Error::Pack(e.to_string()))?;
                tracing::debug!(objects = stats.objects, bytes = stats.size, "pack sent");
                output.flush()?;
            }
            mode => {
                let max_payload = mode.max_payload().expect("side-band is active");
                let shared = SharedWrite::new(output);
                let mut data = BandWriter::new(shared.clone(), Channel::Data, max_payload);
                let result = if request.capabilities.no_progress {
                    pack.write_pack(&pack_request, &mut data, &mut NoopMonitor)
                } else {
                    let mut progress = SideBandProgressMonitor::new(shared.clone());
                    pack.write_pack(&pack_request, &mut data, &mut progress)
                };
                match result {
                    Ok(stats) => {
                        tracing::debug!(objects = stats.objects, bytes = stats.size, "pack sent");
                        encode::flush_to_write(&mut shared.clone())?;
                        shared.flush_inner()?;
                    }
                    Err(e) => {
                        let message = format!("fatal: {e}\n");
                        let _ = encode::error_to_write(message.as_bytes(), &mut shared.clone());
                        return Err(Error::Pack(e.to_string()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Run a protocol v2 session: capability advertisement, then command
    /// envelopes until the client is done.
    pub fn run_v2<In, Out>(&mut self, input: In, mut output: Out, pack: &mut dyn PackWriter) -> Result<()>
    where
        In: io::Read,
        Out: io::Write,
    {
        self.begin_operation()?;

        let mut advertiser = Advertiser::new(&mut output);
        advertiser
            .write_v2_advertisement(&self.v2_capabilities())
            .map_err(|e| Error::Protocol(e.to_string()))?;

        let mut input = StreamingPeekableIter::new(
            input,
            &[PacketLineRef::Flush, PacketLineRef::Delimiter],
            false,
        );
        loop {
            if self.session.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let Some((request, _common_args)) = v2::parse_request(&mut input, &self.options)? else {
                return Ok(());
            };
            match request {
                V2Request::LsRefs(ls) => self.run_ls_refs(&ls, &mut output)?,
                V2Request::Fetch(fetch) => self.run_v2_fetch(&fetch, &mut output, pack)?,
                V2Request::ObjectInfo(info) => self.run_object_info(&info, &mut output)?,
            }
        }
    }

    fn v2_capabilities(&self) -> Vec<(String, Option<String>)> {
        let caps = &self.options.capabilities;
        let mut fetch_features = vec!["shallow".to_owned(), "wait-for-done".to_owned()];
        if caps.filter {
            fetch_features.push("filter".to_owned());
        }
        let mut out = vec![
            ("ls-refs".to_owned(), None),
            ("fetch".to_owned(), Some(fetch_features.join(" "))),
            ("object-info".to_owned(), None),
        ];
        if let Some(agent) = &caps.agent {
            out.push(("agent".to_owned(), Some(agent.clone())));
        }
        if let Some(session) = &caps.session_id {
            out.push(("session-id".to_owned(), Some(session.clone())));
        }
        out
    }

    fn run_ls_refs<Out: io::Write>(&self, request: &LsRefsRequest, output: &mut Out) -> Result<()> {
        let visible = self.visible_refs()?;
        let mut writer = Writer::new(&mut *output);
        writer.enable_text_mode();
        for record in &visible {
            if !request.prefixes.is_empty()
                && !request.prefixes.iter().any(|p| record.name.starts_with(p.as_str()))
            {
                continue;
            }
            let Some(id) = record.object_id() else { continue };
            let mut line = format!("{id} {}", record.name);
            if request.symrefs {
                if let Some(target) = self.symref_target(&record.name)? {
                    line.push_str(&format!(" symref-target:{target}"));
                }
            }
            if request.peel {
                if let Some(peeled) = record.peeled {
                    line.push_str(&format!(" peeled:{peeled}"));
                }
            }
            writer.write_text(line)?;
        }
        writer.write_flush()?;
        Ok(())
    }

    /// The symbolic target of `name` as stored, before resolution.
    fn symref_target(&self, name: &str) -> Result<Option<String>> {
        Ok(self.refs.find(name)?.and_then(|record| match record.target {
            RefTarget::Symbolic(target) => Some(target),
            RefTarget::Object(_) => None,
        }))
    }

    fn run_v2_fetch<Out: io::Write>(
        &self,
        request: &FetchV2Request,
        output: &mut Out,
        pack: &mut dyn PackWriter,
    ) -> Result<()> {
        let advertised = self.visible_refs()?;
        let mut wants = request.wants.clone();
        for name in &request.want_refs {
            let record = advertised
                .iter()
                .find(|r| r.name == *name)
                .ok_or_else(|| Error::protocol(format!("unknown ref in want-ref: {name}")))?;
            if let Some(id) = record.object_id() {
                wants.push(id);
            }
        }
        wants.sort_unstable();
        wants.dedup();

        crate::policy::validate_wants(
            self.options.request_policy,
            &wants,
            &advertised,
            &self.all_refs()?,
            self.odb,
        )?;

        let common: Vec<ObjectId> = request
            .haves
            .iter()
            .copied()
            .filter(|id| self.odb.contains(id))
            .collect();

        let mut writer = Writer::new(&mut *output);
        writer.enable_text_mode();

        let ready = request.done || self.covered(&wants, &common)?;
        if !request.done {
            writer.write_text("acknowledgments")?;
            if common.is_empty() {
                writer.write_text("NAK")?;
            } else {
                for oid in &common {
                    writer.write_text(format!("ACK {oid}"))?;
                }
            }
            if ready {
                writer.write_text("ready")?;
            } else {
                // Negotiation continues in the next request envelope.
                writer.write_flush()?;
                return Ok(());
            }
            writer.write_delim()?;
        }

        let shallow_update = if request.deepen.is_active() {
            let update = shallow::compute(&request.deepen, &wants, self.odb, self.refs)?;
            writer.write_text("shallow-info")?;
            for oid in &update.shallow {
                writer.write_text(format!("shallow {oid}"))?;
            }
            for oid in &update.unshallow {
                writer.write_text(format!("unshallow {oid}"))?;
            }
            writer.write_delim()?;
            update
        } else {
            ShallowUpdate::default()
        };

        writer.write_text("packfile")?;
        drop(writer);

        let mut boundary = request.deepen.client_shallow.clone();
        boundary.extend_from_slice(&shallow_update.shallow);
        boundary.sort_unstable();
        boundary.dedup();

        let pack_request = PackRequest {
            wants: &wants,
            common: &common,
            shallow: &boundary,
            filter: request.filter.as_ref(),
            thin_pack: request.thin_pack,
            ofs_delta: request.ofs_delta,
            include_tag: request.include_tag,
        };

        // v2 always multiplexes the packfile section.
        let shared = SharedWrite::new(output);
        let mut data = BandWriter::new(shared.clone(), Channel::Data, encode::MAX_BAND_DATA_LEN);
        let result = if request.no_progress {
            pack.write_pack(&pack_request, &mut data, &mut NoopMonitor)
        } else {
            let mut progress = SideBandProgressMonitor::new(shared.clone());
            pack.write_pack(&pack_request, &mut data, &mut progress)
        };
        match result {
            Ok(_) => {
                encode::flush_to_write(&mut shared.clone())?;
                shared.flush_inner()?;
                Ok(())
            }
            Err(e) => {
                let message = format!("fatal: {e}\n");
                let _ = encode::error_to_write(message.as_bytes(), &mut shared.clone());
                Err(Error::Pack(e.to_string()))
            }
        }
    }

    fn covered(&self, wants: &[ObjectId], common: &[ObjectId]) -> Result<bool> {
        use wharf_serve_core::store::ObjectKind;
        let common: std::collections::HashSet<ObjectId> = common.iter().copied().collect();
        if common.is_empty() {
            return Ok(false);
        }
        'wants: for want in wants {
            let mut visited = std::collections::HashSet::new();
            let mut queue = std::collections::VecDeque::from([*want]);
            while let Some(id) = queue.pop_front() {
                if !visited.insert(id) {
                    continue;
                }
                if common.contains(&id) {
                    continue 'wants;
                }
                let Some(info) = self.odb.info(&id)? else { continue };
                match info.kind {
                    ObjectKind::Commit => queue.extend(info.parents()),
                    ObjectKind::Tag => queue.extend(info.links.iter().map(|l| l.id)),
                    _ => {}
                }
            }
            return Ok(false);
        }
        Ok(true)
    }

    fn run_object_info<Out: io::Write>(&self, request: &ObjectInfoRequest, output: &mut Out) -> Result<()> {
        let mut writer = Writer::new(&mut *output);
        writer.enable_text_mode();
        if request.size {
            writer.write_text("size")?;
            for oid in &request.oids {
                let Some(info) = self.odb.info(oid)? else {
                    writer.write_text(format!("ERR object-info: not our object {oid}"))?;
                    writer.write_flush()?;
                    return Err(Error::protocol(format!("object-info for unknown object {oid}")));
                };
                writer.write_text(format!("{oid} {}", info.size))?;
            }
        }
        writer.write_flush()?;
        Ok(())
    }
}

/// A clonable writer handle sharing one underlying stream.
///
/// The engine is a single-threaded cooperative driver, so pack data and
/// progress frames interleave at packet granularity through this handle.
struct SharedWrite<'a, W> {
    inner: Rc<RefCell<&'a mut W>>,
}

impl<'a, W: io::Write> SharedWrite<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    fn flush_inner(&self) -> io::Result<()> {
        self.inner.borrow_mut().flush()
    }
}

impl<W> Clone for SharedWrite<'_, W> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<W: io::Write> io::Write for SharedWrite<'_, W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner.borrow_mut().write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.borrow_mut().flush()
    }
}
