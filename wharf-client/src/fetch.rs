//! The fetch client: mirror image of the upload-pack state machine.

use std::io;

use wharf_hash::ObjectId;
use wharf_pktline::{encode, progress::ProgressParser, PacketLineRef, StreamingPeekableIter};
use wharf_serve_core::capabilities::{CapabilitySet, MultiAckMode};
use wharf_serve_core::pack::{LockGuard, PackIngestor};
use wharf_serve_core::progress::{NoopMonitor, ProgressMonitor};
use wharf_serve_core::store::{ObjectDatabase, RefDatabase, RefEdit};
use wharf_serve_core::visibility::RefRecord;

use crate::error::{Error, Result};
use crate::refs::{read_advertisement, Advertisement};
use crate::refspec::RefSpec;

/// The maximum number of `have` lines offered before `done`.
const MAX_HAVES: usize = 256;

/// Client-side fetch configuration.
#[derive(Debug, Clone, Default)]
pub struct FetchOptions {
    /// Request a shallow history of this depth; 0 fetches everything.
    pub depth: u32,
    /// Accept thin packs.
    pub thin_pack: bool,
    /// Ask for annotated tags pointing into the pack.
    pub include_tag: bool,
    /// Suppress server progress.
    pub no_progress: bool,
    /// The agent string sent to the server.
    pub agent: Option<String>,
}

/// One tracking ref moved by a fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRefUpdate {
    /// The local tracking ref, e.g. `refs/remotes/origin/main`.
    pub local_name: String,
    /// The remote ref it follows.
    pub remote_name: String,
    /// The tracking ref's previous value.
    pub old_id: Option<ObjectId>,
    /// Its value after the fetch.
    pub new_id: ObjectId,
}

/// What one fetch accomplished.
#[derive(Debug, Default)]
pub struct FetchResult {
    /// Tracking refs updated in the local ref database.
    pub tracking_updates: Vec<TrackingRefUpdate>,
    /// Commits that became shallow locally.
    pub shallow: Vec<ObjectId>,
    /// Commits that stopped being shallow locally.
    pub unshallow: Vec<ObjectId>,
    /// True when the remote had nothing we wanted.
    pub up_to_date: bool,
}

/// Drives the client side of one fetch.
pub struct FetchClient<'a, O, D> {
    odb: &'a O,
    refs: &'a mut D,
    options: FetchOptions,
}

impl<'a, O, D> FetchClient<'a, O, D>
where
    O: ObjectDatabase,
    D: RefDatabase,
{
    /// Create a client over the local object and ref databases.
    pub fn new(odb: &'a O, refs: &'a mut D, options: FetchOptions) -> Self {
        Self { odb, refs, options }
    }

    /// Run one fetch over the duplex transport stream.
    pub fn run<R, W>(
        &mut self,
        input: R,
        mut output: W,
        refspecs: &[RefSpec],
        ingestor: &mut dyn PackIngestor,
        progress: &mut dyn ProgressMonitor,
    ) -> Result<FetchResult>
    where
        R: io::Read,
        W: io::Write,
    {
        let mut input = StreamingPeekableIter::new(input, &[PacketLineRef::Flush], false);
        let advertisement = read_advertisement(&mut input)?;
        if let Some(agent) = &advertisement.capabilities.agent {
            tracing::debug!(remote_agent = %agent, "connected");
        }

        // Map refspecs over the advertisement.
        let mut mappings: Vec<(RefRecord, String)> = Vec::new();
        for record in &advertisement.refs {
            for spec in refspecs {
                if let Some(dst) = spec.destination(&record.name) {
                    mappings.push((record.clone(), dst));
                    break;
                }
            }
        }

        let wants: Vec<ObjectId> = {
            let mut wants: Vec<ObjectId> = mappings
                .iter()
                .filter_map(|(record, _)| record.object_id())
                .filter(|id| !self.odb.contains(id))
                .collect();
            wants.sort_unstable();
            wants.dedup();
            wants
        };

        if wants.is_empty() {
            // Nothing to transfer; tell the server we are done.
            encode::flush_to_write(&mut output)?;
            output.flush()?;
            let tracking_updates = self.apply_tracking(&mappings)?;
            return Ok(FetchResult {
                tracking_updates,
                up_to_date: true,
                ..Default::default()
            });
        }

        let selection = self.select_capabilities(&advertisement);
        self.send_wants(&mut output, &wants, &selection)?;

        let mut result = FetchResult::default();
        if selection.shallow {
            // Only sent when we asked to deepen.
            self.read_shallow_section(&mut input, &mut result)?;
        }

        self.negotiate(&mut input, &mut output, &selection)?;

        // The pack body follows the final ACK or NAK. With side-band on,
        // channel 2 drives the caller's monitor and the ingestor sees a
        // muted one.
        let mut guard = LockGuard::default();
        {
            let mut parser = ProgressParser::new();
            let ingested = if selection.side_band.is_active() {
                let mut reader = input.as_read_with_sidebands(|bytes| {
                    for event in parser.feed(bytes) {
                        if let wharf_pktline::progress::ProgressEvent::Counter {
                            task,
                            current,
                            total,
                            starts_task,
                        } = event
                        {
                            if starts_task {
                                progress.begin_task(&task, total);
                            }
                            progress.update(current);
                        }
                    }
                });
                ingestor.ingest(&mut reader, &mut NoopMonitor)
            } else {
                ingestor.ingest(input.inner_mut(), progress)
            };
            match ingested {
                Ok(ingested) => guard = LockGuard::new(ingested.lock),
                Err(e) => return Err(Error::Pack(e.to_string())),
            }
        }

        result.tracking_updates = self.apply_tracking(&mappings)?;
        if let Err(e) = guard.unlock() {
            tracing::warn!(error = %e, "failed to release pack lock");
        }
        Ok(result)
    }

    fn select_capabilities(&self, advertisement: &Advertisement) -> CapabilitySet {
        let server = &advertisement.capabilities;
        let mut selection = CapabilitySet {
            multi_ack: server.multi_ack,
            side_band: server.side_band,
            ofs_delta: server.ofs_delta,
            thin_pack: server.thin_pack && self.options.thin_pack,
            include_tag: server.include_tag && self.options.include_tag,
            no_progress: server.no_progress && self.options.no_progress,
            agent: self.options.agent.clone(),
            ..CapabilitySet::default()
        };
        // A server that cannot deepen simply gets no shallow lines and
        // serves full history.
        selection.shallow = server.shallow && self.options.depth > 0;
        selection
    }

    fn send_wants<W: io::Write>(
        &self,
        output: &mut W,
        wants: &[ObjectId],
        selection: &CapabilitySet,
    ) -> Result<()> {
        let caps = selection.encode(Default::default());
        for (i, want) in wants.iter().enumerate() {
            let line = if i == 0 {
                format!("want {want} {caps}")
            } else {
                format!("want {want}")
            };
            encode::text_to_write(line.as_bytes(), output)?;
        }
        if selection.shallow && self.options.depth > 0 {
            encode::text_to_write(format!("deepen {}", self.options.depth).as_bytes(), output)?;
        }
        encode::flush_to_write(output)?;
        output.flush()?;
        Ok(())
    }

    fn read_shallow_section<R: io::Read>(
        &self,
        input: &mut StreamingPeekableIter<R>,
        result: &mut FetchResult,
    ) -> Result<()> {
        input.reset();
        while let Some(line) = input.read_line() {
            let line = line??;
            let text = line
                .as_text()
                .ok_or_else(|| Error::protocol("unexpected control packet in shallow section"))?;
            let text = std::str::from_utf8(text).map_err(|_| Error::protocol("shallow line is not UTF-8"))?;
            if let Some(hex) = text.strip_prefix("shallow ") {
                result.shallow.push(parse_oid(hex)?);
            } else if let Some(hex) = text.strip_prefix("unshallow ") {
                result.unshallow.push(parse_oid(hex)?);
            } else {
                return Err(Error::protocol(format!("unexpected line '{text}' in shallow section")));
            }
        }
        Ok(())
    }

    /// Offer local tips as haves, send `done`, and consume ACK/NAK lines
    /// until the line that precedes the pack.
    fn negotiate<R, W>(
        &self,
        input: &mut StreamingPeekableIter<R>,
        output: &mut W,
        selection: &CapabilitySet,
    ) -> Result<()>
    where
        R: io::Read,
        W: io::Write,
    {
        let mut haves: Vec<ObjectId> = self
            .refs
            .refs()?
            .iter()
            .filter_map(RefRecord::object_id)
            .collect();
        haves.sort_unstable();
        haves.dedup();
        haves.truncate(MAX_HAVES);

        for have in &haves {
            encode::text_to_write(format!("have {have}").as_bytes(), output)?;
        }
        encode::text_to_write(b"done", output)?;
        output.flush()?;

        input.reset();
        loop {
            let Some(line) = input.read_line() else {
                return Err(Error::protocol("connection closed during negotiation"));
            };
            let line = line??;
            let text = line
                .as_text()
                .ok_or_else(|| Error::protocol("unexpected control packet in negotiation"))?;
            let text = std::str::from_utf8(text).map_err(|_| Error::protocol("ack line is not UTF-8"))?;

            if text == "NAK" {
                break;
            }
            let Some(rest) = text.strip_prefix("ACK ") else {
                return Err(Error::protocol(format!("unexpected line '{text}' in negotiation")));
            };
            match rest.split_once(' ') {
                // `ACK <oid> common|continue|ready`: negotiation goes on.
                Some((_oid, status)) => {
                    if selection.multi_ack == MultiAckMode::None {
                        tracing::warn!(status = %status, "multi-ack status without multi_ack");
                    }
                }
                // Final `ACK <oid>`: the pack follows.
                None => break,
            }
        }
        Ok(())
    }

    fn apply_tracking(&mut self, mappings: &[(RefRecord, String)]) -> Result<Vec<TrackingRefUpdate>> {
        let mut updates = Vec::new();
        for (record, dst) in mappings {
            let Some(new_id) = record.object_id() else { continue };
            let old_id = self.refs.find(dst)?.and_then(|r| r.object_id());
            if old_id == Some(new_id) {
                continue;
            }
            self.refs.apply(&RefEdit {
                name: dst.clone(),
                expected_old: None,
                new: Some(new_id),
            })?;
            updates.push(TrackingRefUpdate {
                local_name: dst.clone(),
                remote_name: record.name.clone(),
                old_id,
                new_id,
            });
        }
        Ok(updates)
    }
}

fn parse_oid(hex: &str) -> Result<ObjectId> {
    ObjectId::from_hex(hex.trim().as_bytes()).map_err(|_| Error::protocol(format!("invalid object id '{hex}'")))
}
