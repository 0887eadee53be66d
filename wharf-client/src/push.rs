//! The push client: command computation, pack hand-off, report parsing.

use std::collections::{HashSet, VecDeque};
use std::io;

use wharf_hash::ObjectId;
use wharf_pktline::{encode, PacketLineRef, StreamingPeekableIter};
use wharf_serve_core::capabilities::CapabilitySet;
use wharf_serve_core::store::{ObjectDatabase, ObjectKind};

use crate::error::{Error, Result};
use crate::refs::read_advertisement;

/// The terminal state of one remote ref update.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Status {
    /// Not yet decided.
    #[default]
    NotAttempted,
    /// The command was sent; the report has not named it yet.
    AwaitingReport,
    /// The server applied the update.
    Ok,
    /// The remote ref already had the desired value.
    UpToDate,
    /// Refused: not a fast-forward and force was not set.
    RejectedNonFastForward,
    /// Refused: the remote ref moved since we last saw it.
    RejectedRemoteChanged,
    /// Refused for any other reason; the message tells why.
    RejectedOtherReason,
    /// A deletion of a ref the remote does not have.
    NonExisting,
}

/// One requested update of a remote ref.
#[derive(Debug, Clone)]
pub struct RemoteRefUpdate {
    /// The remote ref to update.
    pub remote_name: String,
    /// The new value; the null id deletes the ref.
    pub new_id: ObjectId,
    /// The remote value we insist on (`--force-with-lease`).
    pub expected_old: Option<ObjectId>,
    /// Allow non-fast-forward updates.
    pub force: bool,
    /// The terminal status.
    pub status: Status,
    /// The server's reason when rejected.
    pub message: String,
}

impl RemoteRefUpdate {
    /// Create a pending update.
    pub fn new(remote_name: impl Into<String>, new_id: ObjectId) -> Self {
        Self {
            remote_name: remote_name.into(),
            new_id,
            expected_old: None,
            force: false,
            status: Status::NotAttempted,
            message: String::new(),
        }
    }

    /// Request a forced update.
    pub fn with_force(mut self) -> Self {
        self.force = true;
        self
    }

    /// Insist on the remote's current value.
    pub fn with_expected_old(mut self, expected: ObjectId) -> Self {
        self.expected_old = Some(expected);
        self
    }
}

/// Client-side push configuration.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    /// Classify locally and skip the network write.
    pub dry_run: bool,
    /// Ask for all-or-nothing semantics.
    pub atomic: bool,
    /// `push-option` values for the server's hooks.
    pub push_options: Vec<String>,
    /// The agent string sent to the server.
    pub agent: Option<String>,
}

/// What one push accomplished.
#[derive(Debug, Default)]
pub struct PushResult {
    /// The per-ref updates with their terminal status.
    pub ref_updates: Vec<RemoteRefUpdate>,
    /// The `unpack <error>` message, when unpacking failed remotely.
    pub server_message: Option<String>,
}

impl PushResult {
    /// Whether every sent update succeeded.
    pub fn is_ok(&self) -> bool {
        self.server_message.is_none()
            && self
                .ref_updates
                .iter()
                .all(|u| matches!(u.status, Status::Ok | Status::UpToDate))
    }
}

/// Drives the client side of one push.
pub struct PushClient<'a, O> {
    odb: &'a O,
    options: PushOptions,
}

impl<'a, O: ObjectDatabase> PushClient<'a, O> {
    /// Create a client over the local object database.
    pub fn new(odb: &'a O, options: PushOptions) -> Self {
        Self { odb, options }
    }

    /// Run one push. `pack` is the serialized pack covering the closure
    /// of the new tips minus the remote's advertised history, produced by
    /// the local pack writer.
    pub fn run<R, W>(
        &mut self,
        input: R,
        mut output: W,
        mut updates: Vec<RemoteRefUpdate>,
        pack: &[u8],
    ) -> Result<PushResult>
    where
        R: io::Read,
        W: io::Write,
    {
        let mut input = StreamingPeekableIter::new(input, &[PacketLineRef::Flush], false);
        let advertisement = read_advertisement(&mut input)?;
        let server = &advertisement.capabilities;

        // Classify each update locally before anything is sent.
        let mut to_send: Vec<usize> = Vec::new();
        for (index, update) in updates.iter_mut().enumerate() {
            let advertised = advertisement
                .find(&update.remote_name)
                .and_then(|r| r.object_id());
            let old_id = advertised.unwrap_or(ObjectId::null(update.new_id.kind()));

            if update.new_id.is_null() {
                if advertised.is_none() {
                    update.status = Status::NonExisting;
                    continue;
                }
                if !server.delete_refs {
                    update.status = Status::RejectedOtherReason;
                    update.message = "server does not support deleting refs".into();
                    continue;
                }
            } else if advertised == Some(update.new_id) {
                update.status = Status::UpToDate;
                continue;
            }

            if let Some(expected) = update.expected_old {
                if Some(expected) != advertised && !(expected.is_null() && advertised.is_none()) {
                    update.status = Status::RejectedRemoteChanged;
                    update.message = "stale info".into();
                    continue;
                }
            }

            if !update.new_id.is_null()
                && !old_id.is_null()
                && !update.force
                && !self.is_ancestor(old_id, update.new_id)?
            {
                update.status = Status::RejectedNonFastForward;
                continue;
            }

            update.status = Status::AwaitingReport;
            to_send.push(index);
        }

        if self.options.dry_run || to_send.is_empty() {
            for index in &to_send {
                updates[*index].status = Status::Ok;
            }
            if !self.options.dry_run {
                // Nothing to send; terminate the session politely.
                encode::flush_to_write(&mut output)?;
                output.flush()?;
            }
            return Ok(PushResult {
                ref_updates: updates,
                server_message: None,
            });
        }

        let selection = self.select_capabilities(server);
        let caps = selection.encode(Default::default());
        let needs_pack = to_send.iter().any(|i| !updates[*i].new_id.is_null());

        for (position, index) in to_send.iter().enumerate() {
            let update = &updates[*index];
            let advertised = advertisement
                .find(&update.remote_name)
                .and_then(|r| r.object_id());
            let old_id = advertised.unwrap_or(ObjectId::null(update.new_id.kind()));
            let line = if position == 0 {
                format!("{old_id} {} {}\0{caps}", update.new_id, update.remote_name)
            } else {
                format!("{old_id} {} {}", update.new_id, update.remote_name)
            };
            encode::text_to_write(line.as_bytes(), &mut output)?;
        }
        encode::flush_to_write(&mut output)?;

        if needs_pack {
            output.write_all(pack)?;
        }
        if selection.push_options {
            for option in &self.options.push_options {
                encode::text_to_write(option.as_bytes(), &mut output)?;
            }
            encode::flush_to_write(&mut output)?;
        }
        output.flush()?;

        let mut result = PushResult {
            ref_updates: updates,
            server_message: None,
        };
        if selection.report_status {
            self.read_report(&mut input, &selection, &mut result)?;
        } else {
            // Without report-status, assume success.
            for update in result.ref_updates.iter_mut() {
                if update.status == Status::AwaitingReport {
                    update.status = Status::Ok;
                }
            }
        }
        Ok(result)
    }

    fn select_capabilities(&self, server: &CapabilitySet) -> CapabilitySet {
        CapabilitySet {
            report_status: server.report_status,
            side_band: server.side_band,
            delete_refs: server.delete_refs,
            ofs_delta: server.ofs_delta,
            atomic: server.atomic && self.options.atomic,
            push_options: server.push_options && !self.options.push_options.is_empty(),
            agent: self.options.agent.clone(),
            ..CapabilitySet::default()
        }
    }

    /// Translate `unpack`/`ok`/`ng` lines onto the per-ref updates.
    fn read_report<R: io::Read>(
        &self,
        input: &mut StreamingPeekableIter<R>,
        selection: &CapabilitySet,
        result: &mut PushResult,
    ) -> Result<()> {
        input.reset();
        let report_bytes = if selection.side_band.is_active() {
            // The report block itself travels on channel 1.
            let mut inner = Vec::new();
            io::Read::read_to_end(&mut input.as_read_with_sidebands(|_progress| {}), &mut inner)?;
            inner
        } else {
            let mut inner = Vec::new();
            io::Read::read_to_end(input.inner_mut(), &mut inner)?;
            inner
        };

        let mut lines = StreamingPeekableIter::new(io::Cursor::new(report_bytes), &[PacketLineRef::Flush], false);
        let mut saw_unpack = false;
        while let Some(line) = lines.read_line() {
            let line = line??;
            let Some(text) = line.as_text() else { continue };
            let text = std::str::from_utf8(text).map_err(|_| Error::protocol("report line is not UTF-8"))?;

            if let Some(status) = text.strip_prefix("unpack ") {
                if saw_unpack {
                    return Err(Error::protocol("duplicate unpack line"));
                }
                saw_unpack = true;
                if status != "ok" {
                    result.server_message = Some(status.to_owned());
                    for update in result.ref_updates.iter_mut() {
                        if update.status == Status::AwaitingReport {
                            update.status = Status::RejectedOtherReason;
                            update.message = format!("unpack failed: {status}");
                        }
                    }
                }
            } else if let Some(name) = text.strip_prefix("ok ") {
                if let Some(update) = result.ref_updates.iter_mut().find(|u| u.remote_name == name) {
                    update.status = Status::Ok;
                }
            } else if let Some(rest) = text.strip_prefix("ng ") {
                let (name, reason) = rest.split_once(' ').unwrap_or((rest, "rejected"));
                if let Some(update) = result.ref_updates.iter_mut().find(|u| u.remote_name == name) {
                    update.status = match reason {
                        "non-fast-forward" => Status::RejectedNonFastForward,
                        _ => Status::RejectedOtherReason,
                    };
                    update.message = reason.to_owned();
                }
            } else {
                return Err(Error::protocol(format!("unexpected report line '{text}'")));
            }
        }
        if !saw_unpack {
            return Err(Error::protocol("report carried no unpack line"));
        }
        Ok(())
    }

    /// Whether `ancestor` is reachable from `tip` in the local repository.
    fn is_ancestor(&self, ancestor: ObjectId, tip: ObjectId) -> Result<bool> {
        if ancestor == tip {
            return Ok(true);
        }
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([tip]);
        while let Some(id) = queue.pop_front() {
            if !visited.insert(id) {
                continue;
            }
            if id == ancestor {
                return Ok(true);
            }
            let Some(info) = self.odb.info(&id)? else {
                // Unknown history, e.g. the remote is ahead of us.
                continue;
            };
            if info.kind == ObjectKind::Commit {
                queue.extend(info.parents());
            }
        }
        Ok(false)
    }
}
