//! The receive-pack session driver.
//!
//! Phases are strictly sequential: ADVERTISE, COMMAND (with an optional
//! push certificate), PACK, VALIDATE, CONNECTIVITY, EXECUTE, REPORT,
//! UNLOCK. Exactly one push is permitted per connection.

use std::collections::{HashSet, VecDeque};
use std::io;

use wharf_hash::ObjectId;
use wharf_pktline::{encode, PacketLineRef, StreamingPeekableIter};
use wharf_serve_core::advertise::Advertiser;
use wharf_serve_core::capabilities::CapabilitySet;
use wharf_serve_core::progress::{NoopMonitor, ProgressMonitor, SideBandProgressMonitor};
use wharf_serve_core::protocol::SessionOptions;
use wharf_serve_core::store::{ObjectDatabase, ObjectKind, RefDatabase, RefEdit, StoreError};
use wharf_serve_core::visibility::{RefRecord, VisibleRoots};

use crate::cert::{NonceVerification, PushCertificate, PushCertificateParser};
use crate::commands::{CommandKind, CommandList, CommandResult, ReceiveCommand};
use crate::connectivity::{ConnectivityChecker, FullConnectivityChecker, IterativeConnectivityChecker, PackContents};
use crate::error::{Error, Result};
use crate::options::ReceiveOptions;
use crate::pack::{LockGuard, PackIngestor};
use crate::report;

/// Everything a finished session produced, for callers that audit pushes.
#[derive(Debug, Default)]
pub struct ReceiveOutcome {
    /// All commands with their terminal results.
    pub commands: Vec<ReceiveCommand>,
    /// The push certificate, when one was sent.
    pub certificate: Option<PushCertificate>,
    /// Push options, in wire order.
    pub push_options: Vec<String>,
    /// The unpack failure reported to the client, if any.
    pub unpack_error: Option<String>,
}

/// The server side of one push session.
pub struct ReceivePack<'a, O, D> {
    odb: &'a O,
    refs: &'a mut D,
    options: ReceiveOptions,
    session: SessionOptions,
    executed: bool,
}

impl<'a, O, D> ReceivePack<'a, O, D>
where
    O: ObjectDatabase,
    D: RefDatabase,
{
    /// Create an engine over the given storage collaborators.
    pub fn new(odb: &'a O, refs: &'a mut D, options: ReceiveOptions) -> Self {
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

    /// Run one complete session.
    pub fn run<In, Out>(
        &mut self,
        input: In,
        mut output: Out,
        ingestor: &mut dyn PackIngestor,
    ) -> Result<ReceiveOutcome>
    where
        In: io::Read,
        Out: io::Write,
    {
        if self.executed {
            return Err(Error::OperationAlreadyExecuted);
        }
        self.executed = true;

        let advertised = VisibleRoots::new(&*self.refs, self.options.hidden.clone()).collect()?;

        let mut caps = self.options.capabilities.clone();
        let sent_nonce = match &self.options.signed_push {
            Some(signed) => {
                let nonce = signed.generator.generate();
                caps.push_cert = Some(nonce.clone());
                nonce
            }
            None => String::new(),
        };

        let mut advertiser = Advertiser::new(&mut output).with_object_format(self.options.object_format);
        advertiser
            .write_advertisement(&advertised, &caps, &self.options.advertise_hook)
            .map_err(|e| Error::Validation(e.to_string()))?;

        let mut input = StreamingPeekableIter::new(input, &[PacketLineRef::Flush], false);
        let (mut list, certificate) = self.read_commands(&mut input, &sent_nonce)?;

        if list.commands.is_empty() && certificate.is_none() {
            tracing::debug!("client sent no commands");
            return Ok(ReceiveOutcome::default());
        }
        self.options
            .capabilities
            .validate_selection(&list.capabilities)
            .map_err(Error::Validation)?;

        let certificate = self.reconcile_certificate(&mut list, certificate)?;
        let mut commands = std::mem::take(&mut list.commands);
        let selection = list.capabilities;

        // PACK: read the incoming objects while holding the .keep lock.
        let mut unpack_error = None;
        let mut guard = LockGuard::default();
        let mut pack = PackContents::default();
        if commands.iter().any(|c| c.kind() != CommandKind::Delete) {
            ingestor.set_lock_message(&self.options.lock_message);
            let raw = input.inner_mut();
            let use_progress = selection.side_band.is_active() && !selection.quiet && !selection.no_progress;
            let ingested = if use_progress {
                let mut progress = SideBandProgressMonitor::new(&mut output);
                ingestor.ingest(raw, &mut progress)
            } else {
                ingestor.ingest(raw, &mut NoopMonitor)
            };
            match ingested {
                Ok(ingested) => {
                    guard = LockGuard::new(ingested.lock);
                    pack.new_objects = ingested.new_objects.into_iter().collect();
                    pack.external_bases = ingested.external_bases;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "pack ingestion failed");
                    unpack_error = Some(e.to_string());
                }
            }
        }

        // Push options follow the pack and precede execution.
        let mut push_options = Vec::new();
        if selection.push_options {
            input.reset();
            while let Some(line) = input.read_line() {
                let line = line??;
                let text = line
                    .as_text()
                    .ok_or_else(|| Error::protocol("unexpected control packet in push options"))?;
                push_options.push(String::from_utf8_lossy(text).into_owned());
            }
        }

        if self.session.is_cancelled() {
            let _ = encode::error_to_write(b"fatal: session cancelled\n", &mut output);
            return Err(Error::Cancelled);
        }

        // VALIDATE, CONNECTIVITY, hooks, EXECUTE.
        self.validate(&mut commands, &certificate, unpack_error.as_deref())?;
        self.abort_if_atomic(&selection, &mut commands);

        if unpack_error.is_none() && commands.iter().any(|c| c.is_pending()) {
            self.check_connectivity(&mut commands, &advertised, &pack)?;
            self.abort_if_atomic(&selection, &mut commands);
        }

        if commands.iter().any(ReceiveCommand::is_pending) {
            if let Err(message) = self.options.pre_receive.invoke(&mut commands, &push_options) {
                tracing::debug!(message = %message, "pre-receive hook rejected the batch");
                for command in commands.iter_mut().filter(|c| c.is_pending()) {
                    command.set_result(CommandResult::RejectedOtherReason, message.clone());
                }
            }
            self.abort_if_atomic(&selection, &mut commands);
        }

        self.execute(&mut commands, &selection)?;

        // P2: nothing may end the session undecided.
        for command in commands.iter_mut().filter(|c| c.is_pending()) {
            command.set_result(CommandResult::RejectedOtherReason, "internal error");
        }

        if selection.report_status {
            report::write_report(&mut output, unpack_error.as_deref(), &commands, selection.side_band)?;
        }

        if let Err(e) = guard.unlock() {
            tracing::warn!(error = %e, "failed to release pack lock");
        }
        if unpack_error.is_some() || !commands.iter().any(ReceiveCommand::is_ok) {
            ingestor.abandon();
        }

        let succeeded: Vec<ReceiveCommand> = commands.iter().filter(|c| c.is_ok()).cloned().collect();
        if !succeeded.is_empty() {
            self.options.post_receive.invoke(&succeeded, &push_options);
        }

        Ok(ReceiveOutcome {
            commands,
            certificate,
            push_options,
            unpack_error,
        })
    }

    /// COMMAND phase: plain command lines, an optional certificate block
    /// framed by `push-cert`/`push-cert-end`, until the flush.
    fn read_commands<In: io::Read>(
        &self,
        input: &mut StreamingPeekableIter<In>,
        sent_nonce: &str,
    ) -> Result<(CommandList, Option<PushCertificate>)> {
        let mut list = CommandList::default();
        let mut certificate = None;
        let mut cert_parser: Option<PushCertificateParser<'_>> = None;

        while let Some(line) = input.read_line() {
            let line = line??;
            let text = line
                .as_text()
                .ok_or_else(|| Error::protocol("unexpected control packet in command phase"))?;
            let text = std::str::from_utf8(text)
                .map_err(|_| Error::protocol("command line is not valid UTF-8"))?;

            if cert_parser.is_some() {
                if text == "push-cert-end" {
                    let parser = cert_parser.take().expect("checked above");
                    certificate = Some(parser.finish()?);
                } else {
                    cert_parser.as_mut().expect("checked above").feed(text)?;
                }
                continue;
            }

            let (head, caps_tail) = match text.split_once('\0') {
                Some((head, tail)) => (head, Some(tail)),
                None => (text, None),
            };
            if head == "push-cert" {
                if certificate.is_some() {
                    return Err(Error::protocol("duplicate push certificate"));
                }
                if let Some(tail) = caps_tail {
                    if list.commands.is_empty() {
                        list.capabilities = CapabilitySet::parse(tail);
                    }
                }
                cert_parser = Some(PushCertificateParser::new(self.options.signed_push.as_ref().map(
                    |signed| NonceVerification {
                        generator: &signed.generator,
                        sent: sent_nonce.to_owned(),
                        allow_slop: signed.allow_slop,
                        slop_seconds: signed.slop_seconds,
                    },
                )));
                continue;
            }

            list.parse_line(text, self.options.object_format)?;
        }
        if cert_parser.is_some() {
            return Err(Error::Certificate("certificate not terminated".into()));
        }
        Ok((list, certificate))
    }

    /// The certificate's command block must match the command phase; when
    /// the client sent only a certificate, its lines become the commands.
    fn reconcile_certificate(
        &self,
        list: &mut CommandList,
        certificate: Option<PushCertificate>,
    ) -> Result<Option<PushCertificate>> {
        let Some(certificate) = certificate else {
            return Ok(None);
        };
        if list.commands.is_empty() {
            for line in &certificate.commands {
                list.parse_line(line, self.options.object_format)?;
            }
        } else {
            let phase: Vec<String> = list.commands.iter().map(ReceiveCommand::to_wire_line).collect();
            if phase != certificate.commands {
                return Err(Error::Certificate(
                    "certificate commands do not match the command phase".into(),
                ));
            }
        }
        Ok(Some(certificate))
    }

    fn validate(
        &self,
        commands: &mut [ReceiveCommand],
        certificate: &Option<PushCertificate>,
        unpack_error: Option<&str>,
    ) -> Result<()> {
        if unpack_error.is_some() {
            for command in commands.iter_mut() {
                command.set_result(CommandResult::RejectedOtherReason, "unpacker error");
            }
            return Ok(());
        }

        if let Some(cert) = certificate {
            if !cert.nonce_status.is_accepted() {
                tracing::warn!(status = ?cert.nonce_status, "rejecting push with bad nonce");
                for command in commands.iter_mut() {
                    command.set_result(CommandResult::RejectedOtherReason, "invalid nonce");
                }
                return Ok(());
            }
        }

        let checked_out = self.refs.checked_out_branch()?;
        for command in commands.iter_mut() {
            let current = self.refs.find(&command.name)?.and_then(|r| r.object_id());
            match command.kind() {
                CommandKind::Delete => {
                    if self.options.deny_deletes {
                        command.set_result(CommandResult::RejectedNoDelete, "");
                        continue;
                    }
                    if checked_out.as_deref() == Some(command.name.as_str()) && !self.options.allow_current_branch {
                        command.set_result(CommandResult::RejectedCurrentBranch, "");
                        continue;
                    }
                    match current {
                        None => {
                            command.set_result(CommandResult::RejectedOtherReason, "no such ref");
                        }
                        Some(current) if current != command.old_id => {
                            command.set_result(CommandResult::LockFailure, "invalid old id sent");
                        }
                        Some(_) => {}
                    }
                }
                CommandKind::Create => {
                    if self.options.deny_creates {
                        command.set_result(CommandResult::RejectedNoCreate, "");
                        continue;
                    }
                    if current.is_some() {
                        command.set_result(CommandResult::LockFailure, "ref exists");
                        continue;
                    }
                    if !self.odb.contains(&command.new_id) {
                        command.set_result(CommandResult::RejectedMissingObject, "");
                    }
                }
                CommandKind::Update | CommandKind::UpdateNonFastForward => {
                    if checked_out.as_deref() == Some(command.name.as_str()) && !self.options.allow_current_branch {
                        command.set_result(CommandResult::RejectedCurrentBranch, "");
                        continue;
                    }
                    match current {
                        None => {
                            command.set_result(CommandResult::LockFailure, "no such ref");
                            continue;
                        }
                        Some(current) if current != command.old_id => {
                            command.set_result(CommandResult::LockFailure, "invalid old id sent");
                            continue;
                        }
                        Some(_) => {}
                    }
                    if !self.odb.contains(&command.new_id) {
                        command.set_result(CommandResult::RejectedMissingObject, "");
                        continue;
                    }
                    if !is_fast_forward(self.odb, command.old_id, command.new_id)? {
                        command.mark_non_fast_forward();
                        if self.options.deny_non_fast_forwards {
                            command.set_result(CommandResult::RejectedNonFastForward, "");
                        }
                    }
                }
            }
        }
        Ok(())
    }

    /// Atomic mode: one rejection fails the whole batch.
    fn abort_if_atomic(&self, selection: &CapabilitySet, commands: &mut [ReceiveCommand]) {
        if !selection.atomic {
            return;
        }
        let any_rejected = commands.iter().any(|c| !c.is_pending() && !c.is_ok());
        if any_rejected {
            for command in commands.iter_mut().filter(|c| c.is_pending()) {
                command.set_result(CommandResult::RejectedOtherReason, "transaction aborted");
            }
        }
    }

    fn check_connectivity(
        &self,
        commands: &mut [ReceiveCommand],
        advertised: &[RefRecord],
        pack: &PackContents,
    ) -> Result<()> {
        let haves: HashSet<ObjectId> = advertised
            .iter()
            .flat_map(|r| r.object_id().into_iter().chain(r.peeled))
            .collect();

        let full = FullConnectivityChecker {
            strict: self.options.check_referenced_objects_reachable,
        };
        let pending: Vec<ReceiveCommand> = commands.iter().filter(|c| c.is_pending()).cloned().collect();
        let verdict = if self.options.iterative_connectivity {
            IterativeConnectivityChecker::new(full).check_commands(self.odb, &pending, &haves, pack)
        } else {
            let tips: Vec<ObjectId> = pending
                .iter()
                .filter(|c| c.kind() != CommandKind::Delete)
                .map(|c| c.new_id)
                .collect();
            let complete: Vec<ObjectId> = haves.iter().copied().collect();
            let mut full = full;
            full.check(self.odb, &tips, &complete, pack)
        };

        match verdict {
            Ok(()) => Ok(()),
            Err(Error::MissingObject { oid }) => {
                tracing::warn!(oid = %oid, "connectivity check failed");
                for command in commands
                    .iter_mut()
                    .filter(|c| c.is_pending() && c.kind() != CommandKind::Delete)
                {
                    command.set_result(CommandResult::RejectedMissingObject, "");
                }
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    fn execute(&mut self, commands: &mut [ReceiveCommand], selection: &CapabilitySet) -> Result<()> {
        let edits: Vec<(usize, RefEdit)> = commands
            .iter()
            .enumerate()
            .filter(|(_, c)| c.is_pending())
            .map(|(i, c)| {
                let expected = if c.kind() == CommandKind::Create {
                    ObjectId::null(self.options.object_format)
                } else {
                    c.old_id
                };
                let new = (c.kind() != CommandKind::Delete).then_some(c.new_id);
                (
                    i,
                    RefEdit {
                        name: c.name.clone(),
                        expected_old: Some(expected),
                        new,
                    },
                )
            })
            .collect();
        if edits.is_empty() {
            return Ok(());
        }

        if selection.atomic && self.refs.supports_transactions() {
            let batch: Vec<RefEdit> = edits.iter().map(|(_, e)| e.clone()).collect();
            match self.refs.apply_all(&batch) {
                Ok(()) => {
                    for (index, _) in &edits {
                        commands[*index].set_result(CommandResult::Ok, "");
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "atomic ref transaction failed");
                    for (index, _) in &edits {
                        commands[*index].set_result(CommandResult::LockFailure, e.to_string());
                    }
                }
            }
            return Ok(());
        }

        for (index, edit) in &edits {
            match self.refs.apply(edit) {
                Ok(()) => commands[*index].set_result(CommandResult::Ok, ""),
                Err(StoreError::RefUpdateRefused(message)) => {
                    commands[*index].set_result(CommandResult::LockFailure, message);
                }
                Err(e) => {
                    commands[*index].set_result(CommandResult::LockFailure, e.to_string());
                }
            }
        }
        Ok(())
    }
}

/// Maximum commits examined when testing ancestry; a deeper walk is
/// treated as non-fast-forward.
const MAX_TRAVERSAL_DEPTH: usize = 1000;

/// Check whether `new` descends from `old` by walking `new`'s ancestry.
pub fn is_fast_forward<O: ObjectDatabase>(odb: &O, old: ObjectId, new: ObjectId) -> Result<bool> {
    if old == new || old.is_null() || new.is_null() {
        return Ok(true);
    }
    let mut visited = HashSet::new();
    let mut queue = VecDeque::from([new]);
    let mut steps = 0usize;
    while let Some(id) = queue.pop_front() {
        if steps >= MAX_TRAVERSAL_DEPTH {
            return Ok(false);
        }
        steps += 1;
        if !visited.insert(id) {
            continue;
        }
        if id == old {
            return Ok(true);
        }
        let Some(info) = odb.info(&id)? else { continue };
        if info.kind != ObjectKind::Commit {
            continue;
        }
        queue.extend(info.parents());
    }
    Ok(false)
}
