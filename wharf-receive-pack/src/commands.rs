//! Reference update commands as sent by the push client.

use wharf_hash::{Kind, ObjectId};
use wharf_serve_core::capabilities::CapabilitySet;

use crate::error::{Error, Result};

/// The type of a command, derived from its old and new ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandKind {
    /// old is zero: create the ref.
    Create,
    /// new is zero: delete the ref.
    Delete,
    /// Both non-zero and new descends from old.
    Update,
    /// Both non-zero and new does not descend from old.
    UpdateNonFastForward,
}

/// The terminal result of one command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum CommandResult {
    /// Not yet decided.
    #[default]
    NotAttempted,
    /// The update was applied.
    Ok,
    /// Creation is disabled by policy.
    RejectedNoCreate,
    /// Deletion is disabled by policy.
    RejectedNoDelete,
    /// Non-fast-forward without force.
    RejectedNonFastForward,
    /// The ref is checked out in a working tree.
    RejectedCurrentBranch,
    /// The new tip's closure is incomplete.
    RejectedMissingObject,
    /// Any other refusal; the message tells why.
    RejectedOtherReason,
    /// The ref database could not lock or move the ref.
    LockFailure,
}

impl CommandResult {
    /// The `ng` reason token used in the status report.
    pub fn report_reason<'a>(&self, message: &'a str) -> &'a str {
        if !message.is_empty() {
            return message;
        }
        match self {
            CommandResult::NotAttempted => "not attempted",
            CommandResult::Ok => "",
            CommandResult::RejectedNoCreate => "creation prohibited",
            CommandResult::RejectedNoDelete => "deletion prohibited",
            CommandResult::RejectedNonFastForward => "non-fast-forward",
            CommandResult::RejectedCurrentBranch => "branch is currently checked out",
            CommandResult::RejectedMissingObject => "missing necessary objects",
            CommandResult::RejectedOtherReason => "rejected",
            CommandResult::LockFailure => "failed to lock",
        }
    }
}

/// One `(old, new, name)` update owned by the receive engine for the
/// duration of the session.
#[derive(Debug, Clone)]
pub struct ReceiveCommand {
    /// The value the client believes the ref has now.
    pub old_id: ObjectId,
    /// The requested new value.
    pub new_id: ObjectId,
    /// The fully qualified ref name.
    pub name: String,
    kind: CommandKind,
    result: CommandResult,
    message: String,
}

impl ReceiveCommand {
    /// Create a command, deriving its kind from the ids.
    pub fn new(old_id: ObjectId, new_id: ObjectId, name: impl Into<String>) -> Result<Self> {
        let kind = match (old_id.is_null(), new_id.is_null()) {
            (true, true) => {
                return Err(Error::Validation("both old and new are zero".into()));
            }
            (true, false) => CommandKind::Create,
            (false, true) => CommandKind::Delete,
            (false, false) => CommandKind::Update,
        };
        Ok(Self {
            old_id,
            new_id,
            name: name.into(),
            kind,
            result: CommandResult::NotAttempted,
            message: String::new(),
        })
    }

    /// The command's type.
    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    /// Reclassify an update as non-fast-forward once ancestry is known.
    pub fn mark_non_fast_forward(&mut self) {
        if self.kind == CommandKind::Update {
            self.kind = CommandKind::UpdateNonFastForward;
        }
    }

    /// The current result.
    pub fn result(&self) -> &CommandResult {
        &self.result
    }

    /// The human-readable rejection message, if any.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether no decision has been made yet.
    pub fn is_pending(&self) -> bool {
        self.result == CommandResult::NotAttempted
    }

    /// Whether the command ended in `Ok`.
    pub fn is_ok(&self) -> bool {
        self.result == CommandResult::Ok
    }

    /// Record the terminal result. Once set, later calls are ignored: a
    /// result other than `NotAttempted` is final for this request.
    pub fn set_result(&mut self, result: CommandResult, message: impl Into<String>) {
        if self.result != CommandResult::NotAttempted {
            debug_assert!(false, "command result is terminal");
            return;
        }
        self.result = result;
        self.message = message.into();
    }

    /// A hook may demote an `Ok`-bound pending command, but never
    /// re-promote a rejected one.
    pub fn demote(&mut self, result: CommandResult, message: impl Into<String>) {
        if self.is_pending() {
            self.set_result(result, message);
        }
    }

    /// The line this command had in the command phase, as signed input for
    /// push certificates.
    pub fn to_wire_line(&self) -> String {
        format!("{} {} {}", self.old_id, self.new_id, self.name)
    }
}

/// The outcome of parsing the command phase.
#[derive(Debug, Default)]
pub struct CommandList {
    /// The parsed commands, in wire order.
    pub commands: Vec<ReceiveCommand>,
    /// The capability selection from the first command line.
    pub capabilities: CapabilitySet,
}

impl CommandList {
    /// Parse one `<old> <new> <refname>[\0caps]` line.
    ///
    /// The capability tail is only honored on the first line.
    pub fn parse_line(&mut self, line: &str, object_format: Kind) -> Result<()> {
        let (command, caps) = match line.split_once('\0') {
            Some((command, caps)) => (command, Some(caps)),
            None => (line, None),
        };
        if let Some(caps) = caps {
            if self.commands.is_empty() {
                self.capabilities = CapabilitySet::parse(caps);
            }
        }

        let mut parts = command.split(' ');
        let old = parts
            .next()
            .ok_or_else(|| Error::protocol("missing old id"))?;
        let new = parts
            .next()
            .ok_or_else(|| Error::protocol("missing new id"))?;
        let name = parts
            .next()
            .ok_or_else(|| Error::protocol("missing refname"))?;
        if parts.next().is_some() {
            return Err(Error::protocol("unexpected token after refname"));
        }
        if name.is_empty() {
            return Err(Error::protocol("empty refname"));
        }

        let old_id = parse_id(old, object_format)?;
        let new_id = parse_id(new, object_format)?;
        self.commands.push(ReceiveCommand::new(old_id, new_id, name)?);
        Ok(())
    }

    /// Whether any command transfers objects (i.e. is not a delete).
    pub fn needs_pack(&self) -> bool {
        self.commands.iter().any(|c| c.kind() != CommandKind::Delete)
    }
}

fn parse_id(hex: &str, object_format: Kind) -> Result<ObjectId> {
    if hex.len() != object_format.len_in_hex() {
        return Err(Error::protocol(format!(
            "object id '{hex}' does not match the {} format",
            object_format.name()
        )));
    }
    ObjectId::from_hex(hex.as_bytes()).map_err(|_| Error::protocol(format!("invalid object id '{hex}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn oid(hex40: &str) -> ObjectId {
        ObjectId::from_hex(hex40.as_bytes()).expect("valid hex")
    }

    const ZERO: &str = "0000000000000000000000000000000000000000";
    const A: &str = "1111111111111111111111111111111111111111";
    const B: &str = "2222222222222222222222222222222222222222";

    #[test]
    fn kinds_derive_from_ids() {
        let create = ReceiveCommand::new(oid(ZERO), oid(A), "refs/heads/a").unwrap();
        assert_eq!(create.kind(), CommandKind::Create);
        let delete = ReceiveCommand::new(oid(A), oid(ZERO), "refs/heads/a").unwrap();
        assert_eq!(delete.kind(), CommandKind::Delete);
        let update = ReceiveCommand::new(oid(A), oid(B), "refs/heads/a").unwrap();
        assert_eq!(update.kind(), CommandKind::Update);

        assert!(ReceiveCommand::new(oid(ZERO), oid(ZERO), "refs/heads/a").is_err());
    }

    #[test]
    fn results_are_terminal() {
        let mut cmd = ReceiveCommand::new(oid(A), oid(B), "refs/heads/a").unwrap();
        assert!(cmd.is_pending());
        cmd.set_result(CommandResult::RejectedNonFastForward, "");
        // A demotion attempt after the fact changes nothing.
        cmd.demote(CommandResult::RejectedOtherReason, "hook says no");
        assert_eq!(*cmd.result(), CommandResult::RejectedNonFastForward);
    }

    #[test]
    fn first_line_capabilities_are_parsed() {
        let mut list = CommandList::default();
        list.parse_line(
            &format!("{ZERO} {A} refs/heads/main\0report-status side-band-64k agent=git/2.43.0"),
            Kind::Sha1,
        )
        .unwrap();
        list.parse_line(&format!("{A} {B} refs/heads/dev"), Kind::Sha1).unwrap();

        assert_eq!(list.commands.len(), 2);
        assert!(list.capabilities.report_status);
        assert_eq!(list.capabilities.agent.as_deref(), Some("git/2.43.0"));
        assert!(list.needs_pack());
    }

    #[test]
    fn delete_only_batch_needs_no_pack() {
        let mut list = CommandList::default();
        list.parse_line(&format!("{A} {ZERO} refs/heads/old"), Kind::Sha1).unwrap();
        assert!(!list.needs_pack());
    }

    #[test]
    fn malformed_lines_are_protocol_errors() {
        let mut list = CommandList::default();
        assert!(list.parse_line("not a command", Kind::Sha1).is_err());
        assert!(list
            .parse_line(&format!("{A} {B} refs/heads/x extra"), Kind::Sha1)
            .is_err());
        assert!(list.parse_line(&format!("zzz {B} refs/heads/x"), Kind::Sha1).is_err());
    }

    #[test]
    fn object_format_length_is_enforced() {
        let mut list = CommandList::default();
        let err = list
            .parse_line(&format!("{A} {B} refs/heads/x"), Kind::Sha256)
            .unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
