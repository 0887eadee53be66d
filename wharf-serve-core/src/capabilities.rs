//! Typed capability sets shared by advertisement and negotiation.
//!
//! The server advertises its set, the client selects a subset on its first
//! line, and the intersection governs the session.

use std::fmt;

use smallvec::SmallVec;
use wharf_hash::Kind;

/// Multi-ack modes for negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MultiAckMode {
    /// No multi-ack support: one ACK, then NAK per round.
    #[default]
    None,
    /// `multi_ack`: `ACK <oid> continue` per common object.
    Basic,
    /// `multi_ack_detailed`: `common`/`ready` annotations.
    Detailed,
}

/// Side-band modes for multiplexed communication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SideBandMode {
    /// No side-band.
    #[default]
    None,
    /// `side-band`: packets up to 1000 bytes.
    Basic,
    /// `side-band-64k`: packets up to the full pkt-line maximum.
    SideBand64k,
}

impl SideBandMode {
    /// The maximum side-band frame payload for this mode, or `None` when
    /// side-band is off.
    pub fn max_payload(self) -> Option<usize> {
        match self {
            SideBandMode::None => None,
            SideBandMode::Basic => Some(995),
            SideBandMode::SideBand64k => Some(wharf_pktline::encode::MAX_BAND_DATA_LEN),
        }
    }

    /// Whether any side-band mode is active.
    pub fn is_active(self) -> bool {
        !matches!(self, SideBandMode::None)
    }
}

/// How to order emitted capability tokens when building the advertisement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CapabilityOrdering {
    /// Keep the crate's idiomatic deterministic order.
    #[default]
    PreserveIdiomatic,
    /// Emit tokens lexicographically. This is useful for golden tests.
    Lexicographic,
}

/// A typed capability set covering the full vocabulary of both services.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilitySet {
    /// Negotiated multi-ack mode (upload-pack).
    pub multi_ack: MultiAckMode,
    /// Negotiated side-band mode.
    pub side_band: SideBandMode,
    /// Deltas may reference bases outside the pack.
    pub thin_pack: bool,
    /// Deltas may use offsets instead of base ids.
    pub ofs_delta: bool,
    /// Annotated tags pointing into the pack are included.
    pub include_tag: bool,
    /// Suppress progress on channel 2.
    pub no_progress: bool,
    /// Client need not send `done` after the server is `ready`.
    pub no_done: bool,
    /// Shallow clients are supported.
    pub shallow: bool,
    /// `deepen-since` is supported.
    pub deepen_since: bool,
    /// `deepen-not` is supported.
    pub deepen_not: bool,
    /// `deepen` counts from the client's shallow boundary.
    pub deepen_relative: bool,
    /// Object filters are supported.
    pub filter: bool,
    /// Wants may name any ref tip, advertised or not.
    pub allow_tip_sha1_in_want: bool,
    /// Wants may name any object reachable from a ref tip.
    pub allow_reachable_sha1_in_want: bool,
    /// Per-command status report after a push (receive-pack).
    pub report_status: bool,
    /// Refs may be deleted (receive-pack).
    pub delete_refs: bool,
    /// Suppress side-band progress during a push (receive-pack).
    pub quiet: bool,
    /// All commands in a push succeed or fail together (receive-pack).
    pub atomic: bool,
    /// `push-option` lines follow the pack (receive-pack).
    pub push_options: bool,
    /// Signed pushes: the advertised value carries the nonce.
    pub push_cert: Option<String>,
    /// The peer's software identification.
    pub agent: Option<String>,
    /// An opaque session identifier for tracing.
    pub session_id: Option<String>,
    /// Supported object formats, most preferred first.
    pub object_format: SmallVec<[Kind; 2]>,
    /// Additional opaque capability tokens for forward-compatibility.
    pub extra: Vec<String>,
}

impl CapabilitySet {
    /// Opinionated defaults for an upload-pack server.
    pub fn upload_pack_defaults() -> Self {
        Self {
            multi_ack: MultiAckMode::Detailed,
            side_band: SideBandMode::SideBand64k,
            thin_pack: true,
            ofs_delta: true,
            include_tag: true,
            no_progress: true,
            no_done: true,
            shallow: true,
            deepen_since: true,
            deepen_not: true,
            deepen_relative: true,
            object_format: smallvec::smallvec![Kind::Sha1],
            ..Self::default()
        }
    }

    /// Opinionated defaults for a receive-pack server.
    pub fn receive_pack_defaults() -> Self {
        Self {
            side_band: SideBandMode::SideBand64k,
            ofs_delta: true,
            report_status: true,
            delete_refs: true,
            quiet: true,
            atomic: true,
            push_options: true,
            object_format: smallvec::smallvec![Kind::Sha1],
            ..Self::default()
        }
    }

    /// Set the agent string.
    pub fn with_agent(mut self, agent: Option<String>) -> Self {
        self.agent = agent;
        self
    }

    /// Enable signed pushes by embedding a freshly generated nonce.
    pub fn with_push_cert_nonce(mut self, nonce: impl Into<String>) -> Self {
        self.push_cert = Some(nonce.into());
        self
    }

    /// Push an additional raw capability token.
    pub fn push_extra<S: Into<String>>(&mut self, token: S) {
        self.extra.push(token.into());
    }

    /// Parse a space-separated capability selection, as found after the NUL
    /// on a client's first line. Unknown tokens land in `extra`.
    pub fn parse(tokens: &str) -> Self {
        let mut set = Self::default();
        for token in tokens.split(' ').filter(|t| !t.is_empty()) {
            match token {
                "multi_ack" => {
                    if set.multi_ack == MultiAckMode::None {
                        set.multi_ack = MultiAckMode::Basic;
                    }
                }
                "multi_ack_detailed" => set.multi_ack = MultiAckMode::Detailed,
                "side-band" => {
                    if set.side_band == SideBandMode::None {
                        set.side_band = SideBandMode::Basic;
                    }
                }
                "side-band-64k" => set.side_band = SideBandMode::SideBand64k,
                "thin-pack" => set.thin_pack = true,
                "ofs-delta" => set.ofs_delta = true,
                "include-tag" => set.include_tag = true,
                "no-progress" => set.no_progress = true,
                "no-done" => set.no_done = true,
                "shallow" => set.shallow = true,
                "deepen-since" => set.deepen_since = true,
                "deepen-not" => set.deepen_not = true,
                "deepen-relative" => set.deepen_relative = true,
                "filter" => set.filter = true,
                "allow-tip-sha1-in-want" => set.allow_tip_sha1_in_want = true,
                "allow-reachable-sha1-in-want" => set.allow_reachable_sha1_in_want = true,
                "report-status" => set.report_status = true,
                "delete-refs" => set.delete_refs = true,
                "quiet" => set.quiet = true,
                "atomic" => set.atomic = true,
                "push-options" => set.push_options = true,
                _ => match token.split_once('=') {
                    Some(("push-cert", value)) => set.push_cert = Some(value.to_owned()),
                    Some(("agent", value)) => set.agent = Some(value.to_owned()),
                    Some(("session-id", value)) => set.session_id = Some(value.to_owned()),
                    Some(("object-format", value)) => {
                        if let Some(kind) = Kind::from_name(value) {
                            set.object_format.push(kind);
                        } else {
                            set.extra.push(token.to_owned());
                        }
                    }
                    _ => set.extra.push(token.to_owned()),
                },
            }
        }
        set
    }

    /// Check if a capability token is present, matching `key=value` tokens
    /// by key as well.
    pub fn has(&self, token: &str) -> bool {
        self.tokens_idiomatic().iter().any(|t| {
            t == token || (t.starts_with(token) && t.get(token.len()..token.len() + 1) == Some("="))
        })
    }

    /// The capability tokens in idiomatic deterministic order.
    fn tokens_idiomatic(&self) -> Vec<String> {
        let mut tokens = Vec::with_capacity(16 + self.extra.len());
        match self.multi_ack {
            MultiAckMode::None => {}
            MultiAckMode::Basic => tokens.push("multi_ack".to_owned()),
            MultiAckMode::Detailed => {
                tokens.push("multi_ack".to_owned());
                tokens.push("multi_ack_detailed".to_owned());
            }
        }
        if self.thin_pack {
            tokens.push("thin-pack".to_owned());
        }
        match self.side_band {
            SideBandMode::None => {}
            SideBandMode::Basic => tokens.push("side-band".to_owned()),
            SideBandMode::SideBand64k => {
                tokens.push("side-band".to_owned());
                tokens.push("side-band-64k".to_owned());
            }
        }
        if self.ofs_delta {
            tokens.push("ofs-delta".to_owned());
        }
        if self.include_tag {
            tokens.push("include-tag".to_owned());
        }
        if self.no_progress {
            tokens.push("no-progress".to_owned());
        }
        if self.no_done {
            tokens.push("no-done".to_owned());
        }
        if self.shallow {
            tokens.push("shallow".to_owned());
        }
        if self.deepen_since {
            tokens.push("deepen-since".to_owned());
        }
        if self.deepen_not {
            tokens.push("deepen-not".to_owned());
        }
        if self.deepen_relative {
            tokens.push("deepen-relative".to_owned());
        }
        if self.filter {
            tokens.push("filter".to_owned());
        }
        if self.allow_tip_sha1_in_want {
            tokens.push("allow-tip-sha1-in-want".to_owned());
        }
        if self.allow_reachable_sha1_in_want {
            tokens.push("allow-reachable-sha1-in-want".to_owned());
        }
        if self.report_status {
            tokens.push("report-status".to_owned());
        }
        if self.delete_refs {
            tokens.push("delete-refs".to_owned());
        }
        if self.quiet {
            tokens.push("quiet".to_owned());
        }
        if self.atomic {
            tokens.push("atomic".to_owned());
        }
        if self.push_options {
            tokens.push("push-options".to_owned());
        }
        if let Some(nonce) = &self.push_cert {
            tokens.push(format!("push-cert={nonce}"));
        }
        for kind in &self.object_format {
            tokens.push(format!("object-format={}", kind.name()));
        }
        if let Some(session) = &self.session_id {
            tokens.push(format!("session-id={session}"));
        }
        if let Some(agent) = &self.agent {
            tokens.push(format!("agent={agent}"));
        }
        tokens.extend(self.extra.iter().cloned());
        tokens
    }

    /// Build a single space-separated capability line.
    pub fn encode(&self, ordering: CapabilityOrdering) -> String {
        let mut tokens = self.tokens_idiomatic();
        if ordering == CapabilityOrdering::Lexicographic {
            tokens.sort_unstable();
        }
        tokens.join(" ")
    }

    /// Validate a client's selection against this advertised set.
    ///
    /// Tokens the client selected but the server never advertised are a
    /// protocol violation. `agent=`, `session-id=` and `push-cert=` values
    /// are accepted with any value as long as the key was advertised, but
    /// must not contain spaces.
    pub fn validate_selection(&self, selection: &CapabilitySet) -> Result<(), String> {
        let advertised = self.tokens_idiomatic();
        let advertised_keys: Vec<&str> = advertised
            .iter()
            .map(|t| t.split_once('=').map_or(t.as_str(), |(k, _)| k))
            .collect();

        for token in selection.tokens_idiomatic() {
            let key = token.split_once('=').map_or(token.as_str(), |(k, _)| k);
            if let Some((_, value)) = token.split_once('=') {
                if value.contains(' ') {
                    return Err(format!("invalid token '{token}': value must not contain spaces"));
                }
            }
            if !advertised.iter().any(|t| *t == token) && !advertised_keys.contains(&key) {
                return Err(format!("capability '{token}' not advertised"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode(CapabilityOrdering::PreserveIdiomatic))
    }
}
