//! Server configuration for a receive-pack session.

use std::sync::Arc;

use wharf_hash::Kind;
use wharf_serve_core::capabilities::CapabilitySet;
use wharf_serve_core::hooks::AdvertiseRefsHook;
use wharf_serve_core::visibility::{HiddenRefPredicate, RefRecord};

use crate::hooks::{PostReceiveHook, PreReceiveHook};
use crate::nonce::NonceGenerator;

/// Signed-push configuration.
#[derive(Clone)]
pub struct SignedPushOptions {
    /// Issues and verifies the advertised nonces.
    pub generator: NonceGenerator,
    /// Accept sibling frontends' nonces within the slop window, for
    /// stateless multi-frontend HTTP deployments.
    pub allow_slop: bool,
    /// The slop window in seconds.
    pub slop_seconds: i64,
}

impl SignedPushOptions {
    /// Signed pushes with a five-minute slop window.
    pub fn new(generator: NonceGenerator) -> Self {
        Self {
            generator,
            allow_slop: true,
            slop_seconds: 300,
        }
    }
}

/// Configuration of the receiving side.
#[derive(Clone)]
pub struct ReceiveOptions {
    /// The capabilities to advertise.
    pub capabilities: CapabilitySet,
    /// The repository's object format.
    pub object_format: Kind,
    /// Refuse creation of new refs.
    pub deny_creates: bool,
    /// Refuse deletion of refs.
    pub deny_deletes: bool,
    /// Refuse non-fast-forward updates.
    pub deny_non_fast_forwards: bool,
    /// Allow updating the branch checked out in a working tree.
    pub allow_current_branch: bool,
    /// Require every referenced object to be reachable; thin-pack bases
    /// must be previously owned.
    pub check_referenced_objects_reachable: bool,
    /// Try the reduced-boundary connectivity walk before the full one.
    pub iterative_connectivity: bool,
    /// Predicate to hide references.
    pub hidden: Arc<HiddenRefPredicate>,
    /// Hook consulted before the advertisement is written.
    pub advertise_hook: AdvertiseRefsHook,
    /// Signed-push configuration; `None` disables `push-cert`.
    pub signed_push: Option<SignedPushOptions>,
    /// Runs between validation and execution.
    pub pre_receive: PreReceiveHook,
    /// Runs after the report with the successful commands.
    pub post_receive: PostReceiveHook,
    /// The message written into the pack's `.keep` lock file.
    pub lock_message: String,
}

impl Default for ReceiveOptions {
    fn default() -> Self {
        Self {
            capabilities: CapabilitySet::receive_pack_defaults()
                .with_agent(Some(format!("wharf/{}", crate::VERSION))),
            object_format: Kind::Sha1,
            deny_creates: false,
            deny_deletes: false,
            deny_non_fast_forwards: false,
            allow_current_branch: false,
            check_referenced_objects_reachable: false,
            iterative_connectivity: true,
            hidden: Arc::new(|_r: &RefRecord| false),
            advertise_hook: AdvertiseRefsHook::Default,
            signed_push: None,
            pre_receive: PreReceiveHook::Default,
            post_receive: PostReceiveHook::Default,
            lock_message: "receive-pack".to_owned(),
        }
    }
}

impl ReceiveOptions {
    /// Enable signed pushes.
    pub fn with_signed_push(mut self, signed: SignedPushOptions) -> Self {
        self.signed_push = Some(signed);
        self
    }

    /// Install the pre-receive hook (see [`crate::hooks::pre_receive_chain`]).
    pub fn with_pre_receive(mut self, hook: PreReceiveHook) -> Self {
        self.pre_receive = hook;
        self
    }

    /// Install the post-receive hook.
    pub fn with_post_receive(mut self, hook: PostReceiveHook) -> Self {
        self.post_receive = hook;
        self
    }
}

impl std::fmt::Debug for ReceiveOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReceiveOptions")
            .field("capabilities", &self.capabilities)
            .field("object_format", &self.object_format)
            .field("deny_creates", &self.deny_creates)
            .field("deny_deletes", &self.deny_deletes)
            .field("deny_non_fast_forwards", &self.deny_non_fast_forwards)
            .field("signed_push", &self.signed_push.is_some())
            .finish_non_exhaustive()
    }
}
