//! Server configuration for an upload-pack session.

use std::sync::Arc;

use wharf_serve_core::capabilities::CapabilitySet;
use wharf_serve_core::hooks::AdvertiseRefsHook;
use wharf_serve_core::visibility::{HiddenRefPredicate, RefRecord};

use crate::policy::RequestPolicy;

/// The maximum number of `want` lines accepted in one request.
pub const MAX_WANTS: usize = 65_536;

/// The number of `have` lines processed per negotiation round.
pub const HAVES_PER_ROUND: usize = 32;

/// Configuration of the serving side.
#[derive(Clone)]
pub struct ServerOptions {
    /// The capabilities to advertise.
    pub capabilities: CapabilitySet,
    /// Which wants are acceptable.
    pub request_policy: RequestPolicy,
    /// Predicate to hide references from advertisement and validation.
    pub hidden: Arc<HiddenRefPredicate>,
    /// Hook consulted before the advertisement is written.
    pub advertise_hook: AdvertiseRefsHook,
    /// Upper bound on accepted `want` lines.
    pub max_wants: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            capabilities: CapabilitySet::upload_pack_defaults()
                .with_agent(Some(format!("wharf/{}", crate::VERSION))),
            request_policy: RequestPolicy::default(),
            hidden: Arc::new(|_r: &RefRecord| false),
            advertise_hook: AdvertiseRefsHook::Default,
            max_wants: MAX_WANTS,
        }
    }
}

impl ServerOptions {
    /// Replace the advertised capability set.
    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Set the request policy.
    pub fn with_request_policy(mut self, policy: RequestPolicy) -> Self {
        self.request_policy = policy;
        self
    }

    /// Set the hidden-ref predicate.
    pub fn with_hidden(mut self, hidden: Arc<HiddenRefPredicate>) -> Self {
        self.hidden = hidden;
        self
    }

    /// Install an advertise hook (see [`wharf_serve_core::hooks::chain`]).
    pub fn with_advertise_hook(mut self, hook: AdvertiseRefsHook) -> Self {
        self.advertise_hook = hook;
        self
    }
}

impl std::fmt::Debug for ServerOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerOptions")
            .field("capabilities", &self.capabilities)
            .field("request_policy", &self.request_policy)
            .field("max_wants", &self.max_wants)
            .finish_non_exhaustive()
    }
}
