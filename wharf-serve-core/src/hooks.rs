//! Hook points invoked before the reference advertisement.
//!
//! Hooks are plain function values invoked in declared order. The first
//! one to fail aborts the advertisement, and its message is sent to the
//! peer as an `ERR` line.

use std::sync::Arc;

use crate::visibility::RefRecord;

/// The signature of a custom advertise hook: it may restrict or override
/// the advertised set by mutating the record list.
pub type AdvertiseFn = dyn Fn(&mut Vec<RefRecord>) -> Result<(), String> + Send + Sync;

/// A hook that runs before refs are advertised.
#[derive(Clone, Default)]
pub enum AdvertiseRefsHook {
    /// Advertise everything unchanged.
    #[default]
    Default,
    /// A caller-supplied hook.
    Custom(Arc<AdvertiseFn>),
}

impl AdvertiseRefsHook {
    /// Wrap a function value as a hook.
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&mut Vec<RefRecord>) -> Result<(), String> + Send + Sync + 'static,
    {
        AdvertiseRefsHook::Custom(Arc::new(hook))
    }

    /// Invoke the hook. The default hook is a no-op.
    pub fn invoke(&self, refs: &mut Vec<RefRecord>) -> Result<(), String> {
        match self {
            AdvertiseRefsHook::Default => Ok(()),
            AdvertiseRefsHook::Custom(hook) => hook(refs),
        }
    }

    /// Whether this is the default no-op hook.
    pub fn is_default(&self) -> bool {
        matches!(self, AdvertiseRefsHook::Default)
    }
}

impl std::fmt::Debug for AdvertiseRefsHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdvertiseRefsHook::Default => f.write_str("AdvertiseRefsHook::Default"),
            AdvertiseRefsHook::Custom(_) => f.write_str("AdvertiseRefsHook::Custom(..)"),
        }
    }
}

/// Combine hooks into one that runs them in order, stopping at the first
/// failure.
///
/// Default hooks are filtered out; a chain that reduces to a single hook
/// is returned unwrapped, and an empty chain collapses to the default.
pub fn chain(hooks: Vec<AdvertiseRefsHook>) -> AdvertiseRefsHook {
    let mut hooks: Vec<AdvertiseRefsHook> = hooks.into_iter().filter(|h| !h.is_default()).collect();
    match hooks.len() {
        0 => AdvertiseRefsHook::Default,
        1 => hooks.remove(0),
        _ => AdvertiseRefsHook::new(move |refs| {
            for hook in &hooks {
                hook.invoke(refs)?;
            }
            Ok(())
        }),
    }
}
