//! Pre- and post-receive hook points.
//!
//! Hooks are lists of function values invoked in declared order; the
//! chain builders filter out defaults, return a single hook unwrapped,
//! and short-circuit on the first failure. A hook may demote a command's
//! result but never re-promote it.

use std::sync::Arc;

use crate::commands::ReceiveCommand;

/// A pre-receive hook: runs between validation and execution with the
/// currently-OK commands and the client's push options. Returning `Err`
/// rejects every still-pending command with the given message.
pub type PreReceiveFn = dyn Fn(&mut [ReceiveCommand], &[String]) -> Result<(), String> + Send + Sync;

/// A post-receive hook: runs after the status report with the commands
/// that succeeded.
pub type PostReceiveFn = dyn Fn(&[ReceiveCommand], &[String]) + Send + Sync;

/// A hook consulted before accepted commands are executed.
#[derive(Clone, Default)]
pub enum PreReceiveHook {
    /// Accept everything.
    #[default]
    Default,
    /// A caller-supplied hook.
    Custom(Arc<PreReceiveFn>),
}

impl PreReceiveHook {
    /// Wrap a function value as a hook.
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&mut [ReceiveCommand], &[String]) -> Result<(), String> + Send + Sync + 'static,
    {
        PreReceiveHook::Custom(Arc::new(hook))
    }

    /// Invoke the hook; the default accepts.
    pub fn invoke(&self, commands: &mut [ReceiveCommand], push_options: &[String]) -> Result<(), String> {
        match self {
            PreReceiveHook::Default => Ok(()),
            PreReceiveHook::Custom(hook) => hook(commands, push_options),
        }
    }

    /// Whether this is the default no-op hook.
    pub fn is_default(&self) -> bool {
        matches!(self, PreReceiveHook::Default)
    }
}

/// A hook notified after the report about the successful commands.
#[derive(Clone, Default)]
pub enum PostReceiveHook {
    /// Do nothing.
    #[default]
    Default,
    /// A caller-supplied hook.
    Custom(Arc<PostReceiveFn>),
}

impl PostReceiveHook {
    /// Wrap a function value as a hook.
    pub fn new<F>(hook: F) -> Self
    where
        F: Fn(&[ReceiveCommand], &[String]) + Send + Sync + 'static,
    {
        PostReceiveHook::Custom(Arc::new(hook))
    }

    /// Invoke the hook; the default does nothing.
    pub fn invoke(&self, commands: &[ReceiveCommand], push_options: &[String]) {
        if let PostReceiveHook::Custom(hook) = self {
            hook(commands, push_options);
        }
    }

    /// Whether this is the default no-op hook.
    pub fn is_default(&self) -> bool {
        matches!(self, PostReceiveHook::Default)
    }
}

/// Combine pre-receive hooks, preserving order and first-failure
/// short-circuiting.
pub fn pre_receive_chain(hooks: Vec<PreReceiveHook>) -> PreReceiveHook {
    let mut hooks: Vec<PreReceiveHook> = hooks.into_iter().filter(|h| !h.is_default()).collect();
    match hooks.len() {
        0 => PreReceiveHook::Default,
        1 => hooks.remove(0),
        _ => PreReceiveHook::new(move |commands, push_options| {
            for hook in &hooks {
                hook.invoke(commands, push_options)?;
            }
            Ok(())
        }),
    }
}

/// Combine post-receive hooks, preserving order.
pub fn post_receive_chain(hooks: Vec<PostReceiveHook>) -> PostReceiveHook {
    let mut hooks: Vec<PostReceiveHook> = hooks.into_iter().filter(|h| !h.is_default()).collect();
    match hooks.len() {
        0 => PostReceiveHook::Default,
        1 => hooks.remove(0),
        _ => PostReceiveHook::new(move |commands, push_options| {
            for hook in &hooks {
                hook.invoke(commands, push_options);
            }
        }),
    }
}

impl std::fmt::Debug for PreReceiveHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreReceiveHook::Default => f.write_str("PreReceiveHook::Default"),
            PreReceiveHook::Custom(_) => f.write_str("PreReceiveHook::Custom(..)"),
        }
    }
}

impl std::fmt::Debug for PostReceiveHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PostReceiveHook::Default => f.write_str("PostReceiveHook::Default"),
            PostReceiveHook::Custom(_) => f.write_str("PostReceiveHook::Custom(..)"),
        }
    }
}
