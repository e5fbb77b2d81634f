//! Lifecycle hooks.
//!
//! A [`Hook`] is either *immediate* (a plain closure, run on the runtime's
//! blocking pool) or *suspending* (a closure returning a future, spawned on
//! the runtime). Neither form is awaited by the operation that triggered it,
//! so a slow hook never delays `open`, `close` or EOF handling. The form is
//! fixed at construction, so dispatch never inspects the callable.
//!
//! Hooks of one client may run concurrently with each other.
//!
//! Hook failures, whether returned errors or panics, are logged and
//! swallowed. A misbehaving hook cannot change the outcome of `open`,
//! `close` or a read.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use futures_util::future::BoxFuture;

/// Error type hooks may return.
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result type returned by hooks.
pub type HookResult = std::result::Result<(), HookError>;

type ImmediateFn = dyn Fn() -> HookResult + Send + Sync;
type SuspendingFn = dyn Fn() -> BoxFuture<'static, HookResult> + Send + Sync;

/// A registered lifecycle callback.
#[derive(Clone)]
pub enum Hook {
    /// Runs on the blocking thread pool.
    Immediate(Arc<ImmediateFn>),
    /// Produces a future that is spawned on the runtime.
    Suspending(Arc<SuspendingFn>),
}

impl Hook {
    /// Wrap a plain closure.
    pub fn immediate<F>(f: F) -> Self
    where
        F: Fn() -> HookResult + Send + Sync + 'static,
    {
        Self::Immediate(Arc::new(f))
    }

    /// Wrap a closure returning a future.
    pub fn suspending<F, Fut>(f: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HookResult> + Send + 'static,
    {
        Self::Suspending(Arc::new(move || f().boxed()))
    }

    /// Schedule the hook on the current tokio runtime, containing any failure.
    ///
    /// Returns without waiting for the hook to run.
    pub(crate) fn dispatch(&self, event: HookEvent, address: &str) {
        let address = address.to_string();
        match self {
            Self::Immediate(f) => {
                let f = f.clone();
                tokio::task::spawn_blocking(move || {
                    let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| f()));
                    report(event, &address, outcome);
                });
            }
            Self::Suspending(f) => {
                let f = f.clone();
                tokio::spawn(async move {
                    let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| f())) {
                        Ok(future) => AssertUnwindSafe(future).catch_unwind().await,
                        Err(panic) => Err(panic),
                    };
                    report(event, &address, outcome);
                });
            }
        }
    }
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Immediate(_) => f.write_str("Hook::Immediate"),
            Self::Suspending(_) => f.write_str("Hook::Suspending"),
        }
    }
}

fn report(
    event: HookEvent,
    address: &str,
    outcome: std::thread::Result<HookResult>,
) {
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            tracing::error!(%address, hook = %event, error = %e, "error running hook");
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            tracing::error!(%address, hook = %event, panic = %message, "hook panicked");
        }
    }
}

/// Which lifecycle hook is being dispatched.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HookEvent {
    /// A connect attempt succeeded.
    ConnectionMade,
    /// The connection went away while in use or was closed.
    ConnectionLost,
    /// The peer ended the stream.
    EofReceived,
}

impl std::fmt::Display for HookEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionMade => write!(f, "on_connection_made"),
            Self::ConnectionLost => write!(f, "on_connection_lost"),
            Self::EofReceived => write!(f, "on_eof_received"),
        }
    }
}

/// The set of hooks registered on a client.
#[derive(Clone, Debug, Default)]
pub struct Callbacks {
    /// Fired after every successful connect.
    pub on_connection_made: Option<Hook>,
    /// Fired when a connected client becomes disconnected.
    pub on_connection_lost: Option<Hook>,
    /// Fired when the peer ends the stream.
    pub on_eof_received: Option<Hook>,
}

impl Callbacks {
    /// No hooks registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the connection-made hook.
    pub fn on_connection_made(mut self, hook: Hook) -> Self {
        self.on_connection_made = Some(hook);
        self
    }

    /// Set the connection-lost hook.
    pub fn on_connection_lost(mut self, hook: Hook) -> Self {
        self.on_connection_lost = Some(hook);
        self
    }

    /// Set the eof-received hook.
    pub fn on_eof_received(mut self, hook: Hook) -> Self {
        self.on_eof_received = Some(hook);
        self
    }

    pub(crate) fn fire(&self, event: HookEvent, address: &str) {
        let hook = match event {
            HookEvent::ConnectionMade => &self.on_connection_made,
            HookEvent::ConnectionLost => &self.on_connection_lost,
            HookEvent::EofReceived => &self.on_eof_received,
        };
        if let Some(hook) = hook {
            tracing::debug!(%address, hook = %event, "dispatching hook");
            hook.dispatch(event, address);
        }
    }
}
