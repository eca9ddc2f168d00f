//! Shutdown handle shared between the controller and its collaborators.
//!
//! A [`Lifecycle`] terminates once. The first `shutdown` call records the
//! cause, cancels the token and runs the registered hooks; every later call
//! is a no-op.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

use crate::error::SinkError;

type Hook = Box<dyn FnOnce(Option<Arc<SinkError>>) + Send>;

#[derive(Default)]
struct Inner {
    token: CancellationToken,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    /// `Some` once terminated; the inner option is the cause.
    terminated: Option<Option<Arc<SinkError>>>,
    hooks: Vec<Hook>,
}

/// Cloneable, idempotent shutdown signal.
#[derive(Clone, Default)]
pub struct Lifecycle {
    inner: Arc<Inner>,
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Terminate with an optional cause. Returns `false` if already terminated.
    pub fn shutdown(&self, cause: Option<Arc<SinkError>>) -> bool {
        let hooks = {
            let mut state = self.state();
            if state.terminated.is_some() {
                return false;
            }
            state.terminated = Some(cause.clone());
            std::mem::take(&mut state.hooks)
        };

        match &cause {
            Some(err) => tracing::info!(error = %err, "Terminating"),
            None => tracing::info!("Terminating"),
        }
        self.inner.token.cancel();
        for hook in hooks {
            hook(cause.clone());
        }
        true
    }

    /// Run `hook` on termination, or right away if already terminated.
    pub fn on_terminating<F>(&self, hook: F)
    where
        F: FnOnce(Option<Arc<SinkError>>) + Send + 'static,
    {
        let mut state = self.state();
        if let Some(cause) = state.terminated.clone() {
            drop(state);
            hook(cause);
            return;
        }
        state.hooks.push(Box::new(hook));
    }

    pub fn is_terminating(&self) -> bool {
        self.inner.token.is_cancelled()
    }

    /// The cause recorded by the first `shutdown`, if any.
    pub fn cause(&self) -> Option<Arc<SinkError>> {
        self.state().terminated.clone().flatten()
    }

    /// Resolves once `shutdown` has been called.
    pub async fn terminated(&self) {
        self.inner.token.cancelled().await
    }

    /// A token cancelled on termination, for components that only need to
    /// stop waiting.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.clone()
    }
}

impl fmt::Debug for Lifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Lifecycle")
            .field("terminating", &self.is_terminating())
            .finish_non_exhaustive()
    }
}
