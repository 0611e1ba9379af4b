//! Propagatable cancellation and deadline signal.
//!
//! A [`Context`] fires at most once and stays fired. Children created with
//! [`Context::child`], [`Context::with_deadline`], or [`Context::with_timeout`]
//! fire whenever their parent does, and may additionally fire on their own
//! without affecting the parent or siblings.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock, Weak};
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

use crate::error::{Error, Result};

/// A cancellation/deadline signal shared by cooperating workers.
///
/// Cloning a `Context` is cheap and yields a handle to the same signal.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

struct Inner {
    token: CancellationToken,
    cause: OnceLock<Error>,
    /// Earliest deadline of this context and all of its ancestors
    deadline: Option<Instant>,
    parent: Option<Context>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Releases the deadline timer task, if any. Children keep their
        // parent alive, so no live descendant is affected.
        self.token.cancel();
    }
}

impl Context {
    /// A root context that never fires on its own
    pub fn background() -> Self {
        Self::build(CancellationToken::new(), None, None)
    }

    /// Derive a child that fires when `self` fires or when cancelled directly
    pub fn child(&self) -> Self {
        Self::build(
            self.inner.token.child_token(),
            self.inner.deadline,
            Some(self.clone()),
        )
    }

    /// Derive a child that also fires with [`Error::DeadlineExceeded`] at `deadline`
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let effective = match self.inner.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self::build(
            self.inner.token.child_token(),
            Some(effective),
            Some(self.clone()),
        )
    }

    /// Derive a child that expires `timeout` from now
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    fn build(token: CancellationToken, deadline: Option<Instant>, parent: Option<Context>) -> Self {
        let ctx = Self {
            inner: Arc::new(Inner {
                token,
                cause: OnceLock::new(),
                deadline,
                parent,
            }),
        };
        if let Some(deadline) = deadline {
            ctx.arm_timer(deadline);
        }
        ctx
    }

    /// Spawn a timer that fires the context at its deadline.
    ///
    /// Outside a tokio runtime no timer is armed; expiry is then observed
    /// lazily by `err`, `is_done`, and `done`.
    fn arm_timer(&self, deadline: Instant) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let token = self.inner.token.clone();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        handle.spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep_until(deadline) => {
                    if let Some(inner) = weak.upgrade() {
                        Context { inner }.fire(Error::DeadlineExceeded);
                    }
                }
            }
        });
    }

    /// Fire the context with [`Error::Cancelled`]. Idempotent.
    pub fn cancel(&self) {
        self.fire(Error::Cancelled);
    }

    /// Fire the context with a specific cause. The first cause wins.
    pub fn cancel_with(&self, cause: Error) {
        self.fire(cause);
    }

    fn fire(&self, cause: Error) {
        // Cause is recorded before the token fires so every observer woken
        // by the token finds it.
        if self.inner.cause.set(cause).is_ok() {
            tracing::trace!("context fired");
        }
        self.inner.token.cancel();
    }

    /// Whether the context has fired
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// The cause the context fired with, or `None` while it is live
    pub fn err(&self) -> Option<Error> {
        if let Some(cause) = self.inner.cause.get() {
            return Some(cause.clone());
        }
        if let Some(parent) = &self.inner.parent {
            if let Some(cause) = parent.err() {
                self.fire(cause);
                return self.inner.cause.get().cloned();
            }
        }
        if let Some(deadline) = self.inner.deadline {
            if Instant::now() >= deadline {
                self.fire(Error::DeadlineExceeded);
                return self.inner.cause.get().cloned();
            }
        }
        if self.inner.token.is_cancelled() {
            return Some(Error::Cancelled);
        }
        None
    }

    /// The firing cause, defaulting to [`Error::Cancelled`].
    ///
    /// Meant for call sites that already observed the context as done.
    pub fn cause(&self) -> Error {
        self.err().unwrap_or(Error::Cancelled)
    }

    /// The effective deadline inherited from this context's chain
    pub fn deadline(&self) -> Option<Instant> {
        self.inner.deadline
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.inner
            .deadline
            .map(|d| d.saturating_duration_since(Instant::now()))
    }

    /// A token that is cancelled when this context fires, for collaborators
    /// that integrate with `tokio_util` directly.
    pub fn token(&self) -> CancellationToken {
        self.inner.token.child_token()
    }

    /// Resolve once the context fires
    pub fn done(&self) -> Done {
        Done {
            ctx: self.clone(),
            cancelled: Box::pin(self.inner.token.clone().cancelled_owned()),
            sleep: self.inner.deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
        }
    }

    /// Race `future` against the context.
    ///
    /// Returns `Err(cause)` if the context fires first; the future is dropped.
    pub async fn run<F: Future>(&self, future: F) -> Result<F::Output> {
        if let Some(cause) = self.err() {
            return Err(cause);
        }
        tokio::select! {
            biased;
            _ = self.done() => Err(self.cause()),
            output = future => Ok(output),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("done", &self.is_done())
            .field("deadline", &self.inner.deadline)
            .field("cause", &self.inner.cause.get())
            .finish()
    }
}

/// Future returned by [`Context::done`]
pub struct Done {
    ctx: Context,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
    sleep: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl Future for Done {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<()> {
        if self.cancelled.as_mut().poll(cx).is_ready() {
            return Poll::Ready(());
        }
        if let Some(sleep) = self.sleep.as_mut() {
            if sleep.as_mut().poll(cx).is_ready() {
                self.ctx.fire(Error::DeadlineExceeded);
                return Poll::Ready(());
            }
        }
        Poll::Pending
    }
}
