//! Independent, deadline-bound tasks with collected errors.
//!
//! A [`TaskGroup`] is not part of a pipeline. It runs sibling tasks
//! concurrently, each under its own derived [`Context`], and
//! [`wait`](TaskGroup::wait) returns the failures in completion order once
//! every task has finished.

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinSet;

use crate::context::Context;
use crate::error::{panic_message, Error, Result};

/// Identifier of a task within its group, assigned in spawn order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A set of concurrently running tasks sharing a parent context.
///
/// Results are held by the group's join set, which grows with every spawn, so
/// a finished task never waits on [`wait`](Self::wait) to hand over its error.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
/// use pipewright::context::Context;
/// use pipewright::group::TaskGroup;
///
/// #[tokio::main]
/// async fn main() {
///     let ctx = Context::background();
///     let mut group = TaskGroup::new(&ctx).with_task_timeout(Duration::from_millis(50));
///
///     group.spawn(|_ctx| async { Ok(()) });
///     group.spawn(|ctx| async move {
///         ctx.run(tokio::time::sleep(Duration::from_secs(5))).await
///     });
///
///     let errors = group.wait().await;
///     assert_eq!(errors.len(), 1);
///     assert!(errors[0].is_deadline_exceeded());
/// }
/// ```
pub struct TaskGroup {
    ctx: Context,
    task_timeout: Option<Duration>,
    tasks: JoinSet<(TaskId, Result<()>)>,
    next_id: u64,
}

impl TaskGroup {
    /// Create a group whose tasks observe `parent`.
    ///
    /// The group derives its own child context; cancelling the group does not
    /// affect `parent`.
    pub fn new(parent: &Context) -> Self {
        Self {
            ctx: parent.child(),
            task_timeout: None,
            tasks: JoinSet::new(),
            next_id: 0,
        }
    }

    /// Give every task spawned afterwards its own deadline of `timeout`
    pub fn with_task_timeout(mut self, timeout: Duration) -> Self {
        self.task_timeout = Some(timeout);
        self
    }

    /// The group's context
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    /// Number of tasks spawned so far
    pub fn len(&self) -> usize {
        self.next_id as usize
    }

    pub fn is_empty(&self) -> bool {
        self.next_id == 0
    }

    /// Cancel every task in the group
    pub fn cancel(&self) {
        self.ctx.cancel();
    }

    /// Spawn a task using the group's task timeout, if any.
    ///
    /// The body receives the task's context. If the context fires before the
    /// body completes, the body is dropped and the task fails with the cause.
    /// A panicking body fails the task with [`Error::Panicked`].
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(&mut self, body: F) -> TaskId
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_task(body, self.task_timeout)
    }

    /// Spawn a task with its own `timeout`, overriding the group's
    pub fn spawn_with_timeout<F, Fut>(&mut self, body: F, timeout: Duration) -> TaskId
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_task(body, Some(timeout))
    }

    fn spawn_task<F, Fut>(&mut self, body: F, timeout: Option<Duration>) -> TaskId
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let id = TaskId(self.next_id);
        self.next_id += 1;

        let ctx = match timeout {
            Some(timeout) => self.ctx.with_timeout(timeout),
            None => self.ctx.child(),
        };

        self.tasks.spawn(async move {
            let task_ctx = ctx.clone();
            let body = AssertUnwindSafe(async move { body(task_ctx).await }).catch_unwind();
            let result = match ctx.run(body).await {
                Ok(Ok(result)) => result,
                Ok(Err(payload)) => Err(Error::Panicked(panic_message(&*payload))),
                Err(cause) => Err(cause),
            };
            (id, result)
        });

        tracing::trace!(task = %id, ?timeout, "task spawned");
        id
    }

    /// Wait for every spawned task, returning the failures in completion order.
    ///
    /// Each error is an [`Error::Task`] naming the failed task.
    pub async fn wait(mut self) -> Vec<Error> {
        let mut errors = Vec::new();
        while let Some(joined) = self.tasks.join_next().await {
            let error = match joined {
                Ok((_, Ok(()))) => continue,
                Ok((task, Err(e))) => Error::task(task, e),
                Err(e) => Error::from(e),
            };
            tracing::warn!(error = %error, "task failed");
            #[cfg(feature = "metrics")]
            crate::metrics::record_task_failed();
            errors.push(error);
        }
        tracing::debug!(tasks = self.next_id, failed = errors.len(), "task group finished");
        errors
    }

    /// Like [`wait`](Self::wait), folding the failures into one error
    pub async fn wait_result(self) -> Result<()> {
        match Error::aggregate(self.wait().await) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

impl fmt::Debug for TaskGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskGroup")
            .field("spawned", &self.next_id)
            .field("running", &self.tasks.len())
            .field("task_timeout", &self.task_timeout)
            .finish()
    }
}
