//! Fan-out dispatch: a bounded pool of workers competing for items from one
//! shared stream.
//!
//! Each item is delivered to exactly one worker. Workers stop when the input
//! is closed and empty, when the context fires, or when their handler returns
//! [`Flow::Stop`]. The [`DispatchHandle`] is the join barrier for the pool.

use std::future::Future;
use std::sync::Arc;

use tokio::task::JoinSet;

use crate::context::Context;
use crate::error::Error;
use crate::stream::Stream;

/// What a worker does after handling an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Stop,
}

/// One item handed to one worker
#[derive(Debug)]
pub struct Delivery<T> {
    /// Index of the worker handling the item, `0..workers`
    pub worker: usize,
    /// Position of the item in the input stream, counted in receive order
    pub seq: u64,
    pub item: T,
}

/// Runs a fixed number of workers over a shared input stream
#[derive(Debug, Clone)]
pub struct Dispatcher {
    name: Arc<str>,
    workers: usize,
}

impl Dispatcher {
    /// Create a dispatcher. A worker count of zero is raised to one.
    pub fn new(name: impl Into<Arc<str>>, workers: usize) -> Self {
        Self {
            name: name.into(),
            workers: workers.max(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Start the workers. Each received item is passed to `handler`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn run<T, F, Fut>(&self, ctx: &Context, input: Stream<T>, handler: F) -> DispatchHandle
    where
        T: Send + 'static,
        F: Fn(Delivery<T>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Flow> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let mut set = JoinSet::new();

        for worker in 0..self.workers {
            let ctx = ctx.clone();
            let input = input.clone();
            let handler = handler.clone();
            let name = self.name.clone();

            set.spawn(async move {
                let mut handled = 0u64;
                loop {
                    let (seq, item) = match input.recv_indexed(&ctx).await {
                        Ok(Some(next)) => next,
                        Ok(None) => {
                            tracing::debug!(stage = %name, worker, handled, "input exhausted");
                            break;
                        }
                        Err(cause) => {
                            tracing::debug!(stage = %name, worker, handled, %cause, "worker cancelled");
                            break;
                        }
                    };
                    handled += 1;
                    if handler(Delivery { worker, seq, item }).await == Flow::Stop {
                        tracing::debug!(stage = %name, worker, handled, "worker stopped");
                        break;
                    }
                }
                handled
            });
        }

        tracing::debug!(stage = %self.name, workers = self.workers, "dispatcher started");
        DispatchHandle {
            name: self.name.clone(),
            set,
        }
    }
}

/// Join barrier for a running [`Dispatcher`]
pub struct DispatchHandle {
    name: Arc<str>,
    set: JoinSet<u64>,
}

/// What a dispatcher's workers did
#[derive(Debug, Default)]
pub struct DispatchReport {
    /// Items received across all workers
    pub handled: u64,
    /// Workers that panicked, as [`Error::Panicked`]
    pub panics: Vec<Error>,
}

impl DispatchHandle {
    /// Wait until every worker has returned
    pub async fn join(mut self) -> DispatchReport {
        let mut report = DispatchReport::default();
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok(handled) => report.handled += handled,
                Err(e) => {
                    let error = Error::from(e);
                    tracing::error!(stage = %self.name, %error, "worker failed");
                    report.panics.push(error);
                }
            }
        }
        report
    }
}
