//! Stage execution.
//!
//! A stage runs a body on one or more workers between an input and an output
//! [`Stream`]. The output is closed exactly once, after every worker of the
//! stage has returned.

use std::future::Future;
use std::sync::{Arc, OnceLock};

use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::context::Context;
use crate::dispatcher::{Delivery, DispatchReport, Dispatcher, Flow};
use crate::error::{Error, Result};
use crate::report::Reporter;
use crate::stream::{channel, Producer, Stream, DEFAULT_CAPACITY};
use crate::traits::{Emitter, Processor, Sink, Source};

/// What a stage does when its body returns an error for an item
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum ErrorPolicy {
    /// Record the failure and move on to the next item
    #[default]
    SkipAndContinue,
    /// Stop consuming, close the output early, and fail the run
    AbortStage,
}

/// Configuration for a single stage
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StageConfig {
    /// Name used in errors and logs
    pub name: String,
    /// Number of concurrent workers, at least 1
    pub workers: usize,
    /// Capacity of the stage's output stream; 0 is synchronous hand-off
    pub buffer_capacity: usize,
    pub error_policy: ErrorPolicy,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            name: "stage".to_string(),
            workers: 1,
            buffer_capacity: DEFAULT_CAPACITY,
            error_policy: ErrorPolicy::default(),
        }
    }
}

impl StageConfig {
    /// Create a config with the given name and defaults otherwise
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the worker count. Zero is raised to one.
    pub fn workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Set the output buffer capacity
    pub fn buffer_capacity(mut self, capacity: usize) -> Self {
        self.buffer_capacity = capacity;
        self
    }

    /// Set the error policy
    pub fn error_policy(mut self, policy: ErrorPolicy) -> Self {
        self.error_policy = policy;
        self
    }

    /// Shorthand for `error_policy(ErrorPolicy::AbortStage)`
    pub fn abort_on_error(self) -> Self {
        self.error_policy(ErrorPolicy::AbortStage)
    }
}

/// Handle for a running stage.
///
/// A stage *settles* once its workers have returned and its output is closed.
/// It is fully torn down once any post-abort drain of its input has finished.
pub struct StageHandle {
    name: Arc<str>,
    outcome: Option<oneshot::Receiver<Result<()>>>,
    settled: Option<Result<()>>,
    task: JoinHandle<()>,
}

impl StageHandle {
    /// Spawn a stage supervisor. The supervisor reports the stage outcome on
    /// the sender it is given as soon as the stage settles.
    pub(crate) fn spawn<F, Fut>(name: Arc<str>, supervisor: F) -> Self
    where
        F: FnOnce(oneshot::Sender<Result<()>>) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let task = tokio::spawn(supervisor(tx));
        Self {
            name,
            outcome: Some(rx),
            settled: None,
            task,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wait until the stage settles, returning its terminal failure if any
    pub async fn settled(&mut self) -> Result<()> {
        if let Some(outcome) = &self.settled {
            return outcome.clone();
        }
        let outcome = match self.outcome.take() {
            Some(rx) => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(Error::stage(
                    self.name.clone(),
                    None,
                    Error::Panicked("stage exited before settling".to_string()),
                )),
            },
            None => Ok(()),
        };
        self.settled = Some(outcome.clone());
        outcome
    }

    /// Wait for full teardown
    pub async fn join(mut self) -> Result<()> {
        let outcome = self.settled().await;
        let outcome = match (&mut self.task).await {
            Ok(()) => outcome,
            Err(e) => Err(Error::stage(self.name.clone(), None, e.into())),
        };
        #[cfg(feature = "metrics")]
        crate::metrics::record_stage_finished(&self.name);
        outcome
    }
}

/// Start a source stage.
///
/// Runs a single worker that calls [`Source::generate`] once; the output is
/// closed when it returns or the context fires.
pub fn spawn_source<S>(
    ctx: &Context,
    source: S,
    config: &StageConfig,
    reporter: &Reporter,
) -> (Stream<S::Item>, StageHandle)
where
    S: Source,
{
    let name: Arc<str> = Arc::from(config.name.as_str());
    let (producer, stream) = channel(config.buffer_capacity);
    let ctx = ctx.child();
    let reporter = reporter.clone();

    let handle = StageHandle::spawn(name.clone(), move |settle| async move {
        tracing::debug!(stage = %name, "source started");
        let emitter = Emitter::new(ctx.clone(), producer.clone());
        let outcome = match source.generate(&ctx, &emitter).await {
            Ok(()) => Ok(()),
            Err(e) if ctx.is_done() => {
                tracing::debug!(stage = %name, cause = %e, "source cancelled");
                Ok(())
            }
            Err(e) => {
                let error = Error::stage(name.clone(), None, e);
                tracing::error!(stage = %name, %error, "source failed");
                record_error(&name);
                reporter.fail(error.clone());
                Err(error)
            }
        };
        close_output(&name, &producer);
        let _ = settle.send(outcome);
    });

    (stream, handle)
}

/// Start a processor stage with `config.workers` workers reading `input`.
///
/// With one worker the output order matches the input order; with more it is
/// the order in which workers finish.
pub fn spawn_processor<P>(
    ctx: &Context,
    input: Stream<P::Input>,
    processor: P,
    config: &StageConfig,
    reporter: &Reporter,
) -> (Stream<P::Output>, StageHandle)
where
    P: Processor,
{
    let name: Arc<str> = Arc::from(config.name.as_str());
    let (producer, stream) = channel(config.buffer_capacity);
    let guard = StageGuard::new(name.clone(), ctx, config.error_policy, reporter.clone());
    let processor = Arc::new(processor);

    let workers = Dispatcher::new(name.clone(), config.workers).run(&guard.ctx, input.clone(), {
        let guard = guard.clone();
        let producer = producer.clone();
        move |delivery: Delivery<P::Input>| {
            let guard = guard.clone();
            let producer = producer.clone();
            let processor = processor.clone();
            async move {
                let Delivery { worker, seq, item } = delivery;
                match processor.process(&guard.ctx, item).await {
                    Ok(Some(output)) => match producer.send(&guard.ctx, output).await {
                        Ok(()) => Flow::Continue,
                        Err(_) => Flow::Stop,
                    },
                    Ok(None) => Flow::Continue,
                    // Errors raised once the stage context fired belong to the cancellation.
                    Err(_) if guard.ctx.is_done() => Flow::Stop,
                    Err(e) => guard.item_failed(worker, seq, e),
                }
            }
        }
    });

    let handle = StageHandle::spawn(name, move |settle| async move {
        let report = workers.join().await;
        let outcome = guard.outcome(report);
        close_output(&guard.name, &producer);
        let aborted = outcome.is_err();
        let _ = settle.send(outcome);
        if aborted {
            abandon_input(&guard.name, &input).await;
        }
    });

    (stream, handle)
}

/// Start a sink stage with `config.workers` workers reading `input`.
///
/// Every successful write counts as a processed item. Any sink failure marks
/// the run failed; the policy decides whether the remaining items are still
/// written.
pub fn spawn_sink<S>(
    ctx: &Context,
    input: Stream<S::Item>,
    sink: S,
    config: &StageConfig,
    reporter: &Reporter,
) -> StageHandle
where
    S: Sink,
{
    let name: Arc<str> = Arc::from(config.name.as_str());
    // Sink failures fail the run whatever the policy.
    let guard = StageGuard::new(name.clone(), ctx, config.error_policy, reporter.clone()).terminal();
    let sink = Arc::new(sink);

    let workers = Dispatcher::new(name.clone(), config.workers).run(&guard.ctx, input.clone(), {
        let guard = guard.clone();
        let sink = sink.clone();
        move |delivery: Delivery<S::Item>| {
            let guard = guard.clone();
            let sink = sink.clone();
            async move {
                let Delivery { worker, seq, item } = delivery;
                match sink.write(&guard.ctx, item).await {
                    Ok(()) => {
                        guard.reporter.record_processed();
                        #[cfg(feature = "metrics")]
                        crate::metrics::record_processed(&guard.name);
                        Flow::Continue
                    }
                    Err(_) if guard.ctx.is_done() => Flow::Stop,
                    Err(e) => guard.item_failed(worker, seq, e),
                }
            }
        }
    });

    StageHandle::spawn(name, move |settle| async move {
        let report = workers.join().await;
        let handled = report.handled;
        let mut outcome = guard.outcome(report);
        if let Err(e) = sink.finish(&guard.ctx).await {
            if !guard.ctx.is_done() {
                let error = Error::stage(guard.name.clone(), None, e);
                tracing::error!(stage = %guard.name, %error, "sink finish failed");
                guard.reporter.fail(error.clone());
                outcome = outcome.and(Err(error));
            }
        }
        tracing::debug!(stage = %guard.name, handled, "sink finished");
        let aborted = outcome.is_err();
        let _ = settle.send(outcome);
        if aborted {
            abandon_input(&guard.name, &input).await;
        }
    })
}

/// Per-stage state shared by the workers of one stage
#[derive(Clone)]
struct StageGuard {
    name: Arc<str>,
    /// Child of the run context; cancelled on abort to stop sibling workers
    ctx: Context,
    policy: ErrorPolicy,
    reporter: Reporter,
    /// Skipped item failures still fail the run
    terminal: bool,
    abort: Arc<OnceLock<Error>>,
}

impl StageGuard {
    fn new(name: Arc<str>, parent: &Context, policy: ErrorPolicy, reporter: Reporter) -> Self {
        Self {
            name,
            ctx: parent.child(),
            policy,
            reporter,
            terminal: false,
            abort: Arc::new(OnceLock::new()),
        }
    }

    fn terminal(mut self) -> Self {
        self.terminal = true;
        self
    }

    /// Apply the error policy to a failed item
    fn item_failed(&self, worker: usize, seq: u64, error: Error) -> Flow {
        let error = Error::stage(self.name.clone(), Some(seq), error);
        record_error(&self.name);
        match self.policy {
            ErrorPolicy::SkipAndContinue => {
                tracing::warn!(stage = %self.name, worker, item = seq, %error, "item failed, skipping");
                if self.terminal {
                    self.reporter.fail(error);
                } else {
                    self.reporter.report(error);
                }
                Flow::Continue
            }
            ErrorPolicy::AbortStage => {
                tracing::error!(stage = %self.name, worker, item = seq, %error, "item failed, aborting stage");
                if self.abort.set(error.clone()).is_ok() {
                    self.ctx.cancel_with(error.clone());
                    self.reporter.fail(error);
                } else {
                    self.reporter.report(error);
                }
                Flow::Stop
            }
        }
    }

    /// The stage's terminal outcome once its workers are joined
    fn outcome(&self, report: DispatchReport) -> Result<()> {
        let mut outcome = match self.abort.get() {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        };
        for panic in report.panics {
            let error = Error::stage(self.name.clone(), None, panic);
            self.reporter.fail(error.clone());
            outcome = outcome.and(Err(error));
        }
        outcome
    }
}

fn close_output<T: Send + 'static>(name: &str, producer: &Producer<T>) {
    match producer.close() {
        Ok(()) => tracing::debug!(stage = %name, sent = producer.sent(), "output closed"),
        Err(e) => tracing::warn!(stage = %name, error = %e, "output closed twice"),
    }
}

/// Discard the rest of an abandoned input so the upstream producer's pending
/// sends complete and it can exit.
async fn abandon_input<T: Send + 'static>(name: &str, input: &Stream<T>) {
    let discarded = input.drain().await;
    tracing::debug!(stage = %name, discarded, "input drained after abort");
}

fn record_error(_name: &str) {
    #[cfg(feature = "metrics")]
    crate::metrics::record_error(_name);
}
