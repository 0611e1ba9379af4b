//! Pipeline assembly and execution.
//!
//! A pipeline is a chain of stages built from a source, any number of
//! processor and merge stages, and exactly one sink. Nothing runs until
//! [`Pipeline::run`]; running wires each stage's output stream into the next
//! stage and drives the whole chain to completion.

use std::fmt;
use std::time::Duration;

use tokio::time::Instant;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::report::Reporter;
use crate::stage::{spawn_processor, spawn_sink, spawn_source, StageConfig, StageHandle};
use crate::stream::Stream;
use crate::traits::{Processor, Sink, Source};

/// Configuration for pipeline execution
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PipelineConfig {
    /// Name used in logs
    pub name: String,
    /// Deadline for the whole run, measured from the start of [`Pipeline::run`]
    pub deadline: Option<Duration>,
    /// Cancel every stage on the first terminal stage failure
    pub fail_fast: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            name: "pipeline".to_string(),
            deadline: None,
            fail_fast: false,
        }
    }
}

impl PipelineConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Set the run deadline
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Set whether to fail fast on terminal stage failures
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.fail_fast = fail_fast;
        self
    }
}

/// Resources shared by every stage of one run
struct Launch {
    ctx: Context,
    reporter: Reporter,
    handles: Vec<StageHandle>,
}

type Assemble<T> = Box<dyn FnOnce(&mut Launch) -> Stream<T> + Send>;

/// An unfinished pipeline whose last stage produces `T`
pub struct PipelineBuilder<T> {
    assemble: Assemble<T>,
    config: PipelineConfig,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Append a processor stage
    pub fn stage<P>(self, processor: P, config: StageConfig) -> PipelineBuilder<P::Output>
    where
        P: Processor<Input = T>,
    {
        let upstream = self.assemble;
        PipelineBuilder {
            assemble: Box::new(move |launch| {
                let input = upstream(launch);
                let (output, handle) =
                    spawn_processor(&launch.ctx, input, processor, &config, &launch.reporter);
                launch.handles.push(handle);
                output
            }),
            config: self.config,
        }
    }

    /// Merge this branch with `others` into a single stream.
    ///
    /// The merged pipeline keeps this builder's configuration.
    pub fn merge<I>(self, others: I, config: StageConfig) -> Self
    where
        I: IntoIterator<Item = PipelineBuilder<T>>,
    {
        let branches: Vec<Assemble<T>> = std::iter::once(self.assemble)
            .chain(others.into_iter().map(|branch| branch.assemble))
            .collect();
        PipelineBuilder {
            assemble: Box::new(move |launch| {
                let inputs = branches.into_iter().map(|branch| branch(launch)).collect();
                let (output, handle) = crate::merge::merge(&launch.ctx, inputs, &config);
                launch.handles.push(handle);
                output
            }),
            config: self.config,
        }
    }

    /// Set the pipeline name
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.config.name = name.into();
        self
    }

    /// Set a deadline for every run
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.config.deadline = Some(deadline);
        self
    }

    /// Set whether to fail fast on terminal stage failures
    pub fn fail_fast(mut self, fail_fast: bool) -> Self {
        self.config.fail_fast = fail_fast;
        self
    }

    /// Replace the pipeline configuration
    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    /// Finish the pipeline with its terminal sink
    pub fn sink<S>(self, sink: S, config: StageConfig) -> Pipeline
    where
        S: Sink<Item = T>,
    {
        let upstream = self.assemble;
        Pipeline {
            launch: Box::new(move |launch| {
                let input = upstream(launch);
                spawn_sink(&launch.ctx, input, sink, &config, &launch.reporter)
            }),
            config: self.config,
        }
    }
}

/// A complete pipeline, ready to run.
///
/// # Examples
///
/// ```rust
/// use pipewright::prelude::*;
///
/// #[tokio::main]
/// async fn main() {
///     let collected = CollectSink::new();
///     let result = Pipeline::source(RangeSource::new(1..11), StageConfig::new("numbers"))
///         .stage(FilterProcessor::new(|x: &i64| x % 2 == 1), StageConfig::new("odd"))
///         .stage(MapProcessor::new(|x: i64| x * 2), StageConfig::new("double").workers(3))
///         .sink(collected.clone(), StageConfig::new("collect"))
///         .run(&Context::background())
///         .await;
///
///     assert_eq!(result.outcome(), Outcome::Success);
///     let mut items = collected.take().await;
///     items.sort_unstable();
///     assert_eq!(items, vec![2, 6, 10, 14, 18]);
/// }
/// ```
pub struct Pipeline {
    launch: Box<dyn FnOnce(&mut Launch) -> StageHandle + Send>,
    config: PipelineConfig,
}

impl Pipeline {
    /// Start building a pipeline from a source stage
    pub fn source<S>(source: S, config: StageConfig) -> PipelineBuilder<S::Item>
    where
        S: Source,
    {
        PipelineBuilder {
            assemble: Box::new(move |launch| {
                let (output, handle) = spawn_source(&launch.ctx, source, &config, &launch.reporter);
                launch.handles.push(handle);
                output
            }),
            config: PipelineConfig::default(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Run every stage to completion under `ctx`.
    ///
    /// Returns once the sink has finished and every stage has been torn down.
    /// Cancelling `ctx` or passing the configured deadline ends the run early;
    /// the cause is recorded in the result.
    pub async fn run(self, ctx: &Context) -> PipelineResult {
        let Pipeline { launch, config } = self;
        let started = Instant::now();

        let run_ctx = match config.deadline {
            Some(deadline) => ctx.with_timeout(deadline),
            None => ctx.child(),
        };
        // Stages run under a child of the run context so the pipeline can tear
        // them down without recording an external cause.
        let teardown = run_ctx.child();

        let (reporter, log) = Reporter::new();
        let reporter = if config.fail_fast {
            reporter.with_fail_fast(teardown.clone())
        } else {
            reporter
        };

        tracing::debug!(pipeline = %config.name, deadline = ?config.deadline, "pipeline started");
        let mut stages = Launch {
            ctx: teardown.clone(),
            reporter,
            handles: Vec::new(),
        };
        let mut sink = launch(&mut stages);

        if let Err(error) = sink.settled().await {
            tracing::debug!(pipeline = %config.name, %error, "sink ended with failure");
        }
        let cause = run_ctx.err();
        teardown.cancel();

        let Launch {
            reporter, handles, ..
        } = stages;
        for handle in handles.into_iter().chain(std::iter::once(sink)) {
            let name = handle.name().to_string();
            if let Err(error) = handle.join().await {
                tracing::debug!(pipeline = %config.name, stage = %name, %error, "stage torn down with failure");
            }
        }
        drop(reporter);

        let summary = log.summarize();
        let result = PipelineResult {
            items_processed: summary.processed,
            failed_items: summary.failed_items,
            errors: summary.errors,
            cause,
            failed: summary.failed,
            elapsed: started.elapsed(),
        };
        tracing::info!(
            pipeline = %config.name,
            items = result.items_processed,
            errors = result.errors.len(),
            outcome = %result.outcome(),
            elapsed_ms = result.elapsed.as_millis() as u64,
            "pipeline finished"
        );
        result
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline").field("config", &self.config).finish()
    }
}

/// Overall classification of a finished run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Every item made it through and nothing failed
    Success,
    /// Items made it through, but some were skipped after failing
    PartialSuccess,
    /// A stage failed terminally, or every item failed
    Failed,
    /// The caller's context was cancelled
    Cancelled,
    /// The run or the caller's context passed its deadline
    TimedOut,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::PartialSuccess => "partial success",
            Outcome::Failed => "failed",
            Outcome::Cancelled => "cancelled",
            Outcome::TimedOut => "timed out",
        };
        f.write_str(s)
    }
}

/// What a pipeline run did
#[derive(Debug, Clone)]
pub struct PipelineResult {
    /// Items the sink consumed successfully
    pub items_processed: u64,
    /// Item failures recorded across all stages
    pub failed_items: u64,
    /// Recorded stage errors in order of occurrence
    pub errors: Vec<Error>,
    /// Why the caller's context or the run deadline ended the run, if it did
    pub cause: Option<Error>,
    /// Whether a stage failed terminally
    pub failed: bool,
    pub elapsed: Duration,
}

impl PipelineResult {
    /// Classify the run.
    ///
    /// An external cause takes precedence. Otherwise a terminal failure, or
    /// recorded errors with nothing processed, is `Failed`; recorded errors
    /// alongside processed items are `PartialSuccess`.
    pub fn outcome(&self) -> Outcome {
        match &self.cause {
            Some(cause) if cause.is_deadline_exceeded() => Outcome::TimedOut,
            Some(_) => Outcome::Cancelled,
            None if self.failed => Outcome::Failed,
            None if self.errors.is_empty() => Outcome::Success,
            None if self.items_processed == 0 => Outcome::Failed,
            None => Outcome::PartialSuccess,
        }
    }

    pub fn is_success(&self) -> bool {
        self.outcome() == Outcome::Success
    }

    /// The number of processed items for successful and partially successful
    /// runs, the cause or the folded errors otherwise
    pub fn into_result(self) -> Result<u64> {
        match self.outcome() {
            Outcome::Success | Outcome::PartialSuccess => Ok(self.items_processed),
            Outcome::Cancelled | Outcome::TimedOut => Err(self.cause.unwrap_or(Error::Cancelled)),
            Outcome::Failed => {
                Err(Error::aggregate(self.errors).unwrap_or_else(|| Error::custom("pipeline failed")))
            }
        }
    }
}
