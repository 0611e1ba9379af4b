//! Per-run aggregate state.
//!
//! Workers never share mutable tallies directly: errors travel over a
//! dedicated channel (so their order is the order they occurred in) and
//! counters are atomics.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::context::Context;
use crate::error::Error;

#[derive(Default)]
struct Tally {
    processed: AtomicU64,
    failed_items: AtomicU64,
    failed: AtomicBool,
}

/// Cloneable handle used by stages to report into a run
#[derive(Clone)]
pub struct Reporter {
    errors: mpsc::UnboundedSender<Error>,
    tally: Arc<Tally>,
    /// Cancelled on the first terminal failure when the run is fail-fast
    fail_fast: Option<Context>,
}

/// The reading side of a run's reports
pub struct RunLog {
    errors: mpsc::UnboundedReceiver<Error>,
    tally: Arc<Tally>,
}

/// Snapshot of a finished run's reports
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub processed: u64,
    pub failed_items: u64,
    pub failed: bool,
    /// Recorded errors in order of occurrence
    pub errors: Vec<Error>,
}

impl Reporter {
    /// Create a reporter and the log it feeds
    pub fn new() -> (Self, RunLog) {
        let (tx, rx) = mpsc::unbounded_channel();
        let tally = Arc::new(Tally::default());
        let reporter = Self {
            errors: tx,
            tally: tally.clone(),
            fail_fast: None,
        };
        (reporter, RunLog { errors: rx, tally })
    }

    /// Cancel `ctx` with the failure's cause on the first terminal failure
    pub fn with_fail_fast(mut self, ctx: Context) -> Self {
        self.fail_fast = Some(ctx);
        self
    }

    /// Record a recoverable per-item failure
    pub fn report(&self, error: Error) {
        self.tally.failed_items.fetch_add(1, Ordering::Relaxed);
        // The log outlives every reporter during a run; a closed log means
        // nobody is left to read the error.
        let _ = self.errors.send(error);
    }

    /// Record a failure that ends the run as failed
    pub fn fail(&self, error: Error) {
        self.tally.failed.store(true, Ordering::Release);
        if let Some(ctx) = &self.fail_fast {
            ctx.cancel_with(error.clone());
        }
        self.report(error);
    }

    /// Count an item that reached the end of the pipeline
    pub fn record_processed(&self) {
        self.tally.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn processed(&self) -> u64 {
        self.tally.processed.load(Ordering::Relaxed)
    }

    pub fn is_failed(&self) -> bool {
        self.tally.failed.load(Ordering::Acquire)
    }
}

impl RunLog {
    /// Collect everything reported so far.
    ///
    /// Call after every reporting worker has been joined.
    pub fn summarize(mut self) -> RunSummary {
        let mut errors = Vec::new();
        while let Ok(error) = self.errors.try_recv() {
            errors.push(error);
        }
        self.errors.close();
        RunSummary {
            processed: self.tally.processed.load(Ordering::Relaxed),
            failed_items: self.tally.failed_items.load(Ordering::Relaxed),
            failed: self.tally.failed.load(Ordering::Acquire),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_errors_keep_occurrence_order() {
        let (reporter, log) = Reporter::new();
        reporter.report(Error::custom("first"));
        reporter.clone().report(Error::custom("second"));
        reporter.record_processed();
        reporter.record_processed();

        let summary = log.summarize();
        assert_eq!(summary.processed, 2);
        assert_eq!(summary.failed_items, 2);
        assert!(!summary.failed);
        let messages: Vec<_> = summary.errors.iter().map(ToString::to_string).collect();
        assert_eq!(messages, vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_fail_fast_cancels_context() {
        let ctx = Context::background();
        let (reporter, log) = Reporter::new();
        let reporter = reporter.with_fail_fast(ctx.clone());

        reporter.fail(Error::custom("fatal"));
        assert!(reporter.is_failed());
        assert_eq!(ctx.err().unwrap().to_string(), "fatal");
        assert!(log.summarize().failed);
    }

    #[tokio::test]
    async fn test_concurrent_tallies() {
        let (reporter, log) = Reporter::new();
        let mut tasks = tokio::task::JoinSet::new();
        for _ in 0..8 {
            let reporter = reporter.clone();
            tasks.spawn(async move {
                for _ in 0..100 {
                    reporter.record_processed();
                }
            });
        }
        while tasks.join_next().await.is_some() {}
        assert_eq!(log.summarize().processed, 800);
    }
}
