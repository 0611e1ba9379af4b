//! # Cancellable concurrent pipelines for tokio
//!
//! This crate assembles stages into a chain connected by bounded streams,
//! runs stages on one or more workers, merges several streams into one, and
//! propagates cancellation and deadlines to every in-flight stage without
//! leaving a worker blocked behind.
//!
//! ## Core Concepts
//!
//! - **Context**: a cancellation/deadline signal shared by cooperating workers
//! - **Stream**: a bounded, closable conduit between stages
//! - **Source / Processor / Sink**: the bodies that generate, transform and consume items
//! - **Pipeline**: a chain of stages driven to completion, with aggregated errors
//! - **TaskGroup**: independent deadline-bound tasks with collected errors
//!
//! ## Example
//!
//! ```rust
//! use pipewright::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let collected = CollectSink::new();
//!
//!     let processed = Pipeline::source(RangeSource::new(1..101), StageConfig::new("numbers"))
//!         .stage(MapProcessor::new(|x: i64| x * 2), StageConfig::new("double").workers(4))
//!         .sink(collected.clone(), StageConfig::new("collect"))
//!         .run(&Context::background())
//!         .await
//!         .into_result()?;
//!
//!     assert_eq!(processed, 100);
//!     Ok(())
//! }
//! ```

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod group;
pub mod merge;
pub mod pipeline;
pub mod processors;
pub mod report;
pub mod sinks;
pub mod sources;
pub mod stage;
pub mod stream;
pub mod traits;
pub mod util;

#[cfg(feature = "metrics")]
mod metrics;

// Re-export commonly used items
pub mod prelude {
    pub use crate::context::Context;
    pub use crate::dispatcher::{Delivery, Dispatcher, Flow};
    pub use crate::error::{Error, Result};
    pub use crate::group::{TaskGroup, TaskId};
    pub use crate::merge::merge;
    pub use crate::pipeline::{Outcome, Pipeline, PipelineBuilder, PipelineConfig, PipelineResult};
    pub use crate::processors::*;
    pub use crate::sinks::*;
    pub use crate::sources::*;
    pub use crate::stage::{ErrorPolicy, StageConfig};
    pub use crate::stream::{channel, Producer, Stream};
    pub use crate::traits::{Emitter, Processor, Sink, Source};
    pub use crate::util::{filter_fn, iter_source, map_fn, processor_fn, sink_fn, source_fn, stream_source};
}

// Re-export main error type
pub use error::{Error, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
