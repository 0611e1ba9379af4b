//! Error types for the pipeline engine.
//!
//! Cancellation and deadline expiry are kept apart from domain failures so a
//! caller can always tell "timed out" from "a stage body failed".

use std::fmt;
use std::sync::Arc;

use crate::group::TaskId;

/// The main error type for pipelines, streams, and task groups.
///
/// `Error` is `Clone` so one cancellation cause can be handed to every worker
/// observing the same context.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Error {
    /// A context fired before the operation completed
    #[error("operation cancelled")]
    Cancelled,

    /// A deadline-bound context expired
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// A stage body reported a failure
    #[error("stage `{stage}` failed{}: {source}", ItemRef(.item))]
    Stage {
        stage: Arc<str>,
        /// Position of the failing item in the stage's input stream
        item: Option<u64>,
        #[source]
        source: Box<Error>,
    },

    /// A task spawned into a [`TaskGroup`](crate::group::TaskGroup) failed
    #[error("task {task} failed: {source}")]
    Task {
        task: TaskId,
        #[source]
        source: Box<Error>,
    },

    /// Several errors surfaced together, in order of occurrence
    #[error("{}", Multiple(.0))]
    Aggregate(Vec<Error>),

    /// `close` was called on a stream that was already closed
    #[error("stream was already closed")]
    AlreadyClosed,

    /// The other end of a stream is gone
    #[error("channel was closed unexpectedly")]
    ChannelClosed,

    /// A worker or task panicked
    #[error("worker panicked: {0}")]
    Panicked(String),

    /// A custom error with a message
    #[error("{0}")]
    Custom(String),

    /// An error raised by an external collaborator (HTTP client, parser, ...)
    #[error(transparent)]
    External(Arc<dyn std::error::Error + Send + Sync>),
}

struct ItemRef<'a>(&'a Option<u64>);

impl fmt::Display for ItemRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(item) => write!(f, " on item #{}", item),
            None => Ok(()),
        }
    }
}

struct Multiple<'a>(&'a [Error]);

impl fmt::Display for Multiple<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.0.len())?;
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "[{}]", error)?;
        }
        Ok(())
    }
}

// Convenience constructors
impl Error {
    /// Create a custom error with a message
    pub fn custom<S: Into<String>>(message: S) -> Self {
        Error::Custom(message.into())
    }

    /// Wrap an error coming from outside the engine
    pub fn external<E: std::error::Error + Send + Sync + 'static>(error: E) -> Self {
        Error::External(Arc::new(error))
    }

    /// Attribute a body failure to a stage and, when known, an input item
    pub fn stage(stage: impl Into<Arc<str>>, item: Option<u64>, source: Error) -> Self {
        Error::Stage {
            stage: stage.into(),
            item,
            source: Box::new(source),
        }
    }

    /// Attribute a failure to a task
    pub fn task(task: TaskId, source: Error) -> Self {
        Error::Task {
            task,
            source: Box::new(source),
        }
    }

    /// Fold a list of errors into one, or `None` when the list is empty
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    /// The innermost error, looking through stage and task attribution
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } | Error::Task { source, .. } => source.root(),
            other => other,
        }
    }

    /// True for `Cancelled` and `DeadlineExceeded`, wrapped or not
    pub fn is_cancellation(&self) -> bool {
        matches!(self.root(), Error::Cancelled | Error::DeadlineExceeded)
    }

    /// True when the root cause is an expired deadline
    pub fn is_deadline_exceeded(&self) -> bool {
        matches!(self.root(), Error::DeadlineExceeded)
    }
}

// Common conversions
impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::DeadlineExceeded
    }
}

impl From<tokio::task::JoinError> for Error {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            Error::Cancelled
        } else {
            Error::Panicked(err.to_string())
        }
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Custom(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Custom(s.to_string())
    }
}

/// Convenience type alias for Results in this crate
pub type Result<T> = std::result::Result<T, Error>;

/// Helper trait for converting foreign errors into our Error type
pub trait IntoError<T> {
    fn into_external_error(self) -> Result<T>;
}

impl<T, E> IntoError<T> for std::result::Result<T, E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn into_external_error(self) -> Result<T> {
        self.map_err(Error::external)
    }
}

/// Render a panic payload as a message
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
