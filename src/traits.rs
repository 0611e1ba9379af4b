//! Core traits for stage bodies.
//!
//! A stage body is opaque to the engine: a [`Source`] generates items, a
//! [`Processor`] turns one input into zero or one output, and a [`Sink`]
//! consumes items at the end of a pipeline. Bodies take `&self` because every
//! worker of a stage shares the same body; keep any mutable state behind
//! atomics or locks.
//!
//! Every call receives the stage's [`Context`]. Bodies that block on external
//! I/O should honour it, e.g. with [`Context::run`].

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::stream::Producer;

/// Handle a [`Source`] uses to push items downstream.
pub struct Emitter<T> {
    ctx: Context,
    producer: Producer<T>,
}

impl<T> Clone for Emitter<T> {
    fn clone(&self) -> Self {
        Self {
            ctx: self.ctx.clone(),
            producer: self.producer.clone(),
        }
    }
}

impl<T: Send + 'static> Emitter<T> {
    pub(crate) fn new(ctx: Context, producer: Producer<T>) -> Self {
        Self { ctx, producer }
    }

    /// Send one item downstream.
    ///
    /// Fails with the cancellation cause if the stage's context fires while
    /// waiting for downstream capacity; sources should stop and return it.
    pub async fn emit(&self, item: T) -> Result<()> {
        self.producer.send(&self.ctx, item).await
    }

    /// The context the emitter observes
    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

/// A source generates the items that enter a pipeline.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use pipewright::context::Context;
/// use pipewright::error::Result;
/// use pipewright::traits::{Emitter, Source};
///
/// struct Countdown(u32);
///
/// #[async_trait]
/// impl Source for Countdown {
///     type Item = u32;
///
///     async fn generate(&self, _ctx: &Context, emit: &Emitter<u32>) -> Result<()> {
///         for n in (1..=self.0).rev() {
///             emit.emit(n).await?;
///         }
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Source: Send + Sync + 'static {
    /// The type of items this source generates
    type Item: Send + 'static;

    /// Emit every item, then return.
    ///
    /// Returning `Err` with a non-cancellation error fails the run.
    async fn generate(&self, ctx: &Context, emit: &Emitter<Self::Item>) -> Result<()>;
}

/// A processor transforms items flowing through a stage.
///
/// # Examples
///
/// ```rust
/// use async_trait::async_trait;
/// use pipewright::context::Context;
/// use pipewright::error::Result;
/// use pipewright::traits::Processor;
///
/// struct DropOdd;
///
/// #[async_trait]
/// impl Processor for DropOdd {
///     type Input = i64;
///     type Output = i64;
///
///     async fn process(&self, _ctx: &Context, item: i64) -> Result<Option<i64>> {
///         Ok((item % 2 == 0).then_some(item))
///     }
/// }
/// ```
#[async_trait]
pub trait Processor: Send + Sync + 'static {
    /// The type of items this processor accepts
    type Input: Send + 'static;
    /// The type of items this processor produces
    type Output: Send + 'static;

    /// Process one item.
    ///
    /// `Ok(None)` drops the item without error, which is how filters work.
    /// `Err` is handled according to the stage's
    /// [`ErrorPolicy`](crate::stage::ErrorPolicy).
    async fn process(&self, ctx: &Context, item: Self::Input) -> Result<Option<Self::Output>>;
}

/// A sink consumes items at the end of a pipeline.
#[async_trait]
pub trait Sink: Send + Sync + 'static {
    /// The type of items this sink accepts
    type Item: Send + 'static;

    /// Consume a single item
    async fn write(&self, ctx: &Context, item: Self::Item) -> Result<()>;

    /// Called once after every worker has stopped.
    ///
    /// This allows sinks to flush any buffered state.
    async fn finish(&self, _ctx: &Context) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
impl<S: Source + ?Sized> Source for std::sync::Arc<S> {
    type Item = S::Item;

    async fn generate(&self, ctx: &Context, emit: &Emitter<Self::Item>) -> Result<()> {
        (**self).generate(ctx, emit).await
    }
}

#[async_trait]
impl<P: Processor + ?Sized> Processor for std::sync::Arc<P> {
    type Input = P::Input;
    type Output = P::Output;

    async fn process(&self, ctx: &Context, item: Self::Input) -> Result<Option<Self::Output>> {
        (**self).process(ctx, item).await
    }
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for std::sync::Arc<S> {
    type Item = S::Item;

    async fn write(&self, ctx: &Context, item: Self::Item) -> Result<()> {
        (**self).write(ctx, item).await
    }

    async fn finish(&self, ctx: &Context) -> Result<()> {
        (**self).finish(ctx).await
    }
}
