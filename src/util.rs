//! Closure adapters for stage bodies.
//!
//! Every closure receives the stage's [`Context`] by value alongside its item,
//! so the returned future can own both.

use std::future::Future;
use std::marker::PhantomData;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures_core::Stream as AsyncStream;
use tokio_stream::StreamExt;

use crate::context::Context;
use crate::error::Result;
use crate::processors::FilterProcessor;
use crate::traits::{Emitter, Processor, Sink, Source};

/// Create a source from a function.
///
/// The function is called once with the stage's context and an emitter.
///
/// ```rust
/// use pipewright::util::source_fn;
///
/// let countdown = source_fn(|_ctx, emit| async move {
///     for n in (1..=3).rev() {
///         emit.emit(n).await?;
///     }
///     Ok::<_, pipewright::Error>(())
/// });
/// ```
pub fn source_fn<F, Fut, T>(f: F) -> FnSource<F, T>
where
    F: Fn(Context, Emitter<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    FnSource {
        f,
        _phantom: PhantomData,
    }
}

/// A source created from a function
pub struct FnSource<F, T> {
    f: F,
    _phantom: PhantomData<fn() -> T>,
}

#[async_trait]
impl<F, Fut, T> Source for FnSource<F, T>
where
    F: Fn(Context, Emitter<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    type Item = T;

    async fn generate(&self, ctx: &Context, emit: &Emitter<T>) -> Result<()> {
        (self.f)(ctx.clone(), emit.clone()).await
    }
}

/// Create a source that emits the items of an iterator once
pub fn iter_source<I>(items: I) -> IterSource<I::IntoIter>
where
    I: IntoIterator,
    I::IntoIter: Send + 'static,
    I::Item: Send + 'static,
{
    IterSource {
        iter: Mutex::new(Some(items.into_iter())),
    }
}

/// A source backed by an iterator
pub struct IterSource<I> {
    iter: Mutex<Option<I>>,
}

#[async_trait]
impl<I> Source for IterSource<I>
where
    I: Iterator + Send + 'static,
    I::Item: Send + 'static,
{
    type Item = I::Item;

    async fn generate(&self, _ctx: &Context, emit: &Emitter<I::Item>) -> Result<()> {
        let iter = self.iter.lock().unwrap_or_else(PoisonError::into_inner).take();
        for item in iter.into_iter().flatten() {
            emit.emit(item).await?;
        }
        Ok(())
    }
}

/// Create a source that forwards an async stream until it ends.
///
/// Waiting on the stream observes the stage's context, so a stalled stream
/// does not hold up cancellation.
pub fn stream_source<S>(stream: S) -> StreamSource<S>
where
    S: AsyncStream + Unpin + Send + 'static,
    S::Item: Send + 'static,
{
    StreamSource {
        stream: Mutex::new(Some(stream)),
    }
}

/// A source backed by an async stream
pub struct StreamSource<S> {
    stream: Mutex<Option<S>>,
}

#[async_trait]
impl<S> Source for StreamSource<S>
where
    S: AsyncStream + Unpin + Send + 'static,
    S::Item: Send + 'static,
{
    type Item = S::Item;

    async fn generate(&self, ctx: &Context, emit: &Emitter<S::Item>) -> Result<()> {
        let stream = self.stream.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut stream) = stream else {
            return Ok(());
        };
        while let Some(item) = ctx.run(stream.next()).await? {
            emit.emit(item).await?;
        }
        Ok(())
    }
}

/// Create a processor from an async function.
///
/// Returning `Ok(None)` drops the item.
pub fn processor_fn<F, Fut, T, U>(f: F) -> FnProcessor<F, T, U>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<U>>> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    FnProcessor {
        f,
        _phantom: PhantomData,
    }
}

/// A processor created from a function
pub struct FnProcessor<F, T, U> {
    f: F,
    _phantom: PhantomData<fn(T) -> U>,
}

#[async_trait]
impl<F, Fut, T, U> Processor for FnProcessor<F, T, U>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Option<U>>> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn process(&self, ctx: &Context, item: T) -> Result<Option<U>> {
        (self.f)(ctx.clone(), item).await
    }
}

/// Create a one-to-one processor from an async function.
///
/// ```rust
/// use pipewright::util::map_fn;
///
/// let double = map_fn(|_ctx, x: u64| async move { Ok(x * 2) });
/// ```
pub fn map_fn<F, Fut, T, U>(f: F) -> MapFn<F, T, U>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U>> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    MapFn {
        f,
        _phantom: PhantomData,
    }
}

/// A one-to-one processor created from a function
pub struct MapFn<F, T, U> {
    f: F,
    _phantom: PhantomData<fn(T) -> U>,
}

#[async_trait]
impl<F, Fut, T, U> Processor for MapFn<F, T, U>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<U>> + Send + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn process(&self, ctx: &Context, item: T) -> Result<Option<U>> {
        (self.f)(ctx.clone(), item).await.map(Some)
    }
}

/// Create a filter from a predicate
pub fn filter_fn<F, T>(predicate: F) -> FilterProcessor<F, T>
where
    F: Fn(&T) -> bool + Send + Sync + 'static,
    T: Send + 'static,
{
    FilterProcessor::new(predicate)
}

/// Create a sink from an async function
pub fn sink_fn<F, Fut, T>(f: F) -> FnSink<F, T>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    FnSink {
        f,
        _phantom: PhantomData,
    }
}

/// A sink created from a function
pub struct FnSink<F, T> {
    f: F,
    _phantom: PhantomData<fn(T)>,
}

#[async_trait]
impl<F, Fut, T> Sink for FnSink<F, T>
where
    F: Fn(Context, T) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
    T: Send + 'static,
{
    type Item = T;

    async fn write(&self, ctx: &Context, item: T) -> Result<()> {
        (self.f)(ctx.clone(), item).await
    }
}
