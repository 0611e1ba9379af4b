//! Stock processors.
//!
//! All of them are stateless per item, so they can run under any worker count.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;

use crate::context::Context;
use crate::error::Result;
use crate::traits::Processor;

/// A processor that maps items using a function.
pub struct MapProcessor<F, T, U> {
    f: F,
    _phantom: PhantomData<fn(T) -> U>,
}

impl<F, T, U> MapProcessor<F, T, U> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T, U> Processor for MapProcessor<F, T, U>
where
    F: Fn(T) -> U + Send + Sync + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn process(&self, _ctx: &Context, item: T) -> Result<Option<U>> {
        Ok(Some((self.f)(item)))
    }
}

/// A processor that maps items using a fallible function.
///
/// An `Err` is handled by the stage's error policy.
pub struct TryMapProcessor<F, T, U> {
    f: F,
    _phantom: PhantomData<fn(T) -> U>,
}

impl<F, T, U> TryMapProcessor<F, T, U> {
    pub fn new(f: F) -> Self {
        Self {
            f,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T, U> Processor for TryMapProcessor<F, T, U>
where
    F: Fn(T) -> Result<U> + Send + Sync + 'static,
    T: Send + 'static,
    U: Send + 'static,
{
    type Input = T;
    type Output = U;

    async fn process(&self, _ctx: &Context, item: T) -> Result<Option<U>> {
        (self.f)(item).map(Some)
    }
}

/// A processor that passes only the items satisfying a predicate.
pub struct FilterProcessor<F, T> {
    predicate: F,
    _phantom: PhantomData<fn(T)>,
}

impl<F, T> FilterProcessor<F, T> {
    pub fn new(predicate: F) -> Self {
        Self {
            predicate,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<F, T> Processor for FilterProcessor<F, T>
where
    F: Fn(&T) -> bool + Send + Sync + 'static,
    T: Send + 'static,
{
    type Input = T;
    type Output = T;

    async fn process(&self, _ctx: &Context, item: T) -> Result<Option<T>> {
        Ok((self.predicate)(&item).then_some(item))
    }
}

/// A processor that holds every item for a fixed delay.
///
/// The delay is cut short, and the item dropped with the cause, if the
/// context fires. Useful to simulate slow I/O.
pub struct DelayProcessor<T> {
    delay: Duration,
    _phantom: PhantomData<fn(T)>,
}

impl<T> DelayProcessor<T> {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            _phantom: PhantomData,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Processor for DelayProcessor<T> {
    type Input = T;
    type Output = T;

    async fn process(&self, ctx: &Context, item: T) -> Result<Option<T>> {
        ctx.run(tokio::time::sleep(self.delay)).await?;
        Ok(Some(item))
    }
}
