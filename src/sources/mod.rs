//! Stock sources.
//!
//! Each source emits its items through the [`Emitter`] and stops early,
//! returning the cause, if the stage's context fires.

use std::ops::Range;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::{interval, MissedTickBehavior};

use crate::context::Context;
use crate::error::Result;
use crate::traits::{Emitter, Source};

/// A source that emits the numbers of a range in order
#[derive(Debug, Clone)]
pub struct RangeSource {
    range: Range<i64>,
}

impl RangeSource {
    pub fn new(range: Range<i64>) -> Self {
        Self { range }
    }
}

#[async_trait]
impl Source for RangeSource {
    type Item = i64;

    async fn generate(&self, _ctx: &Context, emit: &Emitter<i64>) -> Result<()> {
        for n in self.range.clone() {
            emit.emit(n).await?;
        }
        Ok(())
    }
}

/// A source that emits the items of a vector once, in order.
///
/// The items are handed over on the first run; running the same source again
/// emits nothing.
pub struct VecSource<T> {
    items: Mutex<Option<Vec<T>>>,
}

impl<T> VecSource<T> {
    pub fn new(items: Vec<T>) -> Self {
        Self {
            items: Mutex::new(Some(items)),
        }
    }

    /// Number of items not yet handed over
    pub fn len(&self) -> usize {
        self.items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> From<Vec<T>> for VecSource<T> {
    fn from(items: Vec<T>) -> Self {
        Self::new(items)
    }
}

#[async_trait]
impl<T: Send + 'static> Source for VecSource<T> {
    type Item = T;

    async fn generate(&self, _ctx: &Context, emit: &Emitter<T>) -> Result<()> {
        let items = self
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();
        for item in items {
            emit.emit(item).await?;
        }
        Ok(())
    }
}

/// A source that emits a vector's items one per `period`.
///
/// The first item is emitted immediately. Ticks missed because downstream was
/// slow are delayed, not bunched.
pub struct IntervalSource<T> {
    items: VecSource<T>,
    period: Duration,
}

impl<T> IntervalSource<T> {
    pub fn new(items: Vec<T>, period: Duration) -> Self {
        Self {
            items: VecSource::new(items),
            period,
        }
    }
}

#[async_trait]
impl<T: Send + 'static> Source for IntervalSource<T> {
    type Item = T;

    async fn generate(&self, ctx: &Context, emit: &Emitter<T>) -> Result<()> {
        let items = self
            .items
            .items
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_default();

        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        for item in items {
            ctx.run(ticker.tick()).await?;
            emit.emit(item).await?;
        }
        Ok(())
    }
}
