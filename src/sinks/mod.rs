//! Stock sinks.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex as TokioMutex;

use crate::context::Context;
use crate::error::Result;
use crate::traits::Sink;

/// A sink that collects items into a vector.
///
/// Clones share the same vector, so keep a clone to read the items after the
/// run. With several workers the collection order is the completion order.
pub struct CollectSink<T> {
    items: Arc<TokioMutex<Vec<T>>>,
}

impl<T: Send + 'static> CollectSink<T> {
    pub fn new() -> Self {
        Self {
            items: Arc::new(TokioMutex::new(Vec::new())),
        }
    }

    /// Get a clone of the items Arc for external access
    pub fn items(&self) -> Arc<TokioMutex<Vec<T>>> {
        self.items.clone()
    }

    /// Take the collected items, leaving the sink empty
    pub async fn take(&self) -> Vec<T> {
        std::mem::take(&mut *self.items.lock().await)
    }
}

#[async_trait]
impl<T: Send + 'static> Sink for CollectSink<T> {
    type Item = T;

    async fn write(&self, _ctx: &Context, item: T) -> Result<()> {
        self.items.lock().await.push(item);
        Ok(())
    }
}

impl<T: Send + 'static> Default for CollectSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CollectSink<T> {
    fn clone(&self) -> Self {
        Self {
            items: self.items.clone(),
        }
    }
}

/// A sink that counts items
pub struct CountSink<T> {
    count: Arc<AtomicU64>,
    _phantom: PhantomData<fn(T)>,
}

impl<T> CountSink<T> {
    pub fn new() -> Self {
        Self {
            count: Arc::new(AtomicU64::new(0)),
            _phantom: PhantomData,
        }
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<T: Send + 'static> Sink for CountSink<T> {
    type Item = T;

    async fn write(&self, _ctx: &Context, _item: T) -> Result<()> {
        self.count.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

impl<T> Default for CountSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Clone for CountSink<T> {
    fn clone(&self) -> Self {
        Self {
            count: self.count.clone(),
            _phantom: PhantomData,
        }
    }
}

/// A sink that drops every item
pub struct DiscardSink<T>(PhantomData<fn(T)>);

impl<T> DiscardSink<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for DiscardSink<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<T: Send + 'static> Sink for DiscardSink<T> {
    type Item = T;

    async fn write(&self, _ctx: &Context, _item: T) -> Result<()> {
        Ok(())
    }
}
