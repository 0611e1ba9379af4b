//! Bounded, closable conduits carrying items between stages.
//!
//! [`channel`] returns a [`Producer`] handle and a [`Stream`]. The producer
//! side is cloneable so every worker of a stage can send, but closing belongs
//! to the stage alone and happens exactly once. The stream side is cloneable
//! too; clones compete for items, so each item reaches exactly one consumer.
//!
//! Every blocking operation takes a [`Context`] and returns its cause as soon
//! as the context fires.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, Mutex as TokioMutex};

use crate::context::Context;
use crate::error::{Error, Result};

/// Default stream capacity: synchronous hand-off
pub const DEFAULT_CAPACITY: usize = 0;

struct Envelope<T> {
    item: T,
    /// Present on zero-capacity streams; signalled once a consumer takes the item
    ack: Option<oneshot::Sender<()>>,
}

impl<T> Envelope<T> {
    /// Take the item, or `None` if its sender withdrew it
    fn open(self) -> Option<T> {
        match self.ack {
            Some(ack) => ack.send(()).ok().map(|()| self.item),
            None => Some(self.item),
        }
    }
}

struct Shared<T> {
    sender: Mutex<Option<mpsc::Sender<Envelope<T>>>>,
    sent: AtomicU64,
    rendezvous: bool,
}

/// Consumer side shared by every clone of a [`Stream`]
struct Receiving<T> {
    rx: mpsc::Receiver<Envelope<T>>,
    /// Position of the next item handed out
    next_seq: u64,
}

impl<T> Receiving<T> {
    /// Next item that was not withdrawn, with its position in the stream
    async fn next(&mut self) -> Option<(u64, T)> {
        while let Some(envelope) = self.rx.recv().await {
            if let Some(item) = envelope.open() {
                let seq = self.next_seq;
                self.next_seq += 1;
                return Some((seq, item));
            }
        }
        None
    }
}

/// Create a stream with the given buffer capacity.
///
/// A capacity of `0` means synchronous hand-off: `send` completes only once a
/// consumer has received the item.
pub fn channel<T: Send + 'static>(capacity: usize) -> (Producer<T>, Stream<T>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let producer = Producer {
        shared: Arc::new(Shared {
            sender: Mutex::new(Some(tx)),
            sent: AtomicU64::new(0),
            rendezvous: capacity == 0,
        }),
    };
    let stream = Stream {
        receiving: Arc::new(TokioMutex::new(Receiving { rx, next_seq: 0 })),
    };
    (producer, stream)
}

/// The sending half of a stream
pub struct Producer<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Producer<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Send + 'static> Producer<T> {
    /// Send an item, waiting for buffer space (or a receiver, at capacity 0).
    ///
    /// Fails with the context's cause if it fires first, and with
    /// [`Error::ChannelClosed`] if the stream was closed or every consumer is gone.
    /// A failed send never delivers its item.
    pub async fn send(&self, ctx: &Context, item: T) -> Result<()> {
        if let Some(cause) = ctx.err() {
            return Err(cause);
        }
        let sender = self
            .shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .ok_or(Error::ChannelClosed)?;

        let (ack, acked) = if self.shared.rendezvous {
            let (tx, rx) = oneshot::channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let envelope = Envelope { item, ack };

        tokio::select! {
            biased;
            _ = ctx.done() => return Err(ctx.cause()),
            sent = sender.send(envelope) => sent.map_err(|_| Error::ChannelClosed)?,
        }
        drop(sender);

        if let Some(mut acked) = acked {
            tokio::select! {
                biased;
                taken = &mut acked => taken.map_err(|_| Error::ChannelClosed)?,
                _ = ctx.done() => {
                    // Withdraw the item unless a consumer took it in the meantime.
                    acked.close();
                    if acked.try_recv().is_err() {
                        return Err(ctx.cause());
                    }
                }
            }
        }
        self.shared.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Close the stream. Consumers see exhaustion once the buffer is empty.
    ///
    /// Returns [`Error::AlreadyClosed`] on a second call.
    pub fn close(&self) -> Result<()> {
        match self
            .shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            Some(_) => Ok(()),
            None => Err(Error::AlreadyClosed),
        }
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.shared
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    /// Number of items successfully sent so far
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }
}

/// The receiving half of a stream
pub struct Stream<T> {
    receiving: Arc<TokioMutex<Receiving<T>>>,
}

impl<T> Clone for Stream<T> {
    fn clone(&self) -> Self {
        Self {
            receiving: self.receiving.clone(),
        }
    }
}

impl<T: Send + 'static> Stream<T> {
    /// Receive the next item, or `None` once the stream is closed and empty
    pub async fn recv(&self, ctx: &Context) -> Result<Option<T>> {
        Ok(self.recv_indexed(ctx).await?.map(|(_, item)| item))
    }

    /// Like [`recv`](Self::recv), also yielding the item's position in the stream.
    ///
    /// Positions count received items from 0 across every clone of the stream.
    pub async fn recv_indexed(&self, ctx: &Context) -> Result<Option<(u64, T)>> {
        if let Some(cause) = ctx.err() {
            return Err(cause);
        }
        tokio::select! {
            biased;
            _ = ctx.done() => Err(ctx.cause()),
            next = async { self.receiving.lock().await.next().await } => Ok(next),
        }
    }

    /// Consume and discard everything until the producer closes the stream.
    ///
    /// Used when abandoning a stream so its producer's pending sends complete
    /// and the producer can exit. Returns the number of items discarded.
    pub async fn drain(&self) -> usize {
        let mut receiving = self.receiving.lock().await;
        let mut discarded = 0;
        while receiving.next().await.is_some() {
            discarded += 1;
        }
        discarded
    }

    /// Receive every remaining item in order
    pub async fn collect(&self, ctx: &Context) -> Result<Vec<T>> {
        let mut items = Vec::new();
        while let Some(item) = self.recv(ctx).await? {
            items.push(item);
        }
        Ok(items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_buffered_send_and_close() {
        let ctx = Context::background();
        let (tx, rx) = channel(4);

        for i in 0..4 {
            tx.send(&ctx, i).await.unwrap();
        }
        tx.close().unwrap();

        assert_eq!(rx.collect(&ctx).await.unwrap(), vec![0, 1, 2, 3]);
        assert!(rx.recv(&ctx).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_double_close_is_rejected() {
        let (tx, _rx) = channel::<i32>(1);
        assert!(!tx.is_closed());
        tx.close().unwrap();
        assert!(tx.is_closed());
        assert!(matches!(tx.close(), Err(Error::AlreadyClosed)));
        assert!(matches!(tx.clone().close(), Err(Error::AlreadyClosed)));
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let ctx = Context::background();
        let (tx, _rx) = channel(1);
        tx.close().unwrap();
        assert!(matches!(tx.send(&ctx, 1).await, Err(Error::ChannelClosed)));
    }

    #[tokio::test]
    async fn test_zero_capacity_waits_for_receiver() {
        let ctx = Context::background();
        let (tx, rx) = channel(0);

        let sender = {
            let ctx = ctx.clone();
            tokio::spawn(async move { tx.send(&ctx, 7).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sender.is_finished());

        assert_eq!(rx.recv(&ctx).await.unwrap(), Some(7));
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_blocked_send_unblocks_on_cancel() {
        let ctx = Context::background();
        let (tx, _rx) = channel(1);
        tx.send(&ctx, 1).await.unwrap();

        let blocked = {
            let ctx = ctx.clone();
            tokio::spawn(async move { tx.send(&ctx, 2).await })
        };
        tokio::task::yield_now().await;
        ctx.cancel();

        let res = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(res, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_blocked_recv_unblocks_on_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let (_tx, rx) = channel::<u8>(1);
        let res = rx.recv(&ctx).await;
        assert!(matches!(res, Err(Error::DeadlineExceeded)));
    }

    #[tokio::test]
    async fn test_drain_releases_producer() {
        let ctx = Context::background();
        let (tx, rx) = channel(0);

        let producer = {
            let ctx = ctx.clone();
            tokio::spawn(async move {
                for i in 0..5 {
                    tx.send(&ctx, i).await?;
                }
                tx.close()
            })
        };

        assert_eq!(rx.drain().await, 5);
        producer.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_indexed_receive() {
        let ctx = Context::background();
        let (tx, rx) = channel(3);
        for c in ['a', 'b', 'c'] {
            tx.send(&ctx, c).await.unwrap();
        }
        assert_eq!(tx.sent(), 3);
        tx.close().unwrap();

        assert_eq!(rx.recv_indexed(&ctx).await.unwrap(), Some((0, 'a')));
        assert_eq!(rx.recv_indexed(&ctx).await.unwrap(), Some((1, 'b')));
        assert_eq!(rx.recv_indexed(&ctx).await.unwrap(), Some((2, 'c')));
    }

    #[tokio::test]
    async fn test_cancelled_hand_off_is_withdrawn() {
        let background = Context::background();
        let ctx = background.child();
        let (tx, rx) = channel(0);

        let blocked = {
            let tx = tx.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { tx.send(&ctx, 7).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
        let res = blocked.await.unwrap();
        assert!(matches!(res, Err(Error::Cancelled)));
        assert_eq!(tx.sent(), 0);

        let next = {
            let tx = tx.clone();
            let ctx = background.clone();
            tokio::spawn(async move { tx.send(&ctx, 8).await })
        };
        // The withdrawn item is skipped and does not take a position.
        assert_eq!(rx.recv_indexed(&background).await.unwrap(), Some((0, 8)));
        next.await.unwrap().unwrap();
        assert_eq!(tx.sent(), 1);

        tx.close().unwrap();
        assert!(rx.recv(&background).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_positions_follow_receive_order() {
        let ctx = Context::background();
        let (tx, rx) = channel(4);
        let other = tx.clone();
        tx.send(&ctx, "a").await.unwrap();
        other.send(&ctx, "b").await.unwrap();
        tx.send(&ctx, "c").await.unwrap();
        tx.close().unwrap();

        let first = rx.clone();
        assert_eq!(first.recv_indexed(&ctx).await.unwrap(), Some((0, "a")));
        assert_eq!(rx.recv_indexed(&ctx).await.unwrap(), Some((1, "b")));
        assert_eq!(first.recv_indexed(&ctx).await.unwrap(), Some((2, "c")));
        assert_eq!(rx.recv_indexed(&ctx).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_dropped_stream_fails_send() {
        let ctx = Context::background();
        let (tx, rx) = channel(1);
        drop(rx);
        assert!(matches!(tx.send(&ctx, 1).await, Err(Error::ChannelClosed)));
    }
}
