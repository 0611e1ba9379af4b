//! Fan-in: many streams into one.

use std::sync::Arc;

use tokio::task::JoinSet;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::stage::{StageConfig, StageHandle};
use crate::stream::{channel, Stream};

/// Merge `inputs` into a single stream.
///
/// One forwarder runs per input. The output carries every input item exactly
/// once; items from the same input keep their relative order, with no
/// ordering guarantee across inputs. The output is closed once, after every
/// forwarder has finished. An empty `inputs` yields an already closed stream.
///
/// `config.name` and `config.buffer_capacity` apply; the worker count is the
/// number of inputs.
pub fn merge<T>(ctx: &Context, inputs: Vec<Stream<T>>, config: &StageConfig) -> (Stream<T>, StageHandle)
where
    T: Send + 'static,
{
    let name: Arc<str> = Arc::from(config.name.as_str());
    let (producer, output) = channel(config.buffer_capacity);
    let ctx = ctx.child();
    let sources = inputs.len();

    let mut forwarders = JoinSet::new();
    for (index, input) in inputs.into_iter().enumerate() {
        let ctx = ctx.clone();
        let producer = producer.clone();
        forwarders.spawn(async move {
            let mut forwarded = 0u64;
            loop {
                let item = match input.recv(&ctx).await {
                    Ok(Some(item)) => item,
                    Ok(None) => break,
                    Err(_) => return forwarded,
                };
                if producer.send(&ctx, item).await.is_err() {
                    return forwarded;
                }
                forwarded += 1;
            }
            tracing::trace!(input = index, forwarded, "merge input exhausted");
            forwarded
        });
    }

    let handle = StageHandle::spawn(name.clone(), move |settle| async move {
        tracing::debug!(stage = %name, sources, "merge started");
        let mut outcome: Result<()> = Ok(());
        let mut forwarded = 0u64;
        while let Some(joined) = forwarders.join_next().await {
            match joined {
                Ok(n) => forwarded += n,
                Err(e) => {
                    let error = Error::stage(name.clone(), None, e.into());
                    tracing::error!(stage = %name, %error, "merge forwarder failed");
                    outcome = outcome.and(Err(error));
                }
            }
        }
        if producer.close().is_err() {
            tracing::warn!(stage = %name, "merge output closed twice");
        }
        tracing::debug!(stage = %name, forwarded, "merge finished");
        let _ = settle.send(outcome);
    });

    (output, handle)
}
