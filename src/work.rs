//! Async item processing with backpressure.
//!
//! The key concepts here are borrowed from ["Queues Don't Fix
//! Overload"](https://ferd.ca/queues-don-t-fix-overload.html). In order to
//! prevent overflow, we limit the number of work items that may be "in flight"
//! at any one time, and once that limit is reached, trying to submit more items
//! for processing will block until one of the in-flight items is completed.
//!
//! Note that this is a strictly "in process" queue. It does not attempt to
//! handle priorities or starvation.

use std::sync::Arc;

use futures::{
    SinkExt as _, StreamExt as _,
    channel::{mpsc, oneshot},
};

use crate::{
    async_utils::{BoxedFuture, JoinWorker},
    prelude::*,
};

/// Work items contain an input, and a one-shot channel on which to return the
/// result.
#[derive(Debug)]
struct WorkItem<Input, Output> {
    input: Input,
    tx: oneshot::Sender<Output>,
}

/// An async work function.
pub type WorkFn<Input, Output> =
    Arc<dyn Fn(Input) -> BoxedFuture<Output> + Send + Sync + 'static>;

/// A handle to a [`WorkQueue`].
///
/// This is basically just a wrapper around a [`mpsc::Sender`]. It can be cloned
/// cheaply and passed around.
pub struct WorkQueueHandle<Input, Output> {
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

// Override `Clone` so that `Input` and `Output` are not required to be `Clone`.
impl<Input, Output> Clone for WorkQueueHandle<Input, Output> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<Input, Output> WorkQueueHandle<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Submit an input and return a channel that will receive the output.
    ///
    /// This will only block if our processing capacity has been maxed out.
    pub async fn submit(&self, input: Input) -> Result<oneshot::Receiver<Output>> {
        let (tx, rx) = oneshot::channel();
        // We need a mutable copy of `tx` to send the item, so we clone it here.
        let mut queue_tx = self.tx.clone();
        queue_tx
            .send(WorkItem { input, tx })
            .await
            .context("failed to send work item")?;
        Ok(rx)
    }
}

/// A queue of work items, processed in parallel.
///
/// We maintain backpressure by limiting the number of work items queued, and
/// the number currently being processed. The worker exits once the queue and
/// every handle to it have been dropped.
pub struct WorkQueue<Input, Output> {
    /// Queue for submitting work items.
    tx: mpsc::Sender<WorkItem<Input, Output>>,
}

impl<Input, Output> WorkQueue<Input, Output>
where
    Input: Send + 'static,
    Output: Send + 'static,
{
    /// Create a new work queue with the given concurrency limit.
    ///
    /// Note that up to `concurrency_limit` work may be waiting at any one time,
    /// and another `concurrency_limit` work items may be in progress.
    pub fn new(
        concurrency_limit: usize,
        work_fn: WorkFn<Input, Output>,
    ) -> Result<(Self, JoinWorker)> {
        if concurrency_limit == 0 {
            return Err(anyhow!("work queue concurrency must be at least 1"));
        }
        let (tx, rx) = mpsc::channel(concurrency_limit);
        let worker = tokio::spawn(async move {
            rx.for_each_concurrent(concurrency_limit, |item: WorkItem<Input, Output>| {
                let work_fn = work_fn.clone();
                async move {
                    let result = work_fn(item.input).await;
                    if item.tx.send(result).is_err() {
                        debug!(
                            "failed to send work item result because receiver was dropped"
                        );
                    }
                }
            })
            .await;
            Ok(())
        });
        Ok((Self { tx }, JoinWorker::from_handle(worker)))
    }

    /// Get a handle for submitting items to the work queue.
    pub fn handle(&self) -> WorkQueueHandle<Input, Output> {
        WorkQueueHandle {
            tx: self.tx.clone(),
        }
    }
}
