use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;

use crate::firestore::error::{cancelled, FirestoreResult};
use crate::platform::runtime;

/// Identifies the purpose of a delayed operation, for logging and cancellation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    /// Promotes an open stream to healthy once it stayed up long enough.
    HealthCheckTimeout,
    OnlineStateTimeout,
    IndexBackfill,
    PersistenceRecovery,
}

type Job<S> = Box<dyn FnOnce(&mut S) + Send + 'static>;

enum QueueMessage<S> {
    Run(Job<S>),
    Shutdown(oneshot::Sender<()>),
}

/// Runs operations against a state value one at a time, in the order they were
/// enqueued.
///
/// The worker task owns the state, so operations never need locks. Results flow
/// back to callers through oneshot channels.
pub struct AsyncQueue<S> {
    sender: Sender<QueueMessage<S>>,
    shutting_down: Arc<AtomicBool>,
}

impl<S> Clone for AsyncQueue<S> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
            shutting_down: Arc::clone(&self.shutting_down),
        }
    }
}

impl<S> AsyncQueue<S>
where
    S: Send + 'static,
{
    /// Starts the worker that owns `state`.
    pub fn start(state: S) -> Self {
        // Unbounded so that enqueueing never blocks and never reorders work.
        let (sender, receiver) = async_channel::unbounded();
        runtime::spawn_detached(run_worker(state, receiver));
        Self {
            sender,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Builds a queue whose state needs a handle to the queue itself.
    pub fn start_with<F>(build: F) -> Self
    where
        F: FnOnce(AsyncQueue<S>) -> S,
    {
        let (sender, receiver) = async_channel::unbounded();
        let queue = Self {
            sender,
            shutting_down: Arc::new(AtomicBool::new(false)),
        };
        let state = build(queue.clone());
        runtime::spawn_detached(run_worker(state, receiver));
        queue
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Schedules `operation` and returns a future for its result.
    ///
    /// The operation is queued before this returns, so ordering follows call
    /// order even if the returned future is polled later.
    pub fn enqueue<R, F>(&self, operation: F) -> impl Future<Output = FirestoreResult<R>> + Send + 'static
    where
        R: Send + 'static,
        F: FnOnce(&mut S) -> R + Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let queued = self.push(Box::new(move |state: &mut S| {
            let _ = result_tx.send(operation(state));
        }));
        async move {
            if !queued {
                return Err(cancelled("The client has already been shut down"));
            }
            result_rx
                .await
                .map_err(|_| cancelled("The operation was dropped before it completed"))
        }
    }

    pub fn enqueue_and_forget<F>(&self, operation: F)
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        if !self.push(Box::new(operation)) {
            log::debug!("dropping operation enqueued after shutdown");
        }
    }

    /// Runs `operation` on the queue after `delay` unless cancelled first.
    pub fn enqueue_after_delay<F>(&self, timer_id: TimerId, delay: Duration, operation: F) -> DelayedOperation
    where
        F: FnOnce(&mut S) + Send + 'static,
    {
        let delayed = DelayedOperation::new(timer_id);
        let cancelled_flag = Arc::clone(&delayed.cancelled);
        let queue = self.clone();
        log::trace!("scheduling {timer_id:?} in {delay:?}");
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if cancelled_flag.load(Ordering::SeqCst) {
                return;
            }
            queue.enqueue_and_forget(move |state| {
                if !cancelled_flag.load(Ordering::SeqCst) {
                    operation(state);
                }
            });
        });
        delayed
    }

    /// Stops accepting work, waits for already queued operations to finish and
    /// then drops the state.
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.sender.send(QueueMessage::Shutdown(ack_tx)).await.is_ok() {
            let _ = ack_rx.await;
        }
    }

    fn push(&self, job: Job<S>) -> bool {
        if self.is_shutting_down() {
            return false;
        }
        self.sender.try_send(QueueMessage::Run(job)).is_ok()
    }
}

async fn run_worker<S>(mut state: S, receiver: Receiver<QueueMessage<S>>) {
    while let Ok(message) = receiver.recv().await {
        match message {
            QueueMessage::Run(job) => job(&mut state),
            QueueMessage::Shutdown(ack) => {
                receiver.close();
                drop(state);
                let _ = ack.send(());
                return;
            }
        }
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
#[derive(Clone, Debug)]
pub struct DelayedOperation {
    timer_id: TimerId,
    cancelled: Arc<AtomicBool>,
}

impl DelayedOperation {
    pub(crate) fn new(timer_id: TimerId) -> Self {
        Self {
            timer_id,
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::FirestoreErrorCode;

    #[tokio::test]
    async fn runs_operations_in_enqueue_order() {
        let queue = AsyncQueue::start(Vec::<u32>::new());
        let first = queue.enqueue(|log| {
            log.push(1);
            log.len()
        });
        let second = queue.enqueue(|log| {
            log.push(2);
            log.clone()
        });
        // Polling out of order does not change execution order.
        assert_eq!(second.await.unwrap(), vec![1, 2]);
        assert_eq!(first.await.unwrap(), 1);
    }

    #[tokio::test]
    async fn delayed_operations_can_be_cancelled() {
        let queue = AsyncQueue::start(Vec::<&'static str>::new());
        let cancelled_op =
            queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_millis(5), |log| {
                log.push("cancelled")
            });
        queue.enqueue_after_delay(TimerId::WriteStreamIdle, Duration::from_millis(5), |log| {
            log.push("ran")
        });
        cancelled_op.cancel();
        runtime::sleep(Duration::from_millis(50)).await;
        let log = queue.enqueue(|log| log.clone()).await.unwrap();
        assert_eq!(log, vec!["ran"]);
    }

    #[tokio::test]
    async fn shutdown_drains_queue_then_rejects() {
        let queue = AsyncQueue::start(0u32);
        let pending = queue.enqueue(|count| {
            *count += 1;
            *count
        });
        queue.shutdown().await;
        assert_eq!(pending.await.unwrap(), 1);

        let err = queue.enqueue(|count| *count).await.unwrap_err();
        assert_eq!(err.code, FirestoreErrorCode::Cancelled);
    }
}
