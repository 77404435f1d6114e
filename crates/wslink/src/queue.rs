//! Ordered execution of asynchronous tasks
//!
//! Every enqueued task receives the next ticket, starting at 0. Task `N`
//! starts only once task `N - 1` has finished, so completions are observed
//! in submission order however long each task takes.

use crate::{Result, SessionError};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Debug, Default)]
struct QueueTail {
    /// Ticket handed to the next task
    next_ticket: u64,
    /// Fires when the most recently enqueued task finishes
    last_done: Option<oneshot::Receiver<()>>,
}

/// FIFO admission queue for asynchronous work
#[derive(Debug, Default)]
pub struct SequentialTaskQueue {
    tail: Mutex<QueueTail>,
}

impl SequentialTaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Ticket the next enqueued task will receive
    pub fn next_ticket(&self) -> u64 {
        self.tail.lock().unwrap_or_else(PoisonError::into_inner).next_ticket
    }

    /// Enqueue a task
    ///
    /// The task is spawned on the current tokio runtime right away but
    /// only polled once its predecessor completed. A predecessor that
    /// panicked counts as completed.
    pub fn enqueue<F, T>(&self, task: F) -> QueuedTask<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();

        let (ticket, previous) = {
            let mut tail = self.tail.lock().unwrap_or_else(PoisonError::into_inner);
            let ticket = tail.next_ticket;
            tail.next_ticket += 1;
            (ticket, tail.last_done.replace(done_rx))
        };

        let handle = tokio::spawn(async move {
            if let Some(previous) = previous {
                // an error means the predecessor is gone, which is as good as done
                let _ = previous.await;
            }
            trace!("running queued task {}", ticket);
            let output = task.await;
            let _ = done_tx.send(());
            output
        });

        QueuedTask { ticket, handle }
    }
}

/// Handle to a queued task's result
#[derive(Debug)]
pub struct QueuedTask<T> {
    ticket: u64,
    handle: JoinHandle<T>,
}

impl<T> QueuedTask<T> {
    /// Position of the task in the queue
    pub fn ticket(&self) -> u64 {
        self.ticket
    }
}

impl<T> Future for QueuedTask<T> {
    type Output = Result<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx).map(|result| result.map_err(SessionError::from))
    }
}
