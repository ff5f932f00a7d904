//! Batch consumer draining a listener queue into a [`BatchProcessor`].
//!
//! Flushes when the buffer reaches `flush_size` events or the oldest buffered
//! event has waited `flush_interval`, whichever comes first.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::event::{RawEvent, Transport};
use super::traits::BatchProcessor;

// =============================================================================
// Buffer
// =============================================================================

/// Buffer with time-based and size-based flushing.
struct BatchBuffer<T> {
    items: Vec<T>,
    opened_at: Instant,
    max_items: usize,
    max_wait: Duration,
}

impl<T> BatchBuffer<T> {
    fn new(max_items: usize, max_wait: Duration) -> Self {
        Self {
            items: Vec::with_capacity(max_items),
            opened_at: Instant::now(),
            max_items,
            max_wait,
        }
    }

    fn push(&mut self, item: T) {
        // Start the wait on the first item so an idle buffer is never overdue
        if self.items.is_empty() {
            self.opened_at = Instant::now();
        }
        self.items.push(item);
    }

    fn is_full(&self) -> bool {
        self.items.len() >= self.max_items
    }

    fn deadline(&self) -> Instant {
        self.opened_at + self.max_wait
    }

    fn take(&mut self) -> Vec<T> {
        std::mem::replace(&mut self.items, Vec::with_capacity(self.max_items))
    }

    fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

// =============================================================================
// Consumer
// =============================================================================

/// One consumer per listener queue.
pub struct BatchConsumer {
    transport: Transport,
    queue: mpsc::Receiver<RawEvent>,
    processor: Arc<dyn BatchProcessor>,
    buffer: BatchBuffer<RawEvent>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for BatchConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchConsumer")
            .field("transport", &self.transport)
            .field("flush_size", &self.buffer.max_items)
            .field("flush_interval", &self.buffer.max_wait)
            .finish_non_exhaustive()
    }
}

impl BatchConsumer {
    pub fn new(
        transport: Transport,
        queue: mpsc::Receiver<RawEvent>,
        processor: Arc<dyn BatchProcessor>,
        flush_size: usize,
        flush_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            queue,
            processor,
            buffer: BatchBuffer::new(flush_size.max(1), flush_interval),
            cancel,
        }
    }

    /// Consume until cancelled or every sender is gone.
    ///
    /// On exit the queue is closed, already-queued events are drained and a
    /// final flush runs.
    pub async fn run(mut self) {
        tracing::info!(transport = %self.transport, "Batch consumer started");

        loop {
            let deadline = self.buffer.deadline();
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.queue.recv() => match received {
                    Some(event) => {
                        self.buffer.push(event);
                        if self.buffer.is_full() {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
                _ = tokio::time::sleep_until(deadline), if !self.buffer.is_empty() => {
                    self.flush().await;
                }
            }
        }

        self.queue.close();
        let mut drained = 0usize;
        while let Some(event) = self.queue.recv().await {
            drained += 1;
            self.buffer.push(event);
            if self.buffer.is_full() {
                self.flush().await;
            }
        }
        self.flush().await;

        tracing::info!(transport = %self.transport, drained, "Batch consumer stopped");
    }

    async fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }
        let batch = self.buffer.take();
        let size = batch.len();
        match self.processor.process_batch(batch).await {
            Ok(outcome) => tracing::debug!(
                transport = %self.transport,
                size,
                succeeded = outcome.succeeded,
                failed = outcome.failed,
                "Batch flushed"
            ),
            Err(e) => tracing::error!(
                transport = %self.transport,
                size,
                error = %e,
                "Batch flush failed"
            ),
        }
    }
}
