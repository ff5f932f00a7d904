//! Shared batch contract between receivers and the classification pipeline.

use serde::Serialize;
use thiserror::Error;

use super::event::RawEvent;
use super::frame::MAX_FRAME_SIZE;
use crate::storage::StorageError;

/// Errors that can occur while receiving or processing events.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Socket I/O error.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// The flush could not be persisted.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Declared frame length above [`MAX_FRAME_SIZE`].
    #[error("frame length {0} exceeds limit of {MAX_FRAME_SIZE} bytes")]
    FrameTooLarge(usize),

    /// Declared frame length of zero.
    #[error("empty frame")]
    EmptyFrame,

    /// Payload is neither a single event nor a `{"logs": [...]}` batch.
    #[error("malformed payload: {0}")]
    Malformed(String),

    /// The queue's receiving side is gone.
    #[error("ingest queue closed")]
    QueueClosed,
}

/// Result of processing one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchOutcome {
    /// Billing increments plus log entries inserted.
    pub succeeded: usize,
    /// Events rejected by validation.
    pub failed: usize,
    /// Ids of the inserted log entries, ascending.
    pub inserted_ids: Vec<i64>,
}

/// Sink for a batch of received events.
///
/// Implemented by the billing engine and used identically by the HTTP,
/// TCP and UDP receivers. An `Err` means nothing from the batch was
/// persisted.
#[async_trait::async_trait]
pub trait BatchProcessor: Send + Sync + 'static {
    /// Classify and persist `events`.
    async fn process_batch(&self, events: Vec<RawEvent>) -> Result<BatchOutcome, IngestError>;
}
