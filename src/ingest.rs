//! Ingestion Layer
//!
//! Wire listeners feeding bounded queues drained by batch consumers.
//!
//! # Architecture
//!
//! - [`TcpListenerTask`]: Length-prefixed frames over persistent connections, blocks when the queue is full
//! - [`UdpListenerTask`]: One JSON event per datagram, drops when the queue is full
//! - [`BatchConsumer`]: Size/interval flushing into a [`BatchProcessor`]
//! - [`RawEvent`]: The event shape shared by every transport
//!
//! Every listener and consumer observes a shared `CancellationToken`. On
//! cancellation listeners stop reading and consumers drain their queue
//! before a last flush.

mod consumer;
mod event;
pub mod frame;
mod tcp;
mod traits;
mod udp;

pub use consumer::BatchConsumer;
pub use event::{RawEvent, SharedSecret, Transport};
pub use frame::{BufferPool, MAX_FRAME_SIZE, decode_payload, encode_frame};
pub use tcp::{FRAME_HEADER_TIMEOUT, FRAME_PAYLOAD_TIMEOUT, TcpListenerTask};
pub use traits::{BatchOutcome, BatchProcessor, IngestError};
pub use udp::{MAX_DATAGRAM_SIZE, UdpListenerTask};
