//! Length-prefixed frame codec and payload buffer pool.
//!
//! A frame is a 4-byte big-endian length followed by that many bytes of JSON.
//! The JSON is either one event object or `{"logs": [...]}`.

use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};

use super::event::RawEvent;
use super::traits::IngestError;

/// Size of the length prefix.
pub const FRAME_HEADER_LEN: usize = 4;

/// Largest accepted payload (4 MiB).
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

/// Capacity of pooled payload buffers (256 KiB).
pub const DEFAULT_PAYLOAD_CAPACITY: usize = 256 * 1024;

/// Idle buffers kept by a pool.
const MAX_IDLE_BUFFERS: usize = 64;

/// Check a declared payload length.
pub fn check_frame_len(len: u32) -> Result<usize, IngestError> {
    let len = len as usize;
    if len == 0 {
        Err(IngestError::EmptyFrame)
    } else if len > MAX_FRAME_SIZE {
        Err(IngestError::FrameTooLarge(len))
    } else {
        Ok(len)
    }
}

/// Prefix `payload` with its length.
pub fn encode_frame(payload: &[u8]) -> Result<Vec<u8>, IngestError> {
    let len = u32::try_from(payload.len())
        .map_err(|_| IngestError::FrameTooLarge(payload.len()))
        .and_then(check_frame_len)?;

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + len);
    frame.extend_from_slice(&(len as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    Ok(frame)
}

/// Read the next frame header.
///
/// Returns `Ok(None)` when the peer closed the stream before a full header.
pub async fn read_frame_len<R>(reader: &mut R) -> Result<Option<usize>, IngestError>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    match reader.read_exact(&mut header).await {
        Ok(_) => check_frame_len(u32::from_be_bytes(header)).map(Some),
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[derive(Deserialize)]
struct LogBatch {
    #[serde(default)]
    logs: Vec<RawEvent>,
}

/// Parse a frame payload into events.
///
/// A single object counts only when it passes minimal validation, otherwise
/// the batch form is tried. A payload matching neither is an error.
pub fn decode_payload(payload: &[u8]) -> Result<Vec<RawEvent>, IngestError> {
    if let Ok(single) = serde_json::from_slice::<RawEvent>(payload)
        && single.is_valid()
    {
        return Ok(vec![single]);
    }

    serde_json::from_slice::<LogBatch>(payload)
        .map(|batch| batch.logs)
        .map_err(|e| IngestError::Malformed(e.to_string()))
}

/// Reusable payload buffers.
///
/// Requests up to the pool capacity are served from idle buffers. Larger
/// requests get a one-off allocation that is dropped on release.
pub struct BufferPool {
    capacity: usize,
    idle: Mutex<Vec<Vec<u8>>>,
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("capacity", &self.capacity)
            .field("idle", &self.idle_count())
            .finish()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_PAYLOAD_CAPACITY)
    }
}

impl BufferPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            idle: Mutex::new(Vec::new()),
        }
    }

    /// A zeroed buffer of exactly `len` bytes.
    pub fn acquire(&self, len: usize) -> Vec<u8> {
        if len > self.capacity {
            return vec![0; len];
        }
        let mut buf = self
            .idle
            .lock()
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(self.capacity));
        buf.resize(len, 0);
        buf
    }

    /// Return a buffer obtained from [`BufferPool::acquire`].
    pub fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() != self.capacity {
            return;
        }
        buf.clear();
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE_BUFFERS {
            idle.push(buf);
        }
    }

    pub fn idle_count(&self) -> usize {
        self.idle.lock().len()
    }
}
