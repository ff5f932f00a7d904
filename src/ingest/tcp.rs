//! Length-prefixed TCP listener.
//!
//! One acceptor task plus one handler per connection. Handlers block on a
//! full queue.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::event::{RawEvent, SharedSecret, Transport};
use super::frame::{BufferPool, decode_payload, read_frame_len};
use super::traits::IngestError;

/// Longest wait for the next frame header.
pub const FRAME_HEADER_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest wait for a payload once its header has arrived.
pub const FRAME_PAYLOAD_TIMEOUT: Duration = Duration::from_secs(30);

/// Buffered reader capacity per connection (64 KiB).
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Pause after a failed accept so persistent errors do not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by every connection handler.
#[derive(Clone)]
struct ConnectionContext {
    queue: mpsc::Sender<RawEvent>,
    secret: SharedSecret,
    pool: Arc<BufferPool>,
    header_timeout: Duration,
    payload_timeout: Duration,
}

/// Accept loop for framed TCP ingestion.
pub struct TcpListenerTask {
    listener: TcpListener,
    context: ConnectionContext,
    cancel: CancellationToken,
}

impl std::fmt::Debug for TcpListenerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TcpListenerTask")
            .field("local_addr", &self.listener.local_addr().ok())
            .field("secret", &self.context.secret)
            .finish_non_exhaustive()
    }
}

impl TcpListenerTask {
    /// Bind `addr` and prepare to forward events into `queue`.
    pub async fn bind(
        addr: &str,
        queue: mpsc::Sender<RawEvent>,
        secret: SharedSecret,
        cancel: CancellationToken,
    ) -> Result<Self, IngestError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            context: ConnectionContext {
                queue,
                secret,
                pool: Arc::new(BufferPool::default()),
                header_timeout: FRAME_HEADER_TIMEOUT,
                payload_timeout: FRAME_PAYLOAD_TIMEOUT,
            },
            cancel,
        })
    }

    /// Replace the per-frame read deadlines.
    pub fn with_frame_timeouts(mut self, header: Duration, payload: Duration) -> Self {
        self.context.header_timeout = header;
        self.context.payload_timeout = payload;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, IngestError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept connections until cancelled, then wait for every handler.
    pub async fn run(self) {
        let Self {
            listener,
            context,
            cancel,
        } = self;
        tracing::info!(addr = ?listener.local_addr().ok(), "TCP listener started");

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let context = context.clone();
                        let cancel = cancel.clone();
                        connections.spawn(async move {
                            tokio::select! {
                                _ = cancel.cancelled() => {}
                                result = serve_connection(stream, &context) => {
                                    log_connection_end(peer, result);
                                }
                            }
                        });
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "TCP accept failed");
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "TCP connection handler panicked");
                    }
                }
            }
        }

        drop(listener);
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                tracing::error!(error = %e, "TCP connection handler panicked");
            }
        }
        tracing::info!("TCP listener stopped");
    }
}

fn log_connection_end(peer: SocketAddr, result: Result<(), IngestError>) {
    match result {
        Ok(()) => tracing::debug!(%peer, "TCP connection closed"),
        Err(IngestError::Io(e)) if e.kind() == std::io::ErrorKind::TimedOut => {
            tracing::debug!(%peer, "TCP connection idle, dropped");
        }
        Err(IngestError::QueueClosed) => tracing::debug!(%peer, "TCP queue closed"),
        Err(e) => tracing::warn!(%peer, error = %e, "TCP connection terminated"),
    }
}

/// Read frames until the peer closes, a deadline passes, or a frame is invalid.
async fn serve_connection(
    stream: TcpStream,
    context: &ConnectionContext,
) -> Result<(), IngestError> {
    stream.set_nodelay(true)?;
    let mut reader = BufReader::with_capacity(READ_BUFFER_SIZE, stream);

    loop {
        let header = timeout(context.header_timeout, read_frame_len(&mut reader))
            .await
            .map_err(std::io::Error::from)??;
        let Some(len) = header else {
            return Ok(());
        };

        let mut payload = context.pool.acquire(len);
        let decoded = match timeout(context.payload_timeout, reader.read_exact(&mut payload)).await {
            Ok(Ok(_)) => decode_payload(&payload),
            Ok(Err(e)) => Err(e.into()),
            Err(elapsed) => Err(std::io::Error::from(elapsed).into()),
        };
        context.pool.release(payload);

        for event in decoded? {
            if !event.is_valid() {
                tracing::debug!("Dropping invalid TCP event");
                continue;
            }
            if !context.secret.admits(&event) {
                tracing::debug!("Dropping TCP event with wrong secret");
                continue;
            }
            context
                .queue
                .send(event.with_transport(Transport::Tcp))
                .await
                .map_err(|_| IngestError::QueueClosed)?;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::encode_frame;
    use tokio::io::AsyncWriteExt;

    type Started = (
        SocketAddr,
        mpsc::Receiver<RawEvent>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    );

    async fn start(secret: &str, capacity: usize) -> Started {
        start_with_timeouts(secret, capacity, FRAME_HEADER_TIMEOUT, FRAME_PAYLOAD_TIMEOUT).await
    }

    async fn start_with_timeouts(
        secret: &str,
        capacity: usize,
        header: Duration,
        payload: Duration,
    ) -> Started {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let secret = SharedSecret::new(secret);
        let task = TcpListenerTask::bind("127.0.0.1:0", tx, secret, cancel.clone())
            .await
            .unwrap()
            .with_frame_timeouts(header, payload);
        let addr = task.local_addr().unwrap();
        let handle = tokio::spawn(task.run());
        (addr, rx, cancel, handle)
    }

    async fn recv(rx: &mut mpsc::Receiver<RawEvent>) -> RawEvent {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    /// Wait for the server to close `stream`, returning how long it took.
    async fn closed_after(stream: &mut TcpStream) -> Duration {
        let started = tokio::time::Instant::now();
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(10), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
        started.elapsed()
    }

    async fn send_one(addr: SocketAddr, log_line: &str) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let payload = format!(r#"{{"timestamp":1,"log_line":"{log_line}"}}"#);
        stream
            .write_all(&encode_frame(payload.as_bytes()).unwrap())
            .await
            .unwrap();
    }

    #[test]
    fn test_default_frame_timeouts() {
        assert_eq!(FRAME_HEADER_TIMEOUT, Duration::from_secs(60));
        assert_eq!(FRAME_PAYLOAD_TIMEOUT, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_idle_connection_dropped_at_header_deadline() {
        let header = Duration::from_millis(300);
        let (addr, mut rx, cancel, handle) =
            start_with_timeouts("", 16, header, Duration::from_secs(30)).await;

        let mut idle = TcpStream::connect(addr).await.unwrap();
        assert!(closed_after(&mut idle).await >= header - Duration::from_millis(50));

        send_one(addr, "after idle").await;
        assert_eq!(recv(&mut rx).await.log_line, "after idle");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_stalled_payload_dropped_at_payload_deadline() {
        let payload = Duration::from_millis(300);
        let (addr, mut rx, cancel, handle) =
            start_with_timeouts("", 16, Duration::from_secs(30), payload).await;

        // Header promises 10 bytes, only 3 arrive.
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled.write_all(&[0, 0, 0, 10, b'{', b'"', b't']).await.unwrap();
        let waited = closed_after(&mut stalled).await;
        assert!(waited >= payload - Duration::from_millis(50));
        assert!(waited < Duration::from_secs(10));

        send_one(addr, "after stall").await;
        assert_eq!(recv(&mut rx).await.log_line, "after stall");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_single_and_batch_frames() {
        let (addr, mut rx, cancel, handle) = start("", 16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let single = encode_frame(br#"{"timestamp":1,"log_line":"one","tag":"ops"}"#).unwrap();
        let batch = encode_frame(
            br#"{"logs":[{"timestamp":2,"log_line":"two"},{"timestamp":0,"log_line":"skip"},{"timestamp":3,"log_line":"three"}]}"#,
        )
        .unwrap();
        stream.write_all(&single).await.unwrap();
        stream.write_all(&batch).await.unwrap();

        let first = recv(&mut rx).await;
        assert_eq!(first.log_line, "one");
        assert_eq!(first.transport, Transport::Tcp);
        assert_eq!(recv(&mut rx).await.log_line, "two");
        assert_eq!(recv(&mut rx).await.log_line, "three");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_secret_mismatch_dropped() {
        let (addr, mut rx, cancel, handle) = start("s3", 16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let wrong = encode_frame(br#"{"timestamp":1,"log_line":"bad","secret":"no"}"#).unwrap();
        let right = encode_frame(br#"{"timestamp":1,"log_line":"good","api_key":"s3"}"#).unwrap();
        stream.write_all(&wrong).await.unwrap();
        stream.write_all(&right).await.unwrap();

        assert_eq!(recv(&mut rx).await.log_line, "good");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_frame_closes_connection() {
        let (addr, mut rx, cancel, handle) = start("", 16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();

        let len = (crate::ingest::MAX_FRAME_SIZE as u32 + 1).to_be_bytes();
        stream.write_all(&len).await.unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The listener keeps serving new connections.
        let mut other = TcpStream::connect(addr).await.unwrap();
        let frame = encode_frame(br#"{"timestamp":1,"log_line":"after"}"#).unwrap();
        other.write_all(&frame).await.unwrap();
        assert_eq!(recv(&mut rx).await.log_line, "after");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_malformed_payload_closes_connection() {
        let (addr, _rx, cancel, handle) = start("", 16).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&encode_frame(b"garbage").unwrap()).await.unwrap();

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_blocks_until_cancelled() {
        let (addr, mut rx, cancel, handle) = start("", 1).await;
        let mut stream = TcpStream::connect(addr).await.unwrap();
        for i in 1..=3 {
            let payload = format!(r#"{{"timestamp":{i},"log_line":"e{i}"}}"#);
            stream
                .write_all(&encode_frame(payload.as_bytes()).unwrap())
                .await
                .unwrap();
        }

        // Nothing is lost while the handler waits for room.
        assert_eq!(recv(&mut rx).await.log_line, "e1");
        assert_eq!(recv(&mut rx).await.log_line, "e2");
        assert_eq!(recv(&mut rx).await.log_line, "e3");

        // A blocked handler is abandoned on shutdown.
        let payload = br#"{"logs":[{"timestamp":1,"log_line":"a"},{"timestamp":1,"log_line":"b"}]}"#;
        stream.write_all(&encode_frame(payload).unwrap()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
