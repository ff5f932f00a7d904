//! Datagram UDP listener.
//!
//! Each datagram carries one JSON event. A full queue drops the event and
//! bumps a counter instead of stalling the socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;

use super::event::{RawEvent, SharedSecret, Transport};
use super::traits::IngestError;

/// Receive buffer size, the largest UDP payload.
pub const MAX_DATAGRAM_SIZE: usize = 65_535;

/// Receive loop for datagram ingestion.
pub struct UdpListenerTask {
    socket: UdpSocket,
    queue: mpsc::Sender<RawEvent>,
    secret: SharedSecret,
    dropped: Arc<AtomicU64>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for UdpListenerTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpListenerTask")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl UdpListenerTask {
    pub async fn bind(
        addr: &str,
        queue: mpsc::Sender<RawEvent>,
        secret: SharedSecret,
        cancel: CancellationToken,
    ) -> Result<Self, IngestError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket,
            queue,
            secret,
            dropped: Arc::new(AtomicU64::new(0)),
            cancel,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, IngestError> {
        Ok(self.socket.local_addr()?)
    }

    /// Count of events dropped because the queue was full.
    pub fn dropped_counter(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.dropped)
    }

    /// Receive datagrams until cancelled.
    pub async fn run(self) {
        tracing::info!(addr = ?self.socket.local_addr().ok(), "UDP listener started");

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => match received {
                    Ok((len, peer)) => {
                        if !self.handle_datagram(&buf[..len], peer) {
                            break;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "UDP receive failed"),
                },
            }
        }

        tracing::info!(
            dropped = self.dropped.load(Ordering::Relaxed),
            "UDP listener stopped"
        );
    }

    /// Returns false once the queue is closed.
    fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) -> bool {
        let event: RawEvent = match serde_json::from_slice(datagram) {
            Ok(event) => event,
            Err(e) => {
                tracing::debug!(%peer, error = %e, "Dropping malformed UDP datagram");
                return true;
            }
        };
        if !event.is_valid() {
            tracing::debug!(%peer, "Dropping invalid UDP event");
            return true;
        }
        if !self.secret.admits(&event) {
            tracing::debug!(%peer, "Dropping UDP event with wrong secret");
            return true;
        }

        match self.queue.try_send(event.with_transport(Transport::Udp)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::warn!(total, "UDP queue full, event dropped");
                true
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn start(
        secret: &str,
        capacity: usize,
    ) -> (
        SocketAddr,
        mpsc::Receiver<RawEvent>,
        Arc<AtomicU64>,
        CancellationToken,
        tokio::task::JoinHandle<()>,
    ) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let task = UdpListenerTask::bind("127.0.0.1:0", tx, SharedSecret::new(secret), cancel.clone())
            .await
            .unwrap();
        let addr = task.local_addr().unwrap();
        let dropped = task.dropped_counter();
        let handle = tokio::spawn(task.run());
        (addr, rx, dropped, cancel, handle)
    }

    async fn client() -> UdpSocket {
        UdpSocket::bind("127.0.0.1:0").await.unwrap()
    }

    #[tokio::test]
    async fn test_datagram_enqueued() {
        let (addr, mut rx, _dropped, cancel, handle) = start("", 8).await;
        let sock = client().await;
        sock.send_to(br#"not json"#, addr).await.unwrap();
        sock.send_to(br#"{"timestamp":0,"log_line":"x"}"#, addr)
            .await
            .unwrap();
        sock.send_to(br#"{"timestamp":7,"log_line":"ok","tag":"ops"}"#, addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.timestamp, 7);
        assert_eq!(event.transport, Transport::Udp);

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_secret_checked() {
        let (addr, mut rx, _dropped, cancel, handle) = start("k", 8).await;
        let sock = client().await;
        sock.send_to(br#"{"timestamp":1,"log_line":"no"}"#, addr)
            .await
            .unwrap();
        sock.send_to(br#"{"timestamp":1,"log_line":"yes","secret":"k"}"#, addr)
            .await
            .unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.log_line, "yes");

        cancel.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_counts() {
        let (addr, mut rx, dropped, cancel, handle) = start("", 1).await;
        let sock = client().await;
        for i in 1..=5 {
            let payload = format!(r#"{{"timestamp":{i},"log_line":"e{i}"}}"#);
            sock.send_to(payload.as_bytes(), addr).await.unwrap();
        }

        // Wait until every datagram has been either queued or dropped.
        for _ in 0..100 {
            if dropped.load(Ordering::Relaxed) == 4 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(dropped.load(Ordering::Relaxed), 4);
        assert_eq!(rx.recv().await.unwrap().timestamp, 1);

        cancel.cancel();
        handle.await.unwrap();
    }
}
