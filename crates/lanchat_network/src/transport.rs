//! UDP transport: the chat socket.
//!
//! The [`Transport`] binds one UDP socket, fans payloads out to every
//! reachable peer plus the subnet broadcast address, and forwards inbound
//! datagrams from a background listener task into a channel exposed as a
//! stream. It moves opaque bytes and knows nothing about chat messages.

use std::net::SocketAddr;
use std::sync::Arc;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::TransportError;
use crate::message::MAX_DATAGRAM_BYTES;
use crate::peer::PeerRegistry;

/// Pause after the first consecutive receive error; doubles up to
/// [`RECV_ERROR_BACKOFF_MAX`].
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(10);
const RECV_ERROR_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// An inbound datagram: source address and raw payload.
pub type Datagram = (SocketAddr, Vec<u8>);

/// The stream of inbound datagrams. Ends when the transport is closed.
pub type InboundStream = BoxStream<'static, Datagram>;

/// Per-target outcome of a [`Transport::broadcast`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Targets the payload was handed to.
    pub sent: Vec<SocketAddr>,
    /// Targets that needed the retry to succeed (a subset of `sent`).
    pub retried: Vec<SocketAddr>,
    /// Targets that failed twice, with the last error.
    pub failed: Vec<(SocketAddr, String)>,
}

impl BroadcastReport {
    /// Total number of targets attempted.
    pub fn attempted(&self) -> usize {
        self.sent.len() + self.failed.len()
    }
}

/// The chat socket and its listener task.
pub struct Transport {
    socket: Mutex<Option<Arc<UdpSocket>>>,
    local_addr: SocketAddr,
    broadcast_addr: Option<SocketAddr>,
    send_timeout: Duration,
    peers: Arc<Mutex<PeerRegistry>>,
    inbound: Mutex<Option<mpsc::Receiver<Datagram>>>,
    shutdown_tx: broadcast::Sender<()>,
    listener: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Transport {
    /// Bind the chat socket and start the listener task.
    ///
    /// Broadcast targets are read from `peers` at every send.
    pub async fn bind(
        config: &NetworkConfig,
        peers: Arc<Mutex<PeerRegistry>>,
    ) -> Result<Self, TransportError> {
        let addr = config.chat_addr;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        socket
            .set_broadcast(true)
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| TransportError::BindFailed { addr, source })?;

        info!("Chat transport listening on {local_addr}");

        let socket = Arc::new(socket);
        let (inbound_tx, inbound_rx) = mpsc::channel(config.event_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let listener = tokio::spawn(listen(Arc::clone(&socket), inbound_tx, shutdown_rx));

        Ok(Self {
            socket: Mutex::new(Some(socket)),
            local_addr,
            broadcast_addr: config.broadcast_addr,
            send_timeout: config.send_timeout,
            peers,
            inbound: Mutex::new(Some(inbound_rx)),
            shutdown_tx,
            listener: Mutex::new(Some(listener)),
            closed: AtomicBool::new(false),
        })
    }

    /// The address the chat socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Current send targets: non-gone peers plus the broadcast address,
    /// without duplicates and without this socket's own address.
    pub fn targets(&self) -> Vec<SocketAddr> {
        let mut targets = self.peers.lock().broadcast_targets();
        if let Some(addr) = self.broadcast_addr {
            targets.push(addr);
        }
        targets.retain(|t| *t != self.local_addr);
        targets.sort();
        targets.dedup();
        targets
    }

    /// Send `payload` to every target concurrently.
    ///
    /// Each send is bounded by the configured timeout and retried once on
    /// failure. Partial failure is reported in the returned
    /// [`BroadcastReport`]; `SendFailed` is returned only when every target
    /// failed.
    pub async fn broadcast(&self, payload: &[u8]) -> Result<BroadcastReport, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if payload.len() > MAX_DATAGRAM_BYTES {
            return Err(TransportError::PayloadTooLarge(payload.len()));
        }
        let socket = self.socket.lock().clone().ok_or(TransportError::Closed)?;

        let targets = self.targets();
        if targets.is_empty() {
            trace!("No broadcast targets");
            return Ok(BroadcastReport::default());
        }

        let limit = self.send_timeout;
        let sends = targets.into_iter().map(|target| {
            let socket = Arc::clone(&socket);
            async move {
                let outcome =
                    send_with_retry(target, || send_once(&socket, payload, target, limit)).await;
                (target, outcome)
            }
        });

        let mut report = BroadcastReport::default();
        for (target, outcome) in join_all(sends).await {
            match outcome {
                Ok(attempts) => {
                    report.sent.push(target);
                    if attempts > 1 {
                        report.retried.push(target);
                    }
                }
                Err(reason) => {
                    warn!("Dropping message for {target}: {reason}");
                    report.failed.push((target, reason));
                }
            }
        }

        if report.sent.is_empty() {
            if let Some((target, reason)) = report.failed.first().cloned() {
                return Err(TransportError::SendFailed { target, reason });
            }
        }
        debug!(
            "Broadcast {} bytes to {}/{} targets",
            payload.len(),
            report.sent.len(),
            report.attempted()
        );
        Ok(report)
    }

    /// Take the inbound datagram stream. Returns `None` if it was already taken.
    pub fn receive(&self) -> Option<InboundStream> {
        let rx = self.inbound.lock().take()?;
        Some(
            stream::unfold(rx, |mut rx| async move {
                let datagram = rx.recv().await?;
                Some((datagram, rx))
            })
            .boxed(),
        )
    }

    /// Stop the listener task and release the socket.
    ///
    /// The inbound stream ends once buffered datagrams are drained. Further
    /// broadcasts fail with [`TransportError::Closed`].
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.shutdown_tx.send(());
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.socket.lock().take();
        info!("Chat transport on {} closed", self.local_addr);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(());
    }
}

async fn listen(
    socket: Arc<UdpSocket>,
    inbound_tx: mpsc::Sender<Datagram>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES + 1];
    let mut recv_errors = 0u32;
    loop {
        let datagram = tokio::select! {
            result = socket.recv_from(&mut buf) => result,
            _ = shutdown.recv() => break,
        };
        match datagram {
            Ok((len, src_addr)) => {
                recv_errors = 0;
                trace!("Received {len} bytes from {src_addr}");
                // A full channel must not keep the listener from seeing shutdown.
                tokio::select! {
                    sent = inbound_tx.send((src_addr, buf[..len].to_vec())) => {
                        if sent.is_err() {
                            debug!("Inbound stream dropped, stopping listener");
                            break;
                        }
                    }
                    _ = shutdown.recv() => break,
                }
            }
            Err(e) => {
                // ICMP errors from earlier sends surface here on some platforms.
                recv_errors = recv_errors.saturating_add(1);
                let pause = recv_backoff(recv_errors);
                debug!("Chat socket recv error ({recv_errors} in a row, pausing {pause:?}): {e}");
                tokio::select! {
                    _ = tokio::time::sleep(pause) => {}
                    _ = shutdown.recv() => break,
                }
            }
        }
    }
    debug!("Chat listener shutting down");
}

/// Pause before the next receive after `consecutive` errors in a row.
fn recv_backoff(consecutive: u32) -> Duration {
    let doublings = consecutive.saturating_sub(1).min(16);
    RECV_ERROR_BACKOFF
        .saturating_mul(1 << doublings)
        .min(RECV_ERROR_BACKOFF_MAX)
}

/// Run `send` once, and once more on failure. Returns the number of attempts
/// used, or the last error.
async fn send_with_retry<F, Fut>(target: SocketAddr, mut send: F) -> Result<u32, String>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    match send().await {
        Ok(()) => Ok(1),
        Err(first) => {
            debug!("Send to {target} failed ({first}), retrying");
            send().await.map(|()| 2)
        }
    }
}

async fn send_once(
    socket: &UdpSocket,
    payload: &[u8],
    target: SocketAddr,
    limit: Duration,
) -> Result<(), String> {
    match tokio::time::timeout(limit, socket.send_to(payload, target)).await {
        Ok(Ok(_)) => Ok(()),
        Ok(Err(e)) => Err(e.to_string()),
        Err(_) => Err(format!("timed out after {}ms", limit.as_millis())),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn registry() -> Arc<Mutex<PeerRegistry>> {
        Arc::new(Mutex::new(PeerRegistry::new(
            Duration::from_secs(15),
            Duration::from_secs(60),
        )))
    }

    fn unreachable_v6() -> SocketAddr {
        "[::1]:9".parse().unwrap()
    }

    async fn recv_one(stream: &mut InboundStream) -> Datagram {
        tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .expect("timed out waiting for datagram")
            .expect("stream ended")
    }

    #[tokio::test]
    async fn test_bind_reports_local_addr() {
        let transport = Transport::bind(&NetworkConfig::loopback(), registry())
            .await
            .unwrap();
        let addr = transport.local_addr();
        assert!(addr.ip().is_loopback());
        assert_ne!(addr.port(), 0);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_bind_failed() {
        let first = Transport::bind(&NetworkConfig::loopback(), registry())
            .await
            .unwrap();
        let config = NetworkConfig {
            chat_addr: first.local_addr(),
            ..NetworkConfig::loopback()
        };
        let err = Transport::bind(&config, registry()).await.err().unwrap();
        assert!(matches!(err, TransportError::BindFailed { addr, .. } if addr == first.local_addr()));
        first.close().await;
    }

    #[tokio::test]
    async fn test_loopback_send_and_receive() {
        let receiver = Transport::bind(&NetworkConfig::loopback(), registry())
            .await
            .unwrap();
        let mut inbound = receiver.receive().unwrap();

        let peers = registry();
        peers.lock().touch(receiver.local_addr());
        let sender = Transport::bind(&NetworkConfig::loopback(), peers).await.unwrap();

        let report = sender.broadcast(b"hello lan").await.unwrap();
        assert_eq!(report.sent, vec![receiver.local_addr()]);
        assert!(report.failed.is_empty());

        let (src, bytes) = recv_one(&mut inbound).await;
        assert_eq!(src, sender.local_addr());
        assert_eq!(bytes, b"hello lan");

        sender.close().await;
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_receive_can_be_taken_once() {
        let transport = Transport::bind(&NetworkConfig::loopback(), registry())
            .await
            .unwrap();
        assert!(transport.receive().is_some());
        assert!(transport.receive().is_none());
        transport.close().await;
    }

    #[tokio::test]
    async fn test_partial_failure_is_ok() {
        let receiver = Transport::bind(&NetworkConfig::loopback(), registry())
            .await
            .unwrap();
        let mut inbound = receiver.receive().unwrap();

        let peers = registry();
        peers.lock().touch(receiver.local_addr());
        peers.lock().touch(unreachable_v6());
        let sender = Transport::bind(&NetworkConfig::loopback(), peers).await.unwrap();

        let report = sender.broadcast(b"partial").await.unwrap();
        assert_eq!(report.sent, vec![receiver.local_addr()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, unreachable_v6());
        assert_eq!(report.attempted(), 2);

        let (_, bytes) = recv_one(&mut inbound).await;
        assert_eq!(bytes, b"partial");

        sender.close().await;
        receiver.close().await;
    }

    #[tokio::test]
    async fn test_all_targets_failed_is_send_failed() {
        let peers = registry();
        peers.lock().touch(unreachable_v6());
        let sender = Transport::bind(&NetworkConfig::loopback(), peers).await.unwrap();

        let err = sender.broadcast(b"nowhere").await.unwrap_err();
        assert!(matches!(err, TransportError::SendFailed { target, .. } if target == unreachable_v6()));
        sender.close().await;
    }

    #[tokio::test]
    async fn test_no_targets_is_empty_report() {
        let sender = Transport::bind(&NetworkConfig::loopback(), registry())
            .await
            .unwrap();
        let report = sender.broadcast(b"alone").await.unwrap();
        assert_eq!(report, BroadcastReport::default());
        sender.close().await;
    }

    #[tokio::test]
    async fn test_targets_skip_self_and_duplicates() {
        let peers = registry();
        let config = NetworkConfig {
            broadcast_addr: Some("127.0.0.1:9470".parse().unwrap()),
            ..NetworkConfig::loopback()
        };
        let transport = Transport::bind(&config, Arc::clone(&peers)).await.unwrap();

        peers.lock().touch(transport.local_addr());
        peers.lock().touch("127.0.0.1:9470".parse().unwrap());
        peers.lock().touch("127.0.0.1:9999".parse().unwrap());

        let targets = transport.targets();
        assert_eq!(
            targets,
            vec![
                "127.0.0.1:9470".parse().unwrap(),
                "127.0.0.1:9999".parse().unwrap()
            ]
        );

        peers.lock().clear();
        assert_eq!(transport.targets(), vec!["127.0.0.1:9470".parse().unwrap()]);
        transport.close().await;
    }

    #[tokio::test]
    async fn test_oversized_payload_rejected() {
        let transport = Transport::bind(&NetworkConfig::loopback(), registry())
            .await
            .unwrap();
        let payload = vec![0u8; MAX_DATAGRAM_BYTES + 1];
        let err = transport.broadcast(&payload).await.unwrap_err();
        assert!(matches!(err, TransportError::PayloadTooLarge(_)));
        transport.close().await;
    }

    #[tokio::test]
    async fn test_retry_succeeds_on_second_attempt() {
        let attempts = AtomicU32::new(0);
        let outcome = send_with_retry(unreachable_v6(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    Err("first send refused".to_string())
                } else {
                    Ok(())
                }
            }
        })
        .await;
        assert_eq!(outcome, Ok(2));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_gives_up_after_two_attempts() {
        let attempts = AtomicU32::new(0);
        let outcome = send_with_retry(unreachable_v6(), || {
            let n = attempts.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("attempt {n} refused")) }
        })
        .await;
        assert_eq!(outcome, Err("attempt 1 refused".to_string()));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_first_success_is_not_retried() {
        let attempts = AtomicU32::new(0);
        let outcome = send_with_retry(unreachable_v6(), || {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Ok(()) }
        })
        .await;
        assert_eq!(outcome, Ok(1));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_recv_backoff_grows_and_caps() {
        assert_eq!(recv_backoff(1), Duration::from_millis(10));
        assert_eq!(recv_backoff(2), Duration::from_millis(20));
        assert_eq!(recv_backoff(4), Duration::from_millis(80));
        assert_eq!(recv_backoff(8), RECV_ERROR_BACKOFF_MAX);
        assert_eq!(recv_backoff(u32::MAX), RECV_ERROR_BACKOFF_MAX);
    }

    #[tokio::test]
    async fn test_close_with_full_inbound_channel() {
        let config = NetworkConfig {
            event_capacity: 1,
            ..NetworkConfig::loopback()
        };
        let receiver = Transport::bind(&config, registry()).await.unwrap();
        // Taken but never drained.
        let _inbound = receiver.receive().unwrap();

        let peers = registry();
        peers.lock().touch(receiver.local_addr());
        let sender = Transport::bind(&NetworkConfig::loopback(), peers).await.unwrap();
        for _ in 0..4 {
            sender.broadcast(b"backlog").await.unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;

        tokio::time::timeout(Duration::from_secs(2), receiver.close())
            .await
            .expect("close hung on a full inbound channel");
        assert!(receiver.is_closed());
        sender.close().await;
    }

    #[tokio::test]
    async fn test_close_ends_stream_and_rejects_sends() {
        let transport = Transport::bind(&NetworkConfig::loopback(), registry())
            .await
            .unwrap();
        let mut inbound = transport.receive().unwrap();

        transport.close().await;
        assert!(transport.is_closed());

        let next = tokio::time::timeout(Duration::from_secs(2), inbound.next())
            .await
            .unwrap();
        assert!(next.is_none());

        let err = transport.broadcast(b"late").await.unwrap_err();
        assert!(matches!(err, TransportError::Closed));

        // Closing twice is harmless.
        transport.close().await;
    }
}
