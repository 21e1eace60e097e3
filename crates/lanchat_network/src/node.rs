//! ChatNode: top-level coordinator for a chat session.
//!
//! [`ChatNode`] is the primary public API for lanchat_network. It owns:
//! - the chat [`Transport`] and its listener
//! - the [`DeliveryPipeline`] and the ordered message stream
//! - LAN discovery (beacons) and the peer liveness sweep
//! - the ingest and broadcast tasks that connect the pieces

use std::net::SocketAddr;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::clock::ClockStamp;
use crate::config::NetworkConfig;
use crate::discovery::{self, Beacon, DiscoveryConfig, DiscoveryService};
use crate::error::{StartupError, TransportError, ValidationError};
use crate::identity::{NodeId, NodeIdentity};
use crate::message::ChatMessage;
use crate::peer::{PeerEvent, PeerInfo, PeerRegistry};
use crate::pipeline::{DeliveryEvent, DeliveryPipeline, Diagnostic};
use crate::transport::{InboundStream, Transport};

/// A running chat session.
///
/// Created by [`start()`](ChatNode::start), which binds the sockets and
/// spawns the background tasks. Call [`stop()`](ChatNode::stop) to tear
/// everything down.
pub struct ChatNode {
    /// Our identity on the network.
    identity: NodeIdentity,
    /// Network configuration.
    config: NetworkConfig,
    /// Registry of known peers, shared with transport and discovery.
    peers: Arc<Mutex<PeerRegistry>>,
    /// Ordering and dedup engine.
    pipeline: Arc<DeliveryPipeline>,
    /// Chat socket.
    transport: Arc<Transport>,
    /// Bound discovery address, if discovery is running.
    discovery_addr: Option<SocketAddr>,
    /// Shutdown signal broadcaster.
    shutdown_tx: broadcast::Sender<()>,
    /// Background tasks, awaited on stop.
    tasks: Vec<JoinHandle<()>>,
    /// Whether the node is currently running.
    running: bool,
}

impl ChatNode {
    /// Start a chat session.
    ///
    /// Fails with [`StartupError`] if the configuration is invalid or the
    /// chat socket cannot be bound. A discovery bind failure is logged and
    /// the node runs without discovery.
    pub async fn start(identity: NodeIdentity, config: NetworkConfig) -> Result<Self, StartupError> {
        config.validate().map_err(StartupError::Config)?;

        let mut registry = PeerRegistry::from_config(&config);
        for addr in &config.known_peers {
            registry.pin(*addr);
        }
        let peers = Arc::new(Mutex::new(registry));

        let transport = Arc::new(Transport::bind(&config, Arc::clone(&peers)).await?);
        let inbound = transport.receive().ok_or(TransportError::Closed)?;
        let local_addr = transport.local_addr();

        let (pipeline, outbound_rx) = DeliveryPipeline::new(
            identity.node_id.clone(),
            ClockStamp::system(),
            Arc::clone(&peers),
            &config,
        );
        let pipeline = Arc::new(pipeline);

        let (shutdown_tx, _) = broadcast::channel(8);
        let mut tasks = vec![
            tokio::spawn(ingest_loop(
                inbound,
                Arc::clone(&pipeline),
                shutdown_tx.subscribe(),
            )),
            tokio::spawn(broadcast_loop(
                outbound_rx,
                Arc::clone(&transport),
                Arc::clone(&pipeline),
                shutdown_tx.subscribe(),
            )),
            discovery::spawn_sweeper(
                Arc::clone(&peers),
                config.sweep_interval,
                shutdown_tx.subscribe(),
            ),
        ];

        let mut discovery_addr = None;
        if config.discovery_enabled {
            let beacon = Beacon::new(&identity, local_addr.port());
            let discovery_config = DiscoveryConfig::from_network(&config, beacon);
            match DiscoveryService::start(
                discovery_config,
                Arc::clone(&peers),
                shutdown_tx.subscribe(),
            )
            .await
            {
                Ok(service) => {
                    discovery_addr = Some(service.local_addr());
                    tasks.extend(service.into_tasks());
                }
                Err(e) => warn!("Discovery start failed (non-fatal): {e}"),
            }
        }

        info!(
            "Chat node {} ('{}') started on {local_addr}",
            identity.node_id, identity.nickname
        );

        Ok(Self {
            identity,
            config,
            peers,
            pipeline,
            transport,
            discovery_addr,
            shutdown_tx,
            tasks,
            running: true,
        })
    }

    /// Author a message: delivered locally at once, broadcast in the background.
    pub fn submit(&self, content: &str, nickname: &str) -> Result<ChatMessage, ValidationError> {
        self.pipeline.submit(content, nickname)
    }

    /// Subscribe to delivery events (appends and insertions).
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.pipeline.subscribe()
    }

    /// Subscribe to peer join/stale/gone events.
    pub fn subscribe_peers(&self) -> broadcast::Receiver<PeerEvent> {
        self.peers.lock().subscribe()
    }

    /// Subscribe to non-fatal send and decode failures.
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.pipeline.diagnostics()
    }

    /// Snapshot of the delivery stream.
    pub fn messages(&self) -> Vec<ChatMessage> {
        self.pipeline.snapshot()
    }

    /// Snapshot of the known peers.
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers.lock().list_all()
    }

    pub fn node_id(&self) -> &NodeId {
        &self.identity.node_id
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Address of the chat socket.
    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Address of the discovery socket, if discovery is running.
    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery_addr
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Stop the session: signal every task, wait for them, close the chat
    /// socket and forget all peers. The message snapshot stays readable.
    pub async fn stop(&mut self) {
        if !self.running {
            return;
        }
        let _ = self.shutdown_tx.send(());
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                warn!("Background task ended abnormally: {e}");
            }
        }
        self.transport.close().await;
        self.peers.lock().clear();
        self.running = false;
        info!("Chat node {} stopped", self.identity.node_id);
    }
}

impl Drop for ChatNode {
    fn drop(&mut self) {
        if self.running {
            let _ = self.shutdown_tx.send(());
        }
    }
}

/// Feed inbound datagrams into the pipeline.
async fn ingest_loop(
    mut inbound: InboundStream,
    pipeline: Arc<DeliveryPipeline>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            datagram = inbound.next() => {
                match datagram {
                    Some((source, payload)) => {
                        pipeline.ingest(source, &payload);
                    }
                    None => {
                        debug!("Inbound stream ended");
                        break;
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!("Ingest task shutting down");
                break;
            }
        }
    }
}

/// Hand queued payloads to the transport, one broadcast at a time.
async fn broadcast_loop(
    mut outbound: mpsc::Receiver<Vec<u8>>,
    transport: Arc<Transport>,
    pipeline: Arc<DeliveryPipeline>,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            payload = outbound.recv() => {
                let Some(payload) = payload else {
                    break;
                };
                match transport.broadcast(&payload).await {
                    Ok(report) => {
                        for (target, error) in report.failed {
                            pipeline.report(Diagnostic::SendFailed { target, error });
                        }
                    }
                    Err(TransportError::SendFailed { target, reason }) => {
                        pipeline.report(Diagnostic::SendFailed { target, error: reason });
                    }
                    Err(TransportError::Closed) => break,
                    Err(e) => warn!("Broadcast failed: {e}"),
                }
            }
            _ = shutdown.recv() => {
                debug!("Broadcast task shutting down");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn next_event(events: &mut broadcast::Receiver<DeliveryEvent>) -> DeliveryEvent {
        tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .expect("timed out waiting for delivery")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_node_start_stop() {
        let mut node = ChatNode::start(NodeIdentity::generate("alice"), NetworkConfig::loopback())
            .await
            .unwrap();
        assert!(node.is_running());
        assert_ne!(node.local_addr().port(), 0);
        assert!(node.discovery_addr().is_none());
        assert_eq!(node.identity().nickname, "alice");

        node.stop().await;
        assert!(!node.is_running());
        assert!(node.peers().is_empty());

        // Stopping twice is a no-op.
        node.stop().await;
    }

    #[tokio::test]
    async fn test_invalid_config_is_startup_error() {
        let config = NetworkConfig {
            event_capacity: 0,
            ..NetworkConfig::loopback()
        };
        let err = ChatNode::start(NodeIdentity::generate("a"), config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, StartupError::Config(_)));
    }

    #[tokio::test]
    async fn test_bind_conflict_is_startup_error() {
        let mut first = ChatNode::start(NodeIdentity::generate("a"), NetworkConfig::loopback())
            .await
            .unwrap();
        let config = NetworkConfig {
            chat_addr: first.local_addr(),
            ..NetworkConfig::loopback()
        };
        let err = ChatNode::start(NodeIdentity::generate("b"), config)
            .await
            .err()
            .unwrap();
        assert!(matches!(
            err,
            StartupError::Transport(TransportError::BindFailed { .. })
        ));
        first.stop().await;
    }

    #[tokio::test]
    async fn test_known_peers_are_seeded() {
        let peer: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let config = NetworkConfig {
            known_peers: vec![peer],
            ..NetworkConfig::loopback()
        };
        let mut node = ChatNode::start(NodeIdentity::generate("a"), config)
            .await
            .unwrap();
        let peers = node.peers();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].addr, peer);
        assert!(peers[0].pinned);
        node.stop().await;
    }

    #[tokio::test]
    async fn test_two_nodes_exchange_messages() {
        let mut bob = ChatNode::start(NodeIdentity::generate("bob"), NetworkConfig::loopback())
            .await
            .unwrap();
        let mut bob_events = bob.subscribe();

        let config = NetworkConfig {
            known_peers: vec![bob.local_addr()],
            ..NetworkConfig::loopback()
        };
        let mut alice = ChatNode::start(NodeIdentity::generate("alice"), config)
            .await
            .unwrap();
        let mut alice_events = alice.subscribe();

        let sent = alice.submit("hi bob", "alice").unwrap();
        assert_eq!(next_event(&mut alice_events).await.message(), &sent);
        assert_eq!(next_event(&mut bob_events).await.message(), &sent);

        // Bob learned alice's address from the message itself.
        assert!(bob.peers().iter().any(|p| p.addr == alice.local_addr()));

        let reply = bob.submit("hi alice", "bob").unwrap();
        assert_eq!(next_event(&mut alice_events).await.message(), &reply);

        let mut expected = vec![sent, reply];
        expected.sort_by(|a, b| a.cmp_order(b));
        assert_eq!(alice.messages(), expected);
        assert_eq!(bob.messages(), expected);

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_nodes_find_each_other_through_discovery() {
        let listener_config = NetworkConfig {
            discovery_enabled: true,
            beacon_interval: Duration::from_secs(1),
            ..NetworkConfig::loopback()
        };
        let mut bob = ChatNode::start(NodeIdentity::generate("bob"), listener_config)
            .await
            .unwrap();
        let bob_discovery = bob.discovery_addr().unwrap();

        let announcer_config = NetworkConfig {
            discovery_enabled: true,
            discovery_broadcast_addr: Some(bob_discovery),
            beacon_interval: Duration::from_secs(1),
            ..NetworkConfig::loopback()
        };
        let mut alice = ChatNode::start(NodeIdentity::generate("alice"), announcer_config)
            .await
            .unwrap();
        let mut alice_events = alice.subscribe();

        let alice_addr = alice.local_addr();
        let found = tokio::time::timeout(Duration::from_secs(3), async {
            while !bob.peers().iter().any(|p| p.addr == alice_addr) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await;
        assert!(found.is_ok(), "bob never heard alice's beacon");

        let message = bob.submit("found you", "bob").unwrap();
        assert_eq!(next_event(&mut alice_events).await.message(), &message);

        alice.stop().await;
        bob.stop().await;
    }

    #[tokio::test]
    async fn test_unreachable_peer_reports_diagnostic() {
        let config = NetworkConfig {
            known_peers: vec!["[::1]:9".parse().unwrap()],
            ..NetworkConfig::loopback()
        };
        let mut node = ChatNode::start(NodeIdentity::generate("a"), config)
            .await
            .unwrap();
        let mut diagnostics = node.diagnostics();

        node.submit("anyone?", "a").unwrap();
        let diagnostic = tokio::time::timeout(Duration::from_secs(2), diagnostics.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(diagnostic, Diagnostic::SendFailed { .. }));
        // Still delivered locally.
        assert_eq!(node.messages().len(), 1);
        node.stop().await;
    }
}
