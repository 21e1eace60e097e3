//! LAN peer discovery via UDP broadcast.
//!
//! The [`DiscoveryService`] periodically broadcasts a presence [`Beacon`] on
//! the discovery port and listens for beacons from other nodes. Every beacon
//! heard touches the sender's chat address in the [`PeerRegistry`].
//! [`spawn_sweeper`] runs the periodic liveness sweep over the same registry.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::NetworkConfig;
use crate::error::TransportError;
use crate::identity::{NodeId, NodeIdentity};
use crate::peer::PeerRegistry;

/// A presence announcement broadcast by a node on the LAN.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beacon {
    /// The announcing node's id.
    pub node_id: NodeId,
    /// The announcing user's nickname.
    pub nickname: String,
    /// Port of the node's chat socket.
    pub chat_port: u16,
    /// Software version.
    pub version: String,
}

impl Beacon {
    /// Build the beacon for `identity`, whose chat socket listens on `chat_port`.
    pub fn new(identity: &NodeIdentity, chat_port: u16) -> Self {
        Self {
            node_id: identity.node_id.clone(),
            nickname: identity.nickname.clone(),
            chat_port,
            version: identity.version.clone(),
        }
    }
}

/// Configuration for the discovery service.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Address to bind the discovery socket to.
    pub bind_addr: SocketAddr,
    /// Where to send beacons. `None` only listens.
    pub broadcast_addr: Option<SocketAddr>,
    /// How often to send a beacon.
    pub interval: Duration,
    /// Our own beacon.
    pub beacon: Beacon,
}

impl DiscoveryConfig {
    /// Discovery settings taken from the node's network config.
    pub fn from_network(config: &NetworkConfig, beacon: Beacon) -> Self {
        Self {
            bind_addr: config.discovery_addr,
            broadcast_addr: config.discovery_broadcast_addr,
            interval: config.beacon_interval,
            beacon,
        }
    }
}

/// A running discovery service.
pub struct DiscoveryService {
    local_addr: SocketAddr,
    tasks: Vec<JoinHandle<()>>,
}

impl DiscoveryService {
    /// Bind the discovery socket and start the background tasks.
    ///
    /// Spawns a broadcaster that sends our beacon at the configured interval
    /// (starting immediately) and a listener that registers every other node
    /// it hears. Both exit when `shutdown` fires.
    pub async fn start(
        config: DiscoveryConfig,
        peers: Arc<Mutex<PeerRegistry>>,
        shutdown: broadcast::Receiver<()>,
    ) -> Result<Self, TransportError> {
        let addr = config.bind_addr;
        let socket = UdpSocket::bind(addr)
            .await
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        socket
            .set_broadcast(true)
            .map_err(|source| TransportError::BindFailed { addr, source })?;
        let local_addr = socket
            .local_addr()
            .map_err(|source| TransportError::BindFailed { addr, source })?;

        info!("Discovery service listening on {local_addr}");

        let socket = Arc::new(socket);
        let mut tasks = Vec::with_capacity(2);

        if let Some(target) = config.broadcast_addr {
            let payload = serde_json::to_vec(&config.beacon).unwrap_or_default();
            tasks.push(tokio::spawn(broadcast_beacons(
                Arc::clone(&socket),
                payload,
                target,
                config.interval,
                shutdown.resubscribe(),
            )));
        }

        tasks.push(tokio::spawn(listen_for_beacons(
            socket,
            config.beacon.node_id,
            peers,
            shutdown,
        )));

        Ok(Self { local_addr, tasks })
    }

    /// The address the discovery socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Hand over the task handles so the owner can await them at teardown.
    pub fn into_tasks(self) -> Vec<JoinHandle<()>> {
        self.tasks
    }
}

async fn broadcast_beacons(
    socket: Arc<UdpSocket>,
    payload: Vec<u8>,
    target: SocketAddr,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match socket.send_to(&payload, target).await {
                    Ok(_) => trace!("Beacon sent to {target}"),
                    Err(e) => debug!("Beacon send failed: {e}"),
                }
            }
            _ = shutdown.recv() => {
                debug!("Discovery broadcaster shutting down");
                break;
            }
        }
    }
}

async fn listen_for_beacons(
    socket: Arc<UdpSocket>,
    own_id: NodeId,
    peers: Arc<Mutex<PeerRegistry>>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        tokio::select! {
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((len, src_addr)) => {
                        handle_beacon(&buf[..len], src_addr, &own_id, &peers);
                    }
                    Err(e) => {
                        warn!("Discovery recv error: {e}");
                    }
                }
            }
            _ = shutdown.recv() => {
                debug!("Discovery listener shutting down");
                break;
            }
        }
    }
}

/// Apply one received beacon to the registry.
///
/// Returns the chat address that was touched, or `None` if the datagram was
/// malformed or our own.
pub fn handle_beacon(
    bytes: &[u8],
    src_addr: SocketAddr,
    own_id: &NodeId,
    peers: &Mutex<PeerRegistry>,
) -> Option<SocketAddr> {
    let beacon = match serde_json::from_slice::<Beacon>(bytes) {
        Ok(beacon) => beacon,
        Err(e) => {
            debug!("Ignoring malformed beacon from {src_addr}: {e}");
            return None;
        }
    };
    if beacon.node_id == *own_id {
        return None;
    }
    if beacon.chat_port == 0 {
        debug!("Ignoring beacon without chat port from {src_addr}");
        return None;
    }

    let chat_addr = SocketAddr::new(src_addr.ip(), beacon.chat_port);
    if peers.lock().announce(chat_addr, beacon.node_id, &beacon.nickname) {
        info!("Discovered peer '{}' at {chat_addr}", beacon.nickname);
    }
    Some(chat_addr)
}

/// Spawn the periodic liveness sweep over `peers`.
///
/// The first sweep runs one `interval` after the call.
pub fn spawn_sweeper(
    peers: Arc<Mutex<PeerRegistry>>,
    interval: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + interval;
        let mut ticker = tokio::time::interval_at(start, interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = peers.lock().sweep();
                    if !report.is_empty() {
                        debug!(
                            "Sweep: {} stale, {} gone",
                            report.stale.len(),
                            report.gone.len()
                        );
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Peer sweeper shutting down");
                    break;
                }
            }
        }
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
