//! Peer registry: known peers and their liveness.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::NetworkConfig;
use crate::identity::NodeId;

/// Liveness of a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerState {
    /// Heard from within the staleness threshold.
    Alive,
    /// Silent for longer than the staleness threshold; still sent messages.
    Stale,
    /// Silent past the removal threshold. Never stored; reported for absent peers.
    Gone,
}

/// Information about a known peer.
#[derive(Debug, Clone)]
pub struct PeerInfo {
    /// The peer's chat address.
    pub addr: SocketAddr,
    /// Node id, once learned from a beacon.
    pub node_id: Option<NodeId>,
    /// Nickname, once learned from a beacon.
    pub nickname: Option<String>,
    /// Current liveness.
    pub state: PeerState,
    /// When the peer was first registered.
    pub first_seen: DateTime<Utc>,
    /// Last time we heard from this peer.
    pub last_seen: Instant,
    /// Configured peers are never removed by a sweep, only marked stale.
    pub pinned: bool,
}

/// Change notifications published by the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// A previously unknown peer was registered.
    Joined { addr: SocketAddr },
    /// A stale peer was heard from again.
    Recovered { addr: SocketAddr },
    /// A peer's nickname became known or changed.
    Identified { addr: SocketAddr, nickname: String },
    /// A peer went silent past the staleness threshold.
    Stale { addr: SocketAddr },
    /// A peer was removed after the longer silence threshold.
    Gone { addr: SocketAddr },
}

/// Result of a liveness sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Peers that transitioned to `Stale` in this sweep.
    pub stale: Vec<SocketAddr>,
    /// Peers removed in this sweep.
    pub gone: Vec<SocketAddr>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.stale.is_empty() && self.gone.is_empty()
    }
}

/// Registry of all known peers, keyed by chat address.
#[derive(Debug)]
pub struct PeerRegistry {
    peers: HashMap<SocketAddr, PeerInfo>,
    stale_after: Duration,
    gone_after: Duration,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerRegistry {
    /// Create an empty registry with the given silence thresholds.
    pub fn new(stale_after: Duration, gone_after: Duration) -> Self {
        Self::with_event_capacity(stale_after, gone_after, 256)
    }

    fn with_event_capacity(stale_after: Duration, gone_after: Duration, capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity.max(1));
        Self {
            peers: HashMap::new(),
            stale_after,
            gone_after,
            events,
        }
    }

    /// Create an empty registry using the thresholds from `config`.
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::with_event_capacity(config.stale_after, config.gone_after, config.event_capacity)
    }

    /// Subscribe to peer change events.
    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }

    /// Record contact with `addr` now. Returns `true` if the peer is new.
    pub fn touch(&mut self, addr: SocketAddr) -> bool {
        self.touch_at(addr, Instant::now())
    }

    /// Record contact with `addr` at `now`. Returns `true` if the peer is new.
    pub fn touch_at(&mut self, addr: SocketAddr, now: Instant) -> bool {
        match self.peers.get_mut(&addr) {
            Some(peer) => {
                peer.last_seen = now;
                if peer.state == PeerState::Stale {
                    peer.state = PeerState::Alive;
                    debug!("Peer {addr} is alive again");
                    self.emit(PeerEvent::Recovered { addr });
                }
                false
            }
            None => {
                self.peers.insert(
                    addr,
                    PeerInfo {
                        addr,
                        node_id: None,
                        nickname: None,
                        state: PeerState::Alive,
                        first_seen: Utc::now(),
                        last_seen: now,
                        pinned: false,
                    },
                );
                debug!("Registered peer {addr}");
                self.emit(PeerEvent::Joined { addr });
                true
            }
        }
    }

    /// Touch `addr` and attach the identity it advertised in a beacon.
    pub fn announce(&mut self, addr: SocketAddr, node_id: NodeId, nickname: &str) -> bool {
        let inserted = self.touch(addr);
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.node_id = Some(node_id);
            if peer.nickname.as_deref() != Some(nickname) {
                peer.nickname = Some(nickname.to_string());
                self.emit(PeerEvent::Identified {
                    addr,
                    nickname: nickname.to_string(),
                });
            }
        }
        inserted
    }

    /// Register a configured peer that must survive sweeps.
    pub fn pin(&mut self, addr: SocketAddr) -> bool {
        let inserted = self.touch(addr);
        if let Some(peer) = self.peers.get_mut(&addr) {
            peer.pinned = true;
        }
        inserted
    }

    /// Run a liveness sweep against the current time.
    pub fn sweep(&mut self) -> SweepReport {
        self.sweep_at(Instant::now())
    }

    /// Run a liveness sweep as of `now`.
    ///
    /// Alive peers silent for longer than `stale_after` become `Stale`;
    /// unpinned peers silent for longer than `gone_after` are removed.
    pub fn sweep_at(&mut self, now: Instant) -> SweepReport {
        let mut report = SweepReport::default();

        for peer in self.peers.values_mut() {
            let silence = now.saturating_duration_since(peer.last_seen);
            if silence > self.gone_after && !peer.pinned {
                report.gone.push(peer.addr);
            } else if silence > self.stale_after && peer.state == PeerState::Alive {
                peer.state = PeerState::Stale;
                report.stale.push(peer.addr);
            }
        }
        for addr in &report.gone {
            self.peers.remove(addr);
        }

        for &addr in &report.stale {
            debug!("Peer {addr} is stale");
            self.emit(PeerEvent::Stale { addr });
        }
        for &addr in &report.gone {
            debug!("Peer {addr} is gone");
            self.emit(PeerEvent::Gone { addr });
        }
        report
    }

    /// Addresses a broadcast should reach: every `Alive` and `Stale` peer.
    pub fn broadcast_targets(&self) -> Vec<SocketAddr> {
        self.peers
            .values()
            .filter(|p| p.state != PeerState::Gone)
            .map(|p| p.addr)
            .collect()
    }

    /// Liveness of `addr`; peers not in the registry are `Gone`.
    pub fn liveness(&self, addr: &SocketAddr) -> PeerState {
        self.peers
            .get(addr)
            .map(|p| p.state)
            .unwrap_or(PeerState::Gone)
    }

    /// Get a peer by address.
    pub fn get(&self, addr: &SocketAddr) -> Option<&PeerInfo> {
        self.peers.get(addr)
    }

    /// List all known peers, ordered by address.
    pub fn list_all(&self) -> Vec<PeerInfo> {
        let mut peers: Vec<PeerInfo> = self.peers.values().cloned().collect();
        peers.sort_by_key(|p| p.addr);
        peers
    }

    /// Remove a peer without emitting an event.
    pub fn remove(&mut self, addr: &SocketAddr) -> Option<PeerInfo> {
        self.peers.remove(addr)
    }

    /// Forget every peer.
    pub fn clear(&mut self) {
        self.peers.clear();
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    fn emit(&self, event: PeerEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::from_config(&NetworkConfig::default())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
