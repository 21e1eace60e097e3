//! Network configuration for a chat node.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration for the LanChat networking layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address the chat socket binds to.
    pub chat_addr: SocketAddr,

    /// Subnet broadcast address every chat message is also sent to.
    /// `None` restricts delivery to registered peers.
    pub broadcast_addr: Option<SocketAddr>,

    /// Whether LAN discovery (UDP beacons) is enabled.
    pub discovery_enabled: bool,

    /// Address the discovery socket binds to.
    pub discovery_addr: SocketAddr,

    /// Where presence beacons are sent.
    pub discovery_broadcast_addr: Option<SocketAddr>,

    /// Interval between presence beacons.
    #[serde(with = "duration_secs")]
    pub beacon_interval: Duration,

    /// Interval between peer liveness sweeps.
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Silence after which a peer is considered stale.
    #[serde(with = "duration_secs")]
    pub stale_after: Duration,

    /// Silence after which a peer is dropped from the registry.
    #[serde(with = "duration_secs")]
    pub gone_after: Duration,

    /// Upper bound on a single datagram send.
    #[serde(with = "duration_millis")]
    pub send_timeout: Duration,


    /// Buffer size of the delivery and peer event channels.
    pub event_capacity: usize,

    /// Peers registered at startup, before any beacon is heard.
    pub known_peers: Vec<SocketAddr>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            chat_addr: SocketAddr::from(([0, 0, 0, 0], 9470)),
            broadcast_addr: Some(SocketAddr::from(([255, 255, 255, 255], 9470))),
            discovery_enabled: true,
            discovery_addr: SocketAddr::from(([0, 0, 0, 0], 9471)),
            discovery_broadcast_addr: Some(SocketAddr::from(([255, 255, 255, 255], 9471))),
            beacon_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(5),
            stale_after: Duration::from_secs(15),
            gone_after: Duration::from_secs(60),
            send_timeout: Duration::from_millis(250),
            event_capacity: 1024,
            known_peers: Vec::new(),
        }
    }
}

impl NetworkConfig {
    /// A loopback-only config with discovery off and ephemeral ports.
    pub fn loopback() -> Self {
        Self {
            chat_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            broadcast_addr: None,
            discovery_enabled: false,
            discovery_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            discovery_broadcast_addr: None,
            ..Self::default()
        }
    }

    /// Check the settings for values the node cannot run with.
    pub fn validate(&self) -> Result<(), String> {
        if self.gone_after <= self.stale_after {
            return Err(format!(
                "gone_after ({}s) must be longer than stale_after ({}s)",
                self.gone_after.as_secs(),
                self.stale_after.as_secs()
            ));
        }
        if self.sweep_interval.is_zero() || self.beacon_interval.is_zero() {
            return Err("beacon_interval and sweep_interval must be non-zero".into());
        }
        if self.send_timeout.is_zero() {
            return Err("send_timeout must be non-zero".into());
        }
        if self.event_capacity == 0 {
            return Err("event_capacity must be non-zero".into());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
