//! LanChat Network: message transport and session ordering for LAN chat.
//!
//! This crate moves chat messages between nodes on one local subnet and
//! presents every node with a single ordered, deduplicated message stream,
//! whether a message was authored locally or arrived late, twice, or out of
//! order from a peer.
//!
//! # Architecture
//!
//! - **Transport**: one UDP socket; payloads go to every known peer plus the
//!   subnet broadcast address.
//! - **Discovery**: UDP presence beacons on a second port feed the peer
//!   registry; a periodic sweep ages silent peers out.
//! - **Pipeline**: local echo, dedup by origin id, and ordering by
//!   `(timestamp, origin_id)` with insert/append events.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use lanchat_network::{ChatNode, NetworkConfig, NodeIdentity};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let identity = NodeIdentity::generate("alice");
//! let mut node = ChatNode::start(identity, NetworkConfig::default()).await?;
//!
//! let mut events = node.subscribe();
//! node.submit("hello, lan", "alice")?;
//! let event = events.recv().await?;
//! println!("{}: {}", event.message().nickname, event.message().content);
//!
//! node.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod discovery;
pub mod error;
pub mod identity;
pub mod message;
pub mod node;
pub mod peer;
pub mod pipeline;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use clock::ClockStamp;
pub use config::NetworkConfig;
pub use error::{DecodeError, StartupError, TransportError, ValidationError};
pub use identity::{NodeId, NodeIdentity};
pub use message::ChatMessage;
pub use node::ChatNode;
pub use peer::{PeerEvent, PeerInfo, PeerRegistry, PeerState};
pub use pipeline::{DeliveryEvent, DeliveryPipeline, Diagnostic, IngestOutcome};
pub use transport::{BroadcastReport, Transport};
