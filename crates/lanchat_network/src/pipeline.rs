//! Delivery pipeline: turns local submissions and inbound payloads into one
//! ordered, deduplicated message stream.
//!
//! Messages are ordered by `(timestamp, origin_id)`. A message older than the
//! tail is inserted at its sorted position and announced as
//! [`DeliveryEvent::Inserted`]; everything else is
//! [`DeliveryEvent::Appended`]. The stream and its id index sit behind a
//! single lock, and events are published while that lock is held, so every
//! subscriber observes mutations in the order they happened.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, trace, warn};

use crate::clock::ClockStamp;
use crate::config::NetworkConfig;
use crate::error::ValidationError;
use crate::identity::NodeId;
use crate::message::{ChatMessage, MAX_DATAGRAM_BYTES};
use crate::peer::PeerRegistry;

/// Capacity of the queue between `submit` and the broadcast task.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 256;

/// A change to the delivery stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryEvent {
    /// `message` was added at the tail, at `index`.
    Appended { index: usize, message: ChatMessage },
    /// `message` was inserted before existing messages, at `index`.
    Inserted { index: usize, message: ChatMessage },
}

impl DeliveryEvent {
    pub fn index(&self) -> usize {
        match self {
            Self::Appended { index, .. } | Self::Inserted { index, .. } => *index,
        }
    }

    pub fn message(&self) -> &ChatMessage {
        match self {
            Self::Appended { message, .. } | Self::Inserted { message, .. } => message,
        }
    }

    pub fn is_insertion(&self) -> bool {
        matches!(self, Self::Inserted { .. })
    }
}

/// Non-fatal conditions, published for observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// An inbound payload could not be decoded and was dropped.
    DecodeFailed { source: SocketAddr, error: String },
    /// A message could not be sent to a peer and was dropped for it.
    SendFailed { target: SocketAddr, error: String },
}

/// What `ingest` did with a payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// The message was new and now sits at `index`.
    Delivered { index: usize, inserted: bool },
    /// The message had already been delivered.
    Duplicate,
    /// The payload was malformed.
    Rejected,
}

/// The delivery stream and the ids it holds, mutated as one unit.
///
/// Ids are kept for as long as their messages, the lifetime of the session,
/// so a redelivered id is caught no matter what timestamp it carries.
#[derive(Debug, Default)]
struct StreamState {
    messages: Vec<ChatMessage>,
    delivered: HashSet<String>,
}

impl StreamState {
    /// Place `message` at its sorted position. `None` if already delivered.
    fn deliver(&mut self, message: ChatMessage) -> Option<DeliveryEvent> {
        if self.delivered.contains(&message.origin_id) {
            return None;
        }
        let index = self
            .messages
            .partition_point(|existing| existing.cmp_order(&message).is_lt());

        self.delivered.insert(message.origin_id.clone());
        let appended = index == self.messages.len();
        self.messages.insert(index, message.clone());
        Some(if appended {
            DeliveryEvent::Appended { index, message }
        } else {
            DeliveryEvent::Inserted { index, message }
        })
    }
}

/// Accepts local submissions and remote payloads and maintains the ordered,
/// deduplicated delivery stream.
pub struct DeliveryPipeline {
    node_id: NodeId,
    clock: ClockStamp,
    sequence: AtomicU64,
    state: Mutex<StreamState>,
    peers: Arc<Mutex<PeerRegistry>>,
    events: broadcast::Sender<DeliveryEvent>,
    diagnostics: broadcast::Sender<Diagnostic>,
    outbound: mpsc::Sender<Vec<u8>>,
}

impl DeliveryPipeline {
    /// Create a pipeline. The returned receiver yields the payloads of
    /// locally submitted messages, to be handed to the transport.
    pub fn new(
        node_id: NodeId,
        clock: ClockStamp,
        peers: Arc<Mutex<PeerRegistry>>,
        config: &NetworkConfig,
    ) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        let (diagnostics, _) = broadcast::channel(config.event_capacity.max(1));
        let pipeline = Self {
            node_id,
            clock,
            sequence: AtomicU64::new(0),
            state: Mutex::new(StreamState::default()),
            peers,
            events,
            diagnostics,
            outbound,
        };
        (pipeline, outbound_rx)
    }

    /// The id of the local node.
    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    /// Author a message, deliver it locally, and queue it for broadcast.
    ///
    /// Never waits on the network. Content that is blank after trimming, or
    /// whose wire form would not fit in one datagram, is rejected and
    /// nothing is delivered or sent.
    pub fn submit(&self, content: &str, nickname: &str) -> Result<ChatMessage, ValidationError> {
        if content.trim().is_empty() {
            return Err(ValidationError::EmptyContent);
        }
        let raw = content.len() + nickname.len();
        if raw > MAX_DATAGRAM_BYTES {
            return Err(ValidationError::ContentTooLong {
                size: raw,
                limit: MAX_DATAGRAM_BYTES,
            });
        }

        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed) + 1;
        let message = ChatMessage::new(
            content,
            nickname,
            self.clock.stamp(),
            self.node_id.origin_id(sequence),
        );
        let payload = message.encode();
        if payload.len() > MAX_DATAGRAM_BYTES {
            return Err(ValidationError::ContentTooLong {
                size: payload.len(),
                limit: MAX_DATAGRAM_BYTES,
            });
        }

        // Local echo first; the network send happens later on the broadcast task.
        self.deliver(message.clone());

        match self.outbound.try_send(payload) {
            Ok(()) => trace!("Queued {} for broadcast", message.origin_id),
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Outbound queue full, {} not broadcast", message.origin_id);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Outbound queue closed, {} not broadcast", message.origin_id);
            }
        }
        Ok(message)
    }

    /// Handle a payload received from `source`.
    ///
    /// Malformed payloads are dropped and reported as
    /// [`Diagnostic::DecodeFailed`]. Already delivered messages are dropped
    /// silently. New messages register the sender as a peer and enter the
    /// stream at their sorted position.
    pub fn ingest(&self, source: SocketAddr, payload: &[u8]) -> IngestOutcome {
        let message = match ChatMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("Dropping payload from {source}: {e}");
                self.report(Diagnostic::DecodeFailed {
                    source,
                    error: e.to_string(),
                });
                return IngestOutcome::Rejected;
            }
        };

        let origin_id = message.origin_id.clone();
        match self.deliver(message) {
            Some((index, inserted)) => {
                self.peers.lock().touch(source);
                trace!("Delivered {origin_id} from {source} at {index}");
                IngestOutcome::Delivered { index, inserted }
            }
            None => {
                trace!("Duplicate {origin_id} from {source}");
                IngestOutcome::Duplicate
            }
        }
    }

    fn deliver(&self, message: ChatMessage) -> Option<(usize, bool)> {
        let mut state = self.state.lock();
        let event = state.deliver(message)?;
        let placed = (event.index(), event.is_insertion());
        // No subscribers is fine.
        let _ = self.events.send(event);
        Some(placed)
    }

    /// Subscribe to delivery events.
    ///
    /// A subscriber that falls more than the channel capacity behind gets
    /// `RecvError::Lagged` and should resync from [`snapshot`](Self::snapshot).
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Subscribe to diagnostics.
    pub fn diagnostics(&self) -> broadcast::Receiver<Diagnostic> {
        self.diagnostics.subscribe()
    }

    /// Publish a diagnostic raised outside the pipeline (e.g. a failed send).
    pub fn report(&self, diagnostic: Diagnostic) {
        let _ = self.diagnostics.send(diagnostic);
    }

    /// A copy of the current delivery stream.
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.state.lock().messages.clone()
    }

    pub fn len(&self) -> usize {
        self.state.lock().messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().messages.is_empty()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
