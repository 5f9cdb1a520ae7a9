//! Notifications published to the call-management layer
//!
//! Events are advisory: publishing never blocks and never fails the
//! operation that produced it. Subscribers that fall behind lose the oldest
//! events (tokio broadcast semantics).

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tracing::trace;

use crate::errors::NegotiationFailure;
use crate::peer::PeerState;
use crate::transport::{NameAddr, SipRequest, SipResponse};
use crate::types::{CallId, PeerId};

const EVENT_CHANNEL_CAPACITY: usize = 1000;

/// A call peer changed state
#[derive(Debug, Clone)]
pub struct PeerStateEvent {
    pub peer_id: PeerId,
    pub call_id: CallId,
    pub previous_state: PeerState,
    pub new_state: PeerState,
    /// Reason for the change ("unexpected response", "Call answered", ...)
    pub reason: Option<String>,
    /// Request that caused the transition, if any
    pub request: Option<SipRequest>,
    /// Response that caused the transition, if any
    pub response: Option<SipResponse>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub enum CallControlEvent {
    PeerStateChanged(PeerStateEvent),

    /// New inbound call waiting for `answer` or `hangup`
    IncomingCall {
        call_id: CallId,
        peer_id: PeerId,
        from: NameAddr,
    },

    /// Offer/answer failed for a peer; the call is torn down separately
    NegotiationFailed {
        peer_id: PeerId,
        failure: NegotiationFailure,
    },

    /// Progress of a REFER we sent, from the transferee's NOTIFY
    TransferProgress {
        peer_id: PeerId,
        status: u16,
        terminated: bool,
    },

    DisplayNameResolved {
        peer_id: PeerId,
        display_name: String,
    },
}

/// Broadcast fan-out of [`CallControlEvent`]s
#[derive(Debug, Clone)]
pub struct EventPublisher {
    sender: broadcast::Sender<CallControlEvent>,
}

impl EventPublisher {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: CallControlEvent) {
        // no subscribers is not an error
        if self.sender.send(event).is_err() {
            trace!("event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallControlEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
