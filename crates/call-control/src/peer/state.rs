//! Call peer states and the legal transitions between them

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PeerState {
    Initializing,
    /// INVITE sent, nothing heard yet
    Connecting,
    /// 180 received
    AlertingRemoteSide,
    /// 18x with SDP received, early media running
    ConnectingWithEarlyMedia,
    /// INVITE received, not answered
    IncomingCall,
    /// 200 sent, waiting for ACK
    ConnectingIncomingCall,
    Connected,
    OnHoldLocally,
    OnHoldRemotely,
    OnHoldMutually,
    /// Accepted a REFER, transfer in progress
    Referred,
    Disconnected,
    Busy,
    Failed,
}

impl PeerState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PeerState::Disconnected | PeerState::Busy | PeerState::Failed)
    }

    pub fn is_on_hold(&self) -> bool {
        matches!(
            self,
            PeerState::OnHoldLocally | PeerState::OnHoldRemotely | PeerState::OnHoldMutually
        )
    }

    /// Dialog confirmed (BYE is the way out)
    pub fn is_established(&self) -> bool {
        matches!(self, PeerState::Connected | PeerState::Referred) || self.is_on_hold()
    }

    /// Outbound INVITE still unanswered (CANCEL is the way out)
    pub fn is_outgoing_pending(&self) -> bool {
        matches!(
            self,
            PeerState::Connecting | PeerState::AlertingRemoteSide | PeerState::ConnectingWithEarlyMedia
        )
    }

    /// Inbound INVITE not yet confirmed by ACK
    pub fn is_incoming_pending(&self) -> bool {
        matches!(self, PeerState::IncomingCall | PeerState::ConnectingIncomingCall)
    }

    /// Established state for a pair of hold flags
    pub fn for_hold(local_hold: bool, remote_hold: bool) -> Self {
        match (local_hold, remote_hold) {
            (false, false) => PeerState::Connected,
            (true, false) => PeerState::OnHoldLocally,
            (false, true) => PeerState::OnHoldRemotely,
            (true, true) => PeerState::OnHoldMutually,
        }
    }

    /// Whether `self → next` is a legal transition. Terminal states allow
    /// nothing.
    pub fn can_transition_to(&self, next: PeerState) -> bool {
        use PeerState::*;
        if self.is_terminal() || *self == next {
            return false;
        }
        let established = next.is_established() && next != Referred;
        match self {
            Initializing => matches!(next, Connecting | IncomingCall | Disconnected | Failed),
            Connecting => {
                matches!(next, AlertingRemoteSide | ConnectingWithEarlyMedia) || established || next.is_terminal()
            }
            AlertingRemoteSide => matches!(next, ConnectingWithEarlyMedia) || established || next.is_terminal(),
            ConnectingWithEarlyMedia => established || next.is_terminal(),
            IncomingCall => matches!(next, ConnectingIncomingCall) || established || next.is_terminal(),
            ConnectingIncomingCall => established || matches!(next, Disconnected | Failed),
            Connected | OnHoldLocally | OnHoldRemotely | OnHoldMutually => {
                established || matches!(next, Referred | Disconnected | Failed)
            }
            Referred => established || matches!(next, Disconnected | Failed),
            Disconnected | Busy | Failed => false,
        }
    }
}

impl fmt::Display for PeerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}
