//! A call groups one or more peers

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use crate::peer::CallPeer;
use crate::types::{CallId, PeerId};

/// Aggregate state derived from the peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Initializing,
    InProgress,
    Ended,
}

#[derive(Debug)]
pub struct Call {
    id: CallId,
    peers: RwLock<Vec<Arc<CallPeer>>>,
    conference_focus: AtomicBool,
    /// Shared with every peer so streams created later pick up the mute
    muted: Arc<AtomicBool>,
    created_at: DateTime<Utc>,
}

impl Call {
    pub fn new() -> Self {
        Self {
            id: CallId::new(),
            peers: RwLock::new(Vec::new()),
            conference_focus: AtomicBool::new(false),
            muted: Arc::new(AtomicBool::new(false)),
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> &CallId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn add_peer(&self, peer: Arc<CallPeer>) {
        self.peers.write().push(peer);
    }

    /// Returns true when the call has no peers left
    pub fn remove_peer(&self, peer_id: &PeerId) -> bool {
        let mut peers = self.peers.write();
        peers.retain(|p| p.id() != peer_id);
        peers.is_empty()
    }

    pub fn peers(&self) -> Vec<Arc<CallPeer>> {
        self.peers.read().clone()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_conference_focus(&self) -> bool {
        self.conference_focus.load(Ordering::SeqCst)
    }

    pub fn set_conference_focus(&self, focus: bool) {
        self.conference_focus.store(focus, Ordering::SeqCst);
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::SeqCst)
    }

    pub(crate) fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::SeqCst);
    }

    pub(crate) fn mute_flag(&self) -> Arc<AtomicBool> {
        self.muted.clone()
    }

    pub fn state(&self) -> CallState {
        let peers = self.peers.read();
        if peers.is_empty() {
            return CallState::Initializing;
        }
        let states: Vec<_> = peers.iter().map(|p| p.state()).collect();
        if states.iter().all(|s| s.is_terminal()) {
            CallState::Ended
        } else if states.iter().any(|s| s.is_established()) {
            CallState::InProgress
        } else {
            CallState::Initializing
        }
    }
}

impl Default for Call {
    fn default() -> Self {
        Self::new()
    }
}
