//! Active call registry
//!
//! Peers are indexed by dialog key, calls by id. Both maps are copy-on-write
//! snapshots: lookups never block and never see a half-applied update,
//! writers serialize on a small mutex and publish a new map.

use std::collections::HashMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use tracing::debug;

use crate::call::Call;
use crate::peer::CallPeer;
use crate::transport::DialogId;
use crate::types::{CallId, PeerId};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RegistryStats {
    pub active_calls: usize,
    pub active_peers: usize,
    pub total_registered: usize,
    pub total_removed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    registered: usize,
    removed: usize,
}

pub struct ActiveCallRegistry {
    peers: ArcSwap<HashMap<String, Arc<CallPeer>>>,
    calls: ArcSwap<HashMap<CallId, Arc<Call>>>,
    writer: Mutex<Counters>,
}

impl ActiveCallRegistry {
    pub fn new() -> Self {
        Self {
            peers: ArcSwap::from_pointee(HashMap::new()),
            calls: ArcSwap::from_pointee(HashMap::new()),
            writer: Mutex::new(Counters::default()),
        }
    }

    /// Index a peer under its dialog and make sure its call is known
    pub fn insert(&self, call: &Arc<Call>, peer: &Arc<CallPeer>) {
        let mut counters = self.writer.lock();
        let key = peer.dialog().key();

        let mut peers = HashMap::clone(&self.peers.load());
        peers.insert(key.clone(), peer.clone());
        self.peers.store(Arc::new(peers));

        if !self.calls.load().contains_key(call.id()) {
            let mut calls = HashMap::clone(&self.calls.load());
            calls.insert(call.id().clone(), call.clone());
            self.calls.store(Arc::new(calls));
        }
        counters.registered += 1;
        debug!(peer = %peer.id(), dialog = %key, call = %call.id(), "registered peer");
    }

    pub fn peer_by_dialog(&self, dialog: &DialogId) -> Option<Arc<CallPeer>> {
        self.peer_by_key(&dialog.key())
    }

    /// Lookup by raw `call-id;local-tag` key
    pub fn peer_by_key(&self, key: &str) -> Option<Arc<CallPeer>> {
        self.peers.load().get(key).cloned()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<CallPeer>> {
        self.peers.load().values().find(|p| p.id() == peer_id).cloned()
    }

    pub fn call(&self, call_id: &CallId) -> Option<Arc<Call>> {
        self.calls.load().get(call_id).cloned()
    }

    /// Find a confirmed dialog by Call-ID and both tags, whichever side
    /// originated it
    pub fn peer_by_tags(&self, call_id: &str, local_tag: &str, remote_tag: &str) -> Option<Arc<CallPeer>> {
        self.peers
            .load()
            .values()
            .find(|p| {
                let d = p.dialog();
                d.call_id == call_id && d.local_tag == local_tag && d.remote_tag.as_deref() == Some(remote_tag)
            })
            .cloned()
    }

    /// Drop a peer; its call goes too once it has no peers left. Returns
    /// false when the peer was not registered.
    pub fn remove_peer(&self, peer: &CallPeer) -> bool {
        let mut counters = self.writer.lock();
        let key = peer.dialog().key();
        if !self.peers.load().contains_key(&key) {
            return false;
        }
        let mut peers = HashMap::clone(&self.peers.load());
        peers.remove(&key);
        self.peers.store(Arc::new(peers));
        counters.removed += 1;

        let call = self.calls.load().get(peer.call_id()).cloned();
        if let Some(call) = call {
            if call.remove_peer(peer.id()) {
                let mut calls = HashMap::clone(&self.calls.load());
                calls.remove(peer.call_id());
                self.calls.store(Arc::new(calls));
                debug!(call = %peer.call_id(), "call ended");
            }
        }
        debug!(peer = %peer.id(), "removed peer");
        true
    }

    /// Snapshot of the calls in progress
    pub fn active_calls(&self) -> Vec<Arc<Call>> {
        self.calls.load().values().cloned().collect()
    }

    pub fn peers(&self) -> Vec<Arc<CallPeer>> {
        self.peers.load().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.peers.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> RegistryStats {
        let counters = self.writer.lock();
        RegistryStats {
            active_calls: self.calls.load().len(),
            active_peers: self.peers.load().len(),
            total_registered: counters.registered,
            total_removed: counters.removed,
        }
    }
}

impl Default for ActiveCallRegistry {
    fn default() -> Self {
        Self::new()
    }
}
