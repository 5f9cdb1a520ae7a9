//! 491 retry scheduling and the response ledger
//!
//! A 491 (Request Pending) means both sides tried to renegotiate at once.
//! The request is resent on a new transaction after a randomized delay;
//! the side that owns the Call-ID waits longer so the two retries do not
//! collide again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::peer::CallPeer;
use crate::transport::{DialogId, Method, SipResponse, TransactionProvider};

/// Delay before resending a request that got 491.
///
/// `2100 + 10·k` ms (k in 0..200) when we originated the dialog, `10·k` ms
/// otherwise.
pub fn request_pending_delay<R: Rng + ?Sized>(originated_locally: bool, rng: &mut R) -> Duration {
    let jitter = 10 * rng.gen_range(0..200u64);
    let base = if originated_locally { 2100 } else { 0 };
    Duration::from_millis(base + jitter)
}

/// Resend the request answered by `response` after the 491 back-off.
/// Returns false when there is nothing to resend.
pub fn schedule_request_pending_retry(
    peer: Arc<CallPeer>,
    response: &SipResponse,
    transport: Arc<dyn TransactionProvider>,
) -> bool {
    let Some(original) = peer.complete_request(&response.transaction) else {
        debug!(peer = %peer.id(), "491 for unknown transaction");
        return false;
    };
    let retry = original.clone_onto(transport.new_branch(), peer.next_cseq());
    peer.replace_request(&original.transaction, retry.clone());

    let delay = request_pending_delay(peer.is_outgoing(), &mut rand::thread_rng());
    info!(peer = %peer.id(), method = %retry.method, delay_ms = delay.as_millis() as u64, "request pending, retrying");

    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        if peer.state().is_terminal() {
            debug!(peer = %peer.id(), "peer ended before retry");
            return;
        }
        if let Err(e) = transport.send_request(retry).await {
            warn!(peer = %peer.id(), error = %e, "retry could not be sent");
            peer.fail("retry could not be sent", None).await;
        }
    });
    true
}

struct Observer {
    sender: oneshot::Sender<SipResponse>,
    registered: Instant,
}

/// One-shot observers of final responses keyed by `(dialog, method)`.
///
/// The first matching final response consumes the observer. Observers
/// nobody matched expire after the TTL; dropping the receiver makes the
/// entry collectable immediately.
pub struct ResponseLedger {
    observers: DashMap<(String, Method), Observer>,
    ttl: Duration,
}

impl ResponseLedger {
    pub fn new(ttl: Duration) -> Self {
        Self { observers: DashMap::new(), ttl }
    }

    /// Register before sending. A second observer for the same key replaces
    /// the first.
    pub fn observe(&self, dialog: &DialogId, method: Method) -> oneshot::Receiver<SipResponse> {
        let (sender, receiver) = oneshot::channel();
        self.observers.insert((dialog.key(), method), Observer { sender, registered: Instant::now() });
        receiver
    }

    /// Hand a final response to its observer, if any
    pub fn deliver(&self, response: &SipResponse) -> bool {
        if response.is_provisional() {
            return false;
        }
        let key = (response.dialog.key(), response.method.clone());
        match self.observers.remove(&key) {
            Some((_, observer)) => observer.sender.send(response.clone()).is_ok(),
            None => false,
        }
    }

    /// Drop expired or abandoned observers; returns how many went
    pub fn sweep(&self) -> usize {
        let before = self.observers.len();
        let ttl = self.ttl;
        self.observers
            .retain(|_, o| o.registered.elapsed() < ttl && !o.sender.is_closed());
        before.saturating_sub(self.observers.len())
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub fn spawn_sweeper(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = self.sweep();
                if removed > 0 {
                    debug!(removed, "swept response observers");
                }
            }
        })
    }
}
