//! Digest challenge handling (401/407)

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{info, warn};

use crate::errors::Result;
use crate::peer::CallPeer;
use crate::transport::{SipRequest, SipResponse, TransactionProvider};

/// Signs requests against a challenge. Credentials and the digest
/// computation live behind this trait.
#[async_trait]
pub trait SecurityAuthority: Send + Sync {
    /// Return `request` carrying the credentials the challenge asks for.
    /// The request already sits on its new transaction.
    async fn authenticate(&self, challenge: &SipResponse, request: SipRequest) -> Result<SipRequest>;
}

/// Registration control of the account the calls belong to
#[async_trait]
pub trait AccountControl: Send + Sync {
    async fn reregister(&self) -> Result<()>;
}

/// Resend the challenged request with credentials. Any failure ends the
/// affected peer only. Returns true when the signed request went out.
pub async fn handle_challenge(
    peer: &Arc<CallPeer>,
    challenge: &SipResponse,
    authority: &dyn SecurityAuthority,
    transport: &Arc<dyn TransactionProvider>,
    max_attempts: u32,
) -> bool {
    let Some(original) = peer.complete_request(&challenge.transaction) else {
        return false;
    };
    let attempt = peer.record_auth_attempt();
    if attempt > max_attempts {
        warn!(peer = %peer.id(), attempt, "giving up on authentication");
        peer.fail("authentication failed", Some(challenge)).await;
        return false;
    }

    let retry = original.clone_onto(transport.new_branch(), peer.next_cseq());
    let signed = match authority.authenticate(challenge, retry).await {
        Ok(signed) => signed,
        Err(e) => {
            warn!(peer = %peer.id(), error = %e, "could not answer challenge");
            peer.fail("authentication failed", Some(challenge)).await;
            return false;
        }
    };
    info!(peer = %peer.id(), method = %signed.method, status = challenge.status, attempt, "resending with credentials");
    peer.replace_request(&original.transaction, signed.clone());
    if let Err(e) = transport.send_request(signed).await {
        warn!(peer = %peer.id(), error = %e, "authenticated request could not be sent");
        peer.fail("authentication failed", Some(challenge)).await;
        return false;
    }
    true
}
