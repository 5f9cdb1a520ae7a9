//! Call dispatch
//!
//! [`CallControl`] is the entry point of the crate. The transaction provider
//! feeds it requests, responses and timeouts; it routes each one to the
//! owning [`CallPeer`] through the [`ActiveCallRegistry`], answers
//! challenges, schedules 491 retries and coordinates transfers. The
//! call-management layer drives calls through its methods and follows them
//! through [`CallControl::subscribe`].
//!
//! ```no_run
//! # async fn demo(
//! #     transport: std::sync::Arc<dyn rvoip_call_control::TransactionProvider>,
//! #     engine: std::sync::Arc<dyn rvoip_call_control::MediaEngine>,
//! # ) -> rvoip_call_control::Result<()> {
//! use rvoip_call_control::{CallControl, CallControlConfig};
//!
//! let control = CallControl::builder(CallControlConfig::new("sip:alice@example.com"))
//!     .with_transport(transport)
//!     .with_media_engine(engine)
//!     .build()?;
//! let (_call, peer) = control.create_outgoing_call("sip:bob@example.com").await?;
//! control.hangup(peer.id()).await?;
//! # Ok(())
//! # }
//! ```

pub mod auth;
pub mod retry;
pub mod transfer;

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use parking_lot::Mutex;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::call::Call;
use crate::config::CallControlConfig;
use crate::errors::{CallError, Result};
use crate::events::{CallControlEvent, EventPublisher};
use crate::media::MediaEngine;
use crate::peer::{CallPeer, PeerAction, PeerContext};
use crate::registry::{ActiveCallRegistry, RegistryStats};
use crate::transport::{DialogId, Method, NameAddr, SipRequest, SipResponse, TransactionId, TransactionProvider};
use crate::types::{CallId, PeerId};

use self::auth::{AccountControl, SecurityAuthority, handle_challenge};
use self::retry::{ResponseLedger, schedule_request_pending_retry};
use self::transfer::{Replaces, TransferAuthority};

/// Looks up a friendlier name for a caller (address book, directory)
#[async_trait]
pub trait DisplayNameResolver: Send + Sync {
    async fn resolve(&self, address: &NameAddr) -> Option<String>;
}

/// Builder for [`CallControl`]. Transport and media engine are required.
pub struct CallControlBuilder {
    config: CallControlConfig,
    transport: Option<Arc<dyn TransactionProvider>>,
    engine: Option<Arc<dyn MediaEngine>>,
    security: Option<Arc<dyn SecurityAuthority>>,
    transfer_authority: Option<Arc<dyn TransferAuthority>>,
    account: Option<Arc<dyn AccountControl>>,
    resolver: Option<Arc<dyn DisplayNameResolver>>,
}

impl CallControlBuilder {
    pub fn new(config: CallControlConfig) -> Self {
        Self {
            config,
            transport: None,
            engine: None,
            security: None,
            transfer_authority: None,
            account: None,
            resolver: None,
        }
    }

    pub fn with_transport(mut self, transport: Arc<dyn TransactionProvider>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_media_engine(mut self, engine: Arc<dyn MediaEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_security_authority(mut self, authority: Arc<dyn SecurityAuthority>) -> Self {
        self.security = Some(authority);
        self
    }

    pub fn with_transfer_authority(mut self, authority: Arc<dyn TransferAuthority>) -> Self {
        self.transfer_authority = Some(authority);
        self
    }

    pub fn with_account(mut self, account: Arc<dyn AccountControl>) -> Self {
        self.account = Some(account);
        self
    }

    pub fn with_display_name_resolver(mut self, resolver: Arc<dyn DisplayNameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Validate and start. Must be called inside a tokio runtime: the ledger
    /// sweeper is spawned here.
    pub fn build(self) -> Result<CallControl> {
        self.config.validate()?;
        let transport = self
            .transport
            .ok_or_else(|| CallError::invalid_configuration("transport", "a transaction provider is required"))?;
        let engine = self
            .engine
            .ok_or_else(|| CallError::invalid_configuration("media_engine", "a media engine is required"))?;

        let ledger = Arc::new(ResponseLedger::new(self.config.retry.ledger_ttl()));
        let sweeper = ledger.clone().spawn_sweeper(self.config.retry.sweep_interval());
        let config = Arc::new(self.config);
        info!(local_uri = %config.local_uri, "call control started");

        Ok(CallControl {
            ctx: PeerContext { transport, engine, events: EventPublisher::new(), config },
            registry: Arc::new(ActiveCallRegistry::new()),
            ledger,
            security: self.security,
            transfer_authority: self.transfer_authority,
            account: self.account,
            resolver: self.resolver,
            sweeper: Arc::new(Mutex::new(Some(sweeper))),
        })
    }
}

#[derive(Clone)]
pub struct CallControl {
    ctx: PeerContext,
    registry: Arc<ActiveCallRegistry>,
    ledger: Arc<ResponseLedger>,
    security: Option<Arc<dyn SecurityAuthority>>,
    transfer_authority: Option<Arc<dyn TransferAuthority>>,
    account: Option<Arc<dyn AccountControl>>,
    resolver: Option<Arc<dyn DisplayNameResolver>>,
    sweeper: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl std::fmt::Debug for CallControl {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallControl")
            .field("local_uri", &self.ctx.config.local_uri)
            .field("registry", &self.registry.stats())
            .finish()
    }
}

impl CallControl {
    pub fn builder(config: CallControlConfig) -> CallControlBuilder {
        CallControlBuilder::new(config)
    }

    pub fn config(&self) -> &CallControlConfig {
        &self.ctx.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CallControlEvent> {
        self.ctx.events.subscribe()
    }

    /// One-shot observer for the next final response to `method` in
    /// `dialog`. Register before sending.
    pub fn observe_response(&self, dialog: &DialogId, method: Method) -> oneshot::Receiver<SipResponse> {
        self.ledger.observe(dialog, method)
    }

    pub fn call(&self, call_id: &CallId) -> Option<Arc<Call>> {
        self.registry.call(call_id)
    }

    pub fn active_calls(&self) -> Vec<Arc<Call>> {
        self.registry.active_calls()
    }

    pub fn peer(&self, peer_id: &PeerId) -> Option<Arc<CallPeer>> {
        self.registry.peer(peer_id)
    }

    pub fn stats(&self) -> RegistryStats {
        self.registry.stats()
    }

    fn require_peer(&self, peer_id: &PeerId) -> Result<Arc<CallPeer>> {
        self.registry.peer(peer_id).ok_or_else(|| CallError::peer_not_found(peer_id))
    }

    /// Place a new call
    pub async fn create_outgoing_call(&self, target: &str) -> Result<(Arc<Call>, Arc<CallPeer>)> {
        self.place_call(None, NameAddr::parse(target), Vec::new()).await
    }

    /// INVITE `target`, in `call` when given, otherwise in a new call
    pub(crate) async fn place_call(
        &self,
        call: Option<Arc<Call>>,
        target: NameAddr,
        headers: Vec<(String, String)>,
    ) -> Result<(Arc<Call>, Arc<CallPeer>)> {
        let call = call.unwrap_or_else(|| Arc::new(Call::new()));
        let peer = Arc::new(CallPeer::outgoing(&call, target, &self.ctx));
        call.add_peer(peer.clone());
        self.registry.insert(&call, &peer);
        info!(call = %call.id(), peer = %peer.id(), remote = %peer.remote_address(), "placing call");

        if let Err(e) = peer.invite(&headers).await {
            self.evict_if_terminal(&peer);
            return Err(e);
        }
        Ok((call, peer))
    }

    pub async fn answer(&self, peer_id: &PeerId) -> Result<()> {
        let peer = self.require_peer(peer_id)?;
        let result = peer.answer().await;
        self.evict_if_terminal(&peer);
        result
    }

    pub async fn hangup(&self, peer_id: &PeerId) -> Result<()> {
        let peer = self.require_peer(peer_id)?;
        let result = peer.hangup(None, "local hangup").await;
        self.evict_if_terminal(&peer);
        result
    }

    pub async fn put_on_hold(&self, peer_id: &PeerId, on_hold: bool) -> Result<()> {
        self.require_peer(peer_id)?.put_on_hold(on_hold).await
    }

    pub async fn request_keyframe(&self, peer_id: &PeerId) -> Result<()> {
        self.require_peer(peer_id)?.request_keyframe().await
    }

    /// Mute the microphone for every peer of a call
    pub async fn set_mute(&self, call_id: &CallId, muted: bool) -> Result<()> {
        let call = self.registry.call(call_id).ok_or_else(|| CallError::call_not_found(call_id))?;
        call.set_muted(muted);
        for peer in call.peers() {
            peer.set_mute(muted).await?;
        }
        Ok(())
    }

    /// Entry point for requests from the provider
    pub async fn handle_request(&self, request: SipRequest) -> Result<()> {
        let Some(peer) = self.registry.peer_by_dialog(&request.dialog) else {
            return self.handle_out_of_dialog(request).await;
        };
        let result = match &request.method {
            Method::Refer => self.handle_in_dialog_refer(&peer, &request).await,
            Method::Notify if is_refer_event(&request) => self.handle_refer_notify(&peer, &request).await,
            _ => peer.handle_request(&request).await,
        };
        self.evict_if_terminal(&peer);
        result
    }

    async fn handle_out_of_dialog(&self, request: SipRequest) -> Result<()> {
        match &request.method {
            Method::Invite => self.handle_new_invite(request).await,
            Method::Refer => self.handle_out_of_dialog_refer(request).await,
            Method::Ack => {
                debug!(dialog = %request.dialog, "stray ACK");
                Ok(())
            }
            Method::Options => self.respond(&request, 200, "OK").await,
            _ => self.respond(&request, 481, "Call/Transaction Does Not Exist").await,
        }
    }

    async fn respond(&self, request: &SipRequest, status: u16, reason: &str) -> Result<()> {
        self.ctx
            .transport
            .send_response(SipResponse::to_request(request, status, reason))
            .await
    }

    async fn handle_new_invite(&self, invite: SipRequest) -> Result<()> {
        if let Some(value) = invite.header("Replaces") {
            return match Replaces::parse(value) {
                Some(replaces) => self.handle_replacing_invite(invite, replaces).await,
                None => self.respond(&invite, 400, "Bad Replaces Header").await,
            };
        }

        let call = Arc::new(Call::new());
        let peer = Arc::new(CallPeer::incoming(&call, invite, &self.ctx));
        call.add_peer(peer.clone());
        self.registry.insert(&call, &peer);
        info!(call = %call.id(), peer = %peer.id(), from = %peer.remote_address(), "incoming call");

        if let Err(e) = peer.ring().await {
            warn!(peer = %peer.id(), error = %e, "180 Ringing not sent");
        }
        if self.ctx.config.media.precreate_streams {
            match peer.precreate_media().await {
                Ok(created) => debug!(peer = %peer.id(), created, "pre-created streams"),
                Err(e) => debug!(peer = %peer.id(), error = %e, "stream pre-creation skipped"),
            }
        }
        self.ctx.events.publish(CallControlEvent::IncomingCall {
            call_id: call.id().clone(),
            peer_id: peer.id().clone(),
            from: peer.remote_address(),
        });
        self.spawn_display_name_lookup(&peer);
        Ok(())
    }

    /// INVITE that takes over an existing dialog: answer it and drop the
    /// replaced leg
    async fn handle_replacing_invite(&self, invite: SipRequest, replaces: Replaces) -> Result<()> {
        let Some(replaced) = self
            .registry
            .peer_by_tags(&replaces.call_id, &replaces.to_tag, &replaces.from_tag)
            .filter(|p| !p.state().is_terminal())
        else {
            debug!(call_id = %replaces.call_id, "Replaces names no dialog of ours");
            return self.respond(&invite, 481, "Call/Transaction Does Not Exist").await;
        };

        let call = self
            .registry
            .call(replaced.call_id())
            .unwrap_or_else(|| Arc::new(Call::new()));
        let peer = Arc::new(CallPeer::incoming(&call, invite, &self.ctx));
        call.add_peer(peer.clone());
        self.registry.insert(&call, &peer);
        info!(peer = %peer.id(), replaced = %replaced.id(), "INVITE replaces existing dialog");

        let answered = peer.answer().await;
        self.evict_if_terminal(&peer);
        answered?;
        if let Err(e) = replaced.hangup(None, "replaced").await {
            warn!(peer = %replaced.id(), error = %e, "replaced leg not hung up cleanly");
        }
        self.evict_if_terminal(&replaced);
        Ok(())
    }

    fn spawn_display_name_lookup(&self, peer: &Arc<CallPeer>) {
        let Some(resolver) = self.resolver.clone() else {
            return;
        };
        let peer = peer.clone();
        let events = self.ctx.events.clone();
        tokio::spawn(async move {
            let address = peer.remote_address();
            match resolver.resolve(&address).await {
                Some(name) => {
                    debug!(peer = %peer.id(), name = %name, "resolved display name");
                    peer.set_display_name(name.clone());
                    events.publish(CallControlEvent::DisplayNameResolved {
                        peer_id: peer.id().clone(),
                        display_name: name,
                    });
                }
                None => debug!(peer = %peer.id(), "no display name found"),
            }
        });
    }

    /// Entry point for responses from the provider
    pub async fn handle_response(&self, response: SipResponse) {
        let Some(peer) = self.registry.peer_by_dialog(&response.dialog) else {
            self.ledger.deliver(&response);
            debug!(dialog = %response.dialog, status = response.status, "response for unknown dialog");
            return;
        };

        let (handled, retried) = match (response.status, &self.security) {
            (401 | 407, Some(authority)) => {
                let resent = handle_challenge(
                    &peer,
                    &response,
                    authority.as_ref(),
                    &self.ctx.transport,
                    self.ctx.config.retry.max_auth_attempts,
                )
                .await;
                (true, resent)
            }
            (491, _) => (true, schedule_request_pending_retry(peer.clone(), &response, self.ctx.transport.clone())),
            _ => (false, false),
        };
        // observers wait for the outcome of the resent request
        if !retried {
            self.ledger.deliver(&response);
        }

        if !handled {
            match peer.handle_response(&response).await {
                PeerAction::None => {}
                PeerAction::FollowRedirect(target) => {
                    let call = self.registry.call(peer.call_id());
                    if let Err(e) = self.place_call(call, target, Vec::new()).await {
                        warn!(peer = %peer.id(), error = %e, "redirected call failed");
                    }
                }
                PeerAction::Reregister => match &self.account {
                    Some(account) => {
                        if let Err(e) = account.reregister().await {
                            warn!(error = %e, "re-registration failed");
                        }
                    }
                    None => debug!("403 received, no account to re-register"),
                },
            }
        }
        self.evict_if_terminal(&peer);
    }

    /// Entry point for transaction timeouts from the provider
    pub async fn handle_timeout(&self, dialog: &DialogId, transaction: &TransactionId, method: Method) {
        let Some(peer) = self.registry.peer_by_dialog(dialog) else {
            debug!(dialog = %dialog, method = %method, "timeout for unknown dialog");
            return;
        };
        peer.handle_timeout(transaction, &method).await;
        self.evict_if_terminal(&peer);
    }

    fn evict_if_terminal(&self, peer: &CallPeer) {
        if peer.state().is_terminal() && !peer.awaiting_final_response() {
            self.registry.remove_peer(peer);
        }
    }

    /// Hang up every active peer concurrently and stop background work
    pub async fn shutdown(&self) {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let peers = self.registry.peers();
        info!(peers = peers.len(), "shutting down call control");
        let results = join_all(peers.iter().map(|p| p.hangup(None, "shutdown"))).await;
        for (peer, result) in peers.iter().zip(results) {
            if let Err(e) = result {
                debug!(peer = %peer.id(), error = %e, "hangup during shutdown failed");
            }
            self.registry.remove_peer(peer);
        }
    }
}

fn is_refer_event(request: &SipRequest) -> bool {
    request
        .header("Event")
        .is_some_and(|e| e.split(';').next().is_some_and(|name| name.trim().eq_ignore_ascii_case("refer")))
}
