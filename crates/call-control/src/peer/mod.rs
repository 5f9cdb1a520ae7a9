//! Call peer: one remote party in a call
//!
//! A [`CallPeer`] owns the dialog bookkeeping for one remote party, its
//! [`PeerState`], and the [`MediaHandler`] that negotiates its media. The
//! handler sits behind an async mutex that doubles as the offer/answer lock:
//! a peer never processes two exchanges at once.
//!
//! Short-lived bookkeeping (state, dialog, pending transactions) uses
//! `parking_lot` locks that are never held across an `.await`.

pub mod state;

pub use state::PeerState;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::call::Call;
use crate::config::CallControlConfig;
use crate::errors::{CallError, NegotiationFailure, Result};
use crate::events::{CallControlEvent, EventPublisher, PeerStateEvent};
use crate::media::MediaEngine;
use crate::negotiation::MediaHandler;
use crate::sdp::SessionDescription;
use crate::transport::{
    CONTENT_TYPE_MEDIA_CONTROL, CONTENT_TYPE_SDP, DialogId, Method, NameAddr, SipRequest, SipResponse,
    TransactionId, TransactionProvider,
};
use crate::types::{CallId, PeerId};

/// XML body of a `picture_fast_update` INFO
pub const PICTURE_FAST_UPDATE: &str = "<?xml version=\"1.0\" encoding=\"utf-8\" ?>\r\n\
<media_control><vc_primitive><to_encoder><picture_fast_update/></to_encoder></vc_primitive></media_control>";

/// Collaborators shared by every peer of a dispatcher
#[derive(Clone)]
pub struct PeerContext {
    pub transport: Arc<dyn TransactionProvider>,
    pub engine: Arc<dyn MediaEngine>,
    pub events: EventPublisher,
    pub config: Arc<CallControlConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallDirection {
    Outgoing,
    Incoming,
}

/// Follow-up the dispatcher has to perform after a response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerAction {
    None,
    /// 301/302 to a new address: place a fresh call there
    FollowRedirect(NameAddr),
    /// 403: the account should register again
    Reregister,
}

struct DialogState {
    dialog: DialogId,
    local_cseq: u32,
    remote_target: Option<NameAddr>,
    /// The INVITE that created the dialog, ours or theirs
    initial_invite: Option<SipRequest>,
    /// Our requests still waiting for a final response
    pending: HashMap<TransactionId, SipRequest>,
    /// We sent an offer in a 2xx; the answer comes in the ACK
    awaiting_ack_answer: bool,
    cancel_sent: bool,
    auth_attempts: u32,
}

pub struct CallPeer {
    id: PeerId,
    call_id: CallId,
    direction: CallDirection,
    local: NameAddr,
    remote: RwLock<NameAddr>,
    state: Mutex<PeerState>,
    dialog: Mutex<DialogState>,
    media: tokio::sync::Mutex<MediaHandler>,
    call_muted: Arc<AtomicBool>,
    transport: Arc<dyn TransactionProvider>,
    events: EventPublisher,
    config: Arc<CallControlConfig>,
    created_at: DateTime<Utc>,
}

impl fmt::Debug for CallPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallPeer")
            .field("id", &self.id)
            .field("call_id", &self.call_id)
            .field("direction", &self.direction)
            .field("remote", &*self.remote.read())
            .field("state", &*self.state.lock())
            .finish()
    }
}

impl CallPeer {
    fn build(
        call: &Call,
        direction: CallDirection,
        remote: NameAddr,
        dialog: DialogState,
        ctx: &PeerContext,
    ) -> Self {
        let mut local = NameAddr::new(ctx.config.local_uri.clone());
        local.display_name = ctx.config.display_name.clone();
        Self {
            id: PeerId::new(),
            call_id: call.id().clone(),
            direction,
            local,
            remote: RwLock::new(remote),
            state: Mutex::new(PeerState::Initializing),
            dialog: Mutex::new(dialog),
            media: tokio::sync::Mutex::new(MediaHandler::new(ctx.engine.clone(), ctx.config.clone())),
            call_muted: call.mute_flag(),
            transport: ctx.transport.clone(),
            events: ctx.events.clone(),
            config: ctx.config.clone(),
            created_at: Utc::now(),
        }
    }

    /// Peer for a call we place; `invite` starts it
    pub fn outgoing(call: &Call, remote: NameAddr, ctx: &PeerContext) -> Self {
        let dialog = DialogState {
            dialog: DialogId::generate(),
            local_cseq: 0,
            remote_target: None,
            initial_invite: None,
            pending: HashMap::new(),
            awaiting_ack_answer: false,
            cancel_sent: false,
            auth_attempts: 0,
        };
        Self::build(call, CallDirection::Outgoing, remote, dialog, ctx)
    }

    /// Peer for an inbound INVITE, in `IncomingCall`
    pub fn incoming(call: &Call, invite: SipRequest, ctx: &PeerContext) -> Self {
        let dialog = DialogState {
            dialog: invite.dialog.clone(),
            local_cseq: 0,
            remote_target: invite.contact.clone(),
            initial_invite: Some(invite.clone()),
            pending: HashMap::new(),
            awaiting_ack_answer: false,
            cancel_sent: false,
            auth_attempts: 0,
        };
        let peer = Self::build(call, CallDirection::Incoming, invite.from.clone(), dialog, ctx);
        peer.set_state(PeerState::IncomingCall, Some("INVITE received"), Some(&invite), None);
        peer
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn call_id(&self) -> &CallId {
        &self.call_id
    }

    pub fn direction(&self) -> CallDirection {
        self.direction
    }

    pub fn is_outgoing(&self) -> bool {
        self.direction == CallDirection::Outgoing
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn state(&self) -> PeerState {
        *self.state.lock()
    }

    pub fn remote_address(&self) -> NameAddr {
        self.remote.read().clone()
    }

    pub fn display_name(&self) -> Option<String> {
        self.remote.read().display_name.clone()
    }

    pub fn set_display_name(&self, name: impl Into<String>) {
        self.remote.write().display_name = Some(name.into());
    }

    pub fn dialog(&self) -> DialogId {
        self.dialog.lock().dialog.clone()
    }

    /// The offer/answer lock. Holding the guard blocks every other exchange
    /// on this peer.
    pub async fn negotiation(&self) -> tokio::sync::MutexGuard<'_, MediaHandler> {
        self.media.lock().await
    }

    /// The INVITE that created the dialog
    pub fn initial_invite(&self) -> Option<SipRequest> {
        self.dialog.lock().initial_invite.clone()
    }

    pub fn pending_request(&self, transaction: &TransactionId) -> Option<SipRequest> {
        self.dialog.lock().pending.get(transaction).cloned()
    }

    /// Take a request out of the pending set once its final response is in
    pub fn complete_request(&self, transaction: &TransactionId) -> Option<SipRequest> {
        self.dialog.lock().pending.remove(transaction)
    }

    /// Swap a pending request for its retry on a new transaction
    pub fn replace_request(&self, old: &TransactionId, request: SipRequest) {
        let mut d = self.dialog.lock();
        d.pending.remove(old);
        if d.initial_invite.as_ref().is_some_and(|i| i.transaction == *old) {
            d.initial_invite = Some(request.clone());
        }
        d.pending.insert(request.transaction.clone(), request);
    }

    pub fn next_cseq(&self) -> u32 {
        let mut d = self.dialog.lock();
        d.local_cseq += 1;
        d.local_cseq
    }

    /// Count an authentication retry; returns the attempts so far
    pub fn record_auth_attempt(&self) -> u32 {
        let mut d = self.dialog.lock();
        d.auth_attempts += 1;
        d.auth_attempts
    }

    /// CANCEL sent while the INVITE transaction is still open; a 2xx may
    /// still arrive and must be ACKed and hung up.
    pub fn awaiting_final_response(&self) -> bool {
        let d = self.dialog.lock();
        d.cancel_sent
            && d.initial_invite
                .as_ref()
                .is_some_and(|invite| d.pending.contains_key(&invite.transaction))
    }

    /// Apply a transition. Illegal transitions and transitions out of a
    /// terminal state are ignored; returns whether the state changed.
    pub(crate) fn set_state(
        &self,
        next: PeerState,
        reason: Option<&str>,
        request: Option<&SipRequest>,
        response: Option<&SipResponse>,
    ) -> bool {
        let previous = {
            let mut state = self.state.lock();
            if !state.can_transition_to(next) {
                if *state != next {
                    debug!(peer = %self.id, from = %*state, to = %next, "ignoring transition");
                }
                return false;
            }
            let previous = *state;
            *state = next;
            previous
        };
        info!(peer = %self.id, from = %previous, to = %next, reason = reason.unwrap_or(""), "peer state changed");
        self.events.publish(CallControlEvent::PeerStateChanged(PeerStateEvent {
            peer_id: self.id.clone(),
            call_id: self.call_id.clone(),
            previous_state: previous,
            new_state: next,
            reason: reason.map(str::to_string),
            request: request.cloned(),
            response: response.cloned(),
            timestamp: Utc::now(),
        }));
        true
    }

    fn new_request(&self, method: Method, cseq: Option<u32>) -> SipRequest {
        let remote = self.remote_address();
        let mut d = self.dialog.lock();
        let cseq = cseq.unwrap_or_else(|| {
            d.local_cseq += 1;
            d.local_cseq
        });
        let mut request = SipRequest::new(
            method,
            self.transport.new_branch(),
            d.dialog.clone(),
            self.local.clone(),
            remote,
            cseq,
        )
        .with_contact(self.local.clone())
        .with_header("User-Agent", self.config.user_agent.clone());
        if let Some(target) = &d.remote_target {
            request.uri = target.uri.clone();
        }
        request
    }

    async fn send_tracked(&self, request: SipRequest) -> Result<()> {
        let transaction = request.transaction.clone();
        self.dialog.lock().pending.insert(transaction.clone(), request.clone());
        if let Err(e) = self.transport.send_request(request).await {
            self.dialog.lock().pending.remove(&transaction);
            return Err(e);
        }
        Ok(())
    }

    async fn respond(&self, request: &SipRequest, status: u16, reason: &str) -> Result<()> {
        let response = SipResponse::to_request(request, status, reason);
        self.transport.send_response(response).await
    }

    fn publish_failure(&self, failure: &NegotiationFailure) {
        self.events.publish(CallControlEvent::NegotiationFailed {
            peer_id: self.id.clone(),
            failure: failure.clone(),
        });
    }

    /// Send the initial INVITE with our offer. `headers` are added as is
    /// (Replaces, Referred-By).
    pub async fn invite(&self, headers: &[(String, String)]) -> Result<()> {
        let state = self.state();
        if state != PeerState::Initializing {
            return Err(CallError::invalid_state("invite", state));
        }
        let created = self.media.lock().await.create_offer();
        let offer = match created {
            Ok(offer) => offer,
            Err(failure) => {
                self.publish_failure(&failure);
                self.finish(PeerState::Failed, failure.user_message(), None).await;
                return Err(failure.into());
            }
        };
        let mut request = self.new_request(Method::Invite, None).with_body(CONTENT_TYPE_SDP, offer.to_string());
        for (name, value) in headers {
            request = request.with_header(name.clone(), value.clone());
        }
        self.dialog.lock().initial_invite = Some(request.clone());
        self.set_state(PeerState::Connecting, Some("INVITE sent"), Some(&request), None);
        if let Err(e) = self.send_tracked(request).await {
            self.finish(PeerState::Failed, "INVITE could not be sent", None).await;
            return Err(e);
        }
        Ok(())
    }

    /// 180 Ringing for a fresh inbound call
    pub async fn ring(&self) -> Result<()> {
        match self.initial_invite() {
            Some(invite) => self.respond(&invite, 180, "Ringing").await,
            None => Err(CallError::internal("inbound peer without INVITE")),
        }
    }

    /// Create streams for the inbound offer before the user answers.
    /// Returns the number of streams created.
    pub async fn precreate_media(&self) -> Result<usize> {
        let Some(invite) = self.initial_invite() else {
            return Ok(0);
        };
        let Some(text) = invite.sdp() else {
            return Ok(0);
        };
        let offer = SessionDescription::parse(text)?;
        Ok(self.media.lock().await.precreate_streams(&offer).await?)
    }

    /// Accept an inbound call: 200 OK with our answer, or with our offer when
    /// the INVITE carried none.
    pub async fn answer(&self) -> Result<()> {
        let state = self.state();
        if state != PeerState::IncomingCall {
            return Err(CallError::invalid_state("answer", state));
        }
        let invite = self
            .initial_invite()
            .ok_or_else(|| CallError::internal("inbound peer without INVITE"))?;

        let mut media = self.media.lock().await;
        let negotiated = match invite.sdp() {
            Some(text) => match SessionDescription::parse(text) {
                Ok(offer) => media.process_offer(&offer, true).await.map(|sdp| (sdp, false)),
                Err(e) => Err(NegotiationFailure::from(e)),
            },
            None => media.create_offer().map(|sdp| (sdp, true)),
        };
        drop(media);

        let (body, late_offer) = match negotiated {
            Ok(negotiated) => negotiated,
            Err(failure) => {
                warn!(peer = %self.id, reason = failure.reason_code(), "cannot answer call");
                self.publish_failure(&failure);
                let sent = self.respond(&invite, failure.status_code(), "Not Acceptable Here").await;
                self.finish(PeerState::Failed, failure.user_message(), None).await;
                sent?;
                return Err(failure.into());
            }
        };
        self.dialog.lock().awaiting_ack_answer = late_offer;

        let response = SipResponse::to_request(&invite, 200, "OK")
            .with_contact(self.local.clone())
            .with_body(CONTENT_TYPE_SDP, body.to_string());
        if let Err(e) = self.transport.send_response(response.clone()).await {
            self.finish(PeerState::Failed, "200 OK could not be sent", None).await;
            return Err(e);
        }
        self.set_state(PeerState::ConnectingIncomingCall, Some("Call answered"), Some(&invite), Some(&response));
        Ok(())
    }

    /// End the call in whatever way the current state calls for: BYE when
    /// established, CANCEL while our INVITE is pending, a rejection while
    /// ringing.
    pub async fn hangup(&self, status: Option<u16>, reason: &str) -> Result<()> {
        self.terminate(PeerState::Disconnected, status, reason, None).await
    }

    /// Fail the peer. Signals the remote side only when a dialog or an open
    /// transaction needs it.
    pub async fn fail(&self, reason: &str, response: Option<&SipResponse>) {
        let state = self.state();
        if state.is_established() || state.is_incoming_pending() {
            if let Err(e) = self.terminate(PeerState::Failed, None, reason, response).await {
                debug!(peer = %self.id, error = %e, "hangup after failure not sent");
            }
        } else {
            self.finish(PeerState::Failed, reason, response).await;
        }
    }

    async fn terminate(
        &self,
        final_state: PeerState,
        status: Option<u16>,
        reason: &str,
        response: Option<&SipResponse>,
    ) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return Ok(());
        }
        let cancelling = state.is_outgoing_pending();
        let sent = if state.is_established() || state == PeerState::ConnectingIncomingCall {
            let bye = self.bye_request(status, reason);
            self.send_tracked(bye).await
        } else if cancelling {
            self.send_cancel().await
        } else if state == PeerState::IncomingCall {
            let (code, text) = match status {
                Some(code) => (code, reason),
                None => self.config.reject_policy.status(),
            };
            match self.initial_invite() {
                Some(invite) => self.respond(&invite, code, text).await,
                None => Ok(()),
            }
        } else {
            Ok(())
        };

        let final_state = match &sent {
            Err(e) => {
                warn!(peer = %self.id, error = %e, "hangup could not be signalled");
                PeerState::Failed
            }
            Ok(()) => final_state,
        };

        let mut media = self.media.lock().await;
        if cancelling && self.state().is_established() {
            // the 2xx won the race with our CANCEL and the dialog is confirmed
            info!(peer = %self.id, "call answered while cancelling, sending BYE");
            let bye = self.bye_request(status, reason);
            if let Err(e) = self.send_tracked(bye).await {
                warn!(peer = %self.id, error = %e, "BYE not sent");
            }
        }
        media.close().await;
        self.set_state(final_state, Some(reason), None, response);
        sent
    }

    fn bye_request(&self, status: Option<u16>, reason: &str) -> SipRequest {
        let bye = self.new_request(Method::Bye, None);
        match status {
            Some(code) => bye.with_header("Reason", format!("SIP;cause={};text=\"{}\"", code, reason)),
            None => bye,
        }
    }

    async fn send_cancel(&self) -> Result<()> {
        let cancel = {
            let mut d = self.dialog.lock();
            let Some(invite) = d.initial_invite.clone() else {
                return Ok(());
            };
            d.cancel_sent = true;
            let mut cancel = SipRequest::new(
                Method::Cancel,
                self.transport.new_branch(),
                invite.dialog.clone(),
                invite.from.clone(),
                invite.to.clone(),
                invite.cseq,
            );
            cancel.uri = invite.uri.clone();
            cancel
        };
        self.transport.send_request(cancel).await
    }

    /// Tear down media and move to a terminal state without signalling
    pub(crate) async fn finish(&self, state: PeerState, reason: &str, response: Option<&SipResponse>) {
        let mut media = self.media.lock().await;
        media.close().await;
        self.set_state(state, Some(reason), None, response);
    }

    /// Put the call on hold or take it off. Idempotent: nothing is sent when
    /// the hold flag already has the requested value.
    pub async fn put_on_hold(&self, on_hold: bool) -> Result<()> {
        let state = self.state();
        if !state.is_established() || state == PeerState::Referred {
            return Err(CallError::invalid_state("hold", state));
        }
        let offer = {
            let mut media = self.media.lock().await;
            if !media.set_local_hold(on_hold) {
                debug!(peer = %self.id, on_hold, "hold unchanged");
                return Ok(());
            }
            match media.create_update_offer() {
                Ok(offer) => offer,
                Err(failure) => {
                    media.set_local_hold(!on_hold);
                    return Err(failure.into());
                }
            }
        };
        let request = self.new_request(Method::Invite, None).with_body(CONTENT_TYPE_SDP, offer.to_string());
        info!(peer = %self.id, on_hold, "sending re-INVITE");
        if let Err(e) = self.send_tracked(request).await {
            self.fail("re-INVITE could not be sent", None).await;
            return Err(e);
        }
        Ok(())
    }

    /// Ask the remote encoder for a keyframe. Best effort.
    pub async fn request_keyframe(&self) -> Result<()> {
        let state = self.state();
        if !state.is_established() {
            return Err(CallError::invalid_state("request keyframe", state));
        }
        let info = self
            .new_request(Method::Info, None)
            .with_body(CONTENT_TYPE_MEDIA_CONTROL, PICTURE_FAST_UPDATE);
        if let Err(e) = self.send_tracked(info).await {
            debug!(peer = %self.id, error = %e, "keyframe request not sent");
        }
        Ok(())
    }

    pub async fn set_mute(&self, muted: bool) -> Result<()> {
        Ok(self.media.lock().await.set_mute(muted).await?)
    }

    /// Send an arbitrary request inside the dialog
    pub async fn send_in_dialog(
        &self,
        method: Method,
        headers: Vec<(String, String)>,
        body: Option<(&str, String)>,
    ) -> Result<TransactionId> {
        let mut request = self.new_request(method, None);
        for (name, value) in headers {
            request = request.with_header(name, value);
        }
        if let Some((content_type, body)) = body {
            request = request.with_body(content_type, body);
        }
        let transaction = request.transaction.clone();
        self.send_tracked(request).await?;
        Ok(transaction)
    }

    /// Move to `Referred` while an accepted transfer runs
    pub(crate) fn mark_referred(&self, refer: &SipRequest) -> bool {
        self.set_state(PeerState::Referred, Some("REFER accepted"), Some(refer), None)
    }

    /// Back to the established state the hold flags describe
    pub(crate) async fn resume_after_transfer(&self, reason: &str) {
        let next = {
            let media = self.media.lock().await;
            PeerState::for_hold(media.is_locally_on_hold(), media.is_remotely_on_hold())
        };
        self.set_state(next, Some(reason), None, None);
    }

    /// In-dialog request from the remote side (REFER and NOTIFY for
    /// transfers are handled by the dispatcher)
    pub async fn handle_request(&self, request: &SipRequest) -> Result<()> {
        match &request.method {
            Method::Ack => self.on_ack(request).await,
            Method::Bye => {
                self.respond(request, 200, "OK").await?;
                self.finish(PeerState::Disconnected, "remote hangup", None).await;
                Ok(())
            }
            Method::Cancel => self.on_cancel(request).await,
            Method::Invite => self.on_reinvite(request).await,
            Method::Info => {
                self.respond(request, 200, "OK").await?;
                let wants_keyframe = request.body.as_deref().is_some_and(|b| b.contains("picture_fast_update"));
                if wants_keyframe {
                    if let Err(e) = self.media.lock().await.request_keyframe().await {
                        debug!(peer = %self.id, error = %e, "keyframe not generated");
                    }
                }
                Ok(())
            }
            Method::Options => self.respond(request, 200, "OK").await,
            Method::Notify => self.respond(request, 489, "Bad Event").await,
            other => {
                debug!(peer = %self.id, method = %other, "unsupported in-dialog request");
                self.respond(request, 501, "Not Implemented").await
            }
        }
    }

    async fn on_ack(&self, ack: &SipRequest) -> Result<()> {
        let state = self.state();
        let awaiting_answer = std::mem::take(&mut self.dialog.lock().awaiting_ack_answer);
        if state != PeerState::ConnectingIncomingCall && !(state.is_established() && awaiting_answer) {
            debug!(peer = %self.id, state = %state, "ignoring ACK");
            return Ok(());
        }

        let mut media = self.media.lock().await;
        if awaiting_answer {
            let outcome = match ack.sdp() {
                Some(text) => match SessionDescription::parse(text) {
                    Ok(answer) => media.process_answer(&answer).await,
                    Err(e) => Err(NegotiationFailure::from(e)),
                },
                None => Err(NegotiationFailure::NoValidDescriptions),
            };
            if let Err(failure) = outcome {
                drop(media);
                warn!(peer = %self.id, reason = failure.reason_code(), "answer in ACK rejected");
                self.publish_failure(&failure);
                return self.terminate(PeerState::Failed, Some(488), failure.user_message(), None).await;
            }
        }
        let next = self.start_media(&mut media).await;
        drop(media);
        self.set_state(next, Some("ACK received"), Some(ack), None);
        Ok(())
    }

    async fn start_media(&self, media: &mut MediaHandler) -> PeerState {
        if let Err(e) = media.set_mute(self.call_muted.load(Ordering::SeqCst)).await {
            warn!(peer = %self.id, error = %e, "failed to sync mute");
        }
        if let Err(e) = media.start().await {
            warn!(peer = %self.id, error = %e, "failed to start media");
        }
        PeerState::for_hold(media.is_locally_on_hold(), media.is_remotely_on_hold())
    }

    async fn on_cancel(&self, cancel: &SipRequest) -> Result<()> {
        self.respond(cancel, 200, "OK").await?;
        if self.state() != PeerState::IncomingCall {
            return Ok(());
        }
        if let Some(invite) = self.initial_invite() {
            self.respond(&invite, 487, "Request Terminated").await?;
        }
        self.finish(PeerState::Disconnected, "cancelled by caller", None).await;
        Ok(())
    }

    async fn on_reinvite(&self, invite: &SipRequest) -> Result<()> {
        let state = self.state();
        if state.is_terminal() {
            return self.respond(invite, 481, "Call/Transaction Does Not Exist").await;
        }
        let glare = self.dialog.lock().pending.values().any(|r| r.method == Method::Invite);
        if !state.is_established() || glare {
            return self.respond(invite, 491, "Request Pending").await;
        }
        if let Some(contact) = &invite.contact {
            self.dialog.lock().remote_target = Some(contact.clone());
        }

        let mut media = self.media.lock().await;
        let Some(text) = invite.sdp() else {
            // offerless re-INVITE: we offer, the answer comes in the ACK
            let offer = media.create_update_offer();
            drop(media);
            return match offer {
                Ok(offer) => {
                    self.dialog.lock().awaiting_ack_answer = true;
                    let response = SipResponse::to_request(invite, 200, "OK")
                        .with_contact(self.local.clone())
                        .with_body(CONTENT_TYPE_SDP, offer.to_string());
                    self.transport.send_response(response).await
                }
                Err(failure) => self.reject_reinvite(invite, failure).await,
            };
        };

        let negotiated = match SessionDescription::parse(text) {
            Ok(offer) => media.process_offer(&offer, true).await,
            Err(e) => Err(NegotiationFailure::from(e)),
        };
        match negotiated {
            Ok(answer) => {
                let next = self.start_media(&mut media).await;
                drop(media);
                let response = SipResponse::to_request(invite, 200, "OK")
                    .with_contact(self.local.clone())
                    .with_body(CONTENT_TYPE_SDP, answer.to_string());
                self.transport.send_response(response.clone()).await?;
                self.set_state(next, Some("re-INVITE received"), Some(invite), Some(&response));
                Ok(())
            }
            Err(failure) => {
                drop(media);
                self.reject_reinvite(invite, failure).await
            }
        }
    }

    /// 488 the re-INVITE and hang up; a call whose media can no longer be
    /// negotiated is not kept alive.
    async fn reject_reinvite(&self, invite: &SipRequest, failure: NegotiationFailure) -> Result<()> {
        warn!(peer = %self.id, reason = failure.reason_code(), "re-INVITE rejected");
        self.publish_failure(&failure);
        if let Err(e) = self.respond(invite, failure.status_code(), "Not Acceptable Here").await {
            debug!(peer = %self.id, error = %e, "rejection not sent");
        }
        self.terminate(PeerState::Disconnected, Some(488), failure.user_message(), None).await
    }

    /// Response to one of our requests. 401/407 and 491 are handled by the
    /// dispatcher before this is called.
    pub async fn handle_response(&self, response: &SipResponse) -> PeerAction {
        let request = {
            let mut d = self.dialog.lock();
            let request = d.pending.get(&response.transaction).cloned();
            if request.is_some() && !response.is_provisional() {
                d.pending.remove(&response.transaction);
            }
            request
        };
        let Some(request) = request else {
            debug!(peer = %self.id, transaction = %response.transaction, status = response.status, "response for unknown transaction");
            return PeerAction::None;
        };

        match &request.method {
            Method::Invite => self.on_invite_response(&request, response).await,
            Method::Bye | Method::Cancel | Method::Info | Method::Notify | Method::Options => {
                if response.is_failure() {
                    debug!(peer = %self.id, method = %request.method, status = response.status, "request failed");
                }
                PeerAction::None
            }
            Method::Refer => {
                if response.is_failure() {
                    self.events.publish(CallControlEvent::TransferProgress {
                        peer_id: self.id.clone(),
                        status: response.status,
                        terminated: true,
                    });
                }
                PeerAction::None
            }
            _ => {
                if response.is_failure() {
                    self.fail("unexpected response", Some(response)).await;
                }
                PeerAction::None
            }
        }
    }

    fn learn_remote(&self, response: &SipResponse) {
        let mut d = self.dialog.lock();
        if d.dialog.remote_tag.is_none() {
            d.dialog.remote_tag = response.dialog.remote_tag.clone();
        }
        if let Some(contact) = &response.contact {
            d.remote_target = Some(contact.clone());
        }
    }

    async fn on_invite_response(&self, request: &SipRequest, response: &SipResponse) -> PeerAction {
        let state = self.state();
        if response.is_provisional() {
            if state.is_outgoing_pending() {
                self.on_provisional(response).await;
            }
            return PeerAction::None;
        }
        if response.is_success() {
            self.on_invite_success(request, response).await;
            return PeerAction::None;
        }
        if response.is_redirect() {
            return self.on_redirect(request, response).await;
        }

        match response.status {
            486 | 600 => {
                self.finish(PeerState::Busy, "remote busy", Some(response)).await;
                PeerAction::None
            }
            487 => {
                self.finish(PeerState::Disconnected, "request terminated", Some(response)).await;
                PeerAction::None
            }
            403 => {
                self.finish(PeerState::Failed, "forbidden", Some(response)).await;
                PeerAction::Reregister
            }
            _ => {
                self.fail("unexpected response", Some(response)).await;
                PeerAction::None
            }
        }
    }

    async fn on_provisional(&self, response: &SipResponse) {
        self.learn_remote(response);
        let Some(text) = response.sdp() else {
            // any 18x means the far end has the call; 100 only means a hop does
            if response.status > 100 {
                self.set_state(PeerState::AlertingRemoteSide, Some("remote ringing"), None, Some(response));
            }
            return;
        };
        if self.state() == PeerState::ConnectingWithEarlyMedia {
            return;
        }

        let mut media = self.media.lock().await;
        let outcome = match SessionDescription::parse(text) {
            Ok(answer) => media.process_answer(&answer).await,
            Err(e) => Err(NegotiationFailure::from(e)),
        };
        match outcome {
            Ok(()) => {
                self.start_media(&mut media).await;
                drop(media);
                self.set_state(PeerState::ConnectingWithEarlyMedia, Some("early media"), None, Some(response));
            }
            Err(failure) => {
                drop(media);
                warn!(peer = %self.id, reason = failure.reason_code(), "early media answer rejected");
                self.publish_failure(&failure);
                if let Err(e) = self.terminate(PeerState::Failed, None, failure.user_message(), Some(response)).await {
                    debug!(peer = %self.id, error = %e, "CANCEL not sent");
                }
            }
        }
    }

    async fn on_invite_success(&self, request: &SipRequest, response: &SipResponse) {
        self.learn_remote(response);
        self.dialog.lock().auth_attempts = 0;
        let ack = self.new_request(Method::Ack, Some(request.cseq));

        // state is only trusted under the offer/answer lock; hangup settles there too
        let mut media = self.media.lock().await;
        let state = self.state();
        if state.is_terminal() {
            drop(media);
            // 2xx raced our CANCEL: confirm the dialog, then end it
            info!(peer = %self.id, "call answered after hangup, sending BYE");
            if let Err(e) = self.transport.send_request(ack).await {
                warn!(peer = %self.id, error = %e, "ACK not sent");
            }
            let bye = self.new_request(Method::Bye, None);
            if let Err(e) = self.transport.send_request(bye).await {
                warn!(peer = %self.id, error = %e, "BYE not sent");
            }
            return;
        }

        let outcome = match response.sdp() {
            Some(text) => match SessionDescription::parse(text) {
                Ok(answer) => media.process_answer(&answer).await,
                Err(e) => Err(NegotiationFailure::from(e)),
            },
            None => Ok(()),
        };
        if let Err(e) = self.transport.send_request(ack).await {
            warn!(peer = %self.id, error = %e, "ACK not sent");
        }
        if let Err(failure) = outcome {
            drop(media);
            warn!(peer = %self.id, reason = failure.reason_code(), "answer rejected");
            self.publish_failure(&failure);
            // the dialog is confirmed now, so leave it with BYE even if we were still pending
            let bye = self.bye_request(Some(488), failure.user_message());
            if let Err(e) = self.send_tracked(bye).await {
                debug!(peer = %self.id, error = %e, "BYE not sent");
            }
            self.finish(PeerState::Failed, failure.user_message(), Some(response)).await;
            return;
        }
        let next = self.start_media(&mut media).await;
        let reason = if state.is_outgoing_pending() { "Call answered" } else { "re-INVITE accepted" };
        self.set_state(next, Some(reason), Some(request), Some(response));
    }

    async fn on_redirect(&self, request: &SipRequest, response: &SipResponse) -> PeerAction {
        if !matches!(response.status, 301 | 302) {
            self.fail("unsupported response", Some(response)).await;
            return PeerAction::None;
        }
        let Some(target) = response.contact.clone() else {
            self.fail("redirect without contact", Some(response)).await;
            return PeerAction::None;
        };
        if target.same_address(&request.to) {
            warn!(peer = %self.id, target = %target, "redirect points back at the same address");
            self.fail("redirect loop", Some(response)).await;
            return PeerAction::None;
        }
        info!(peer = %self.id, target = %target, "following redirect");
        self.finish(PeerState::Disconnected, "redirected", Some(response)).await;
        PeerAction::FollowRedirect(target)
    }

    /// A transaction of ours timed out
    pub async fn handle_timeout(&self, transaction: &TransactionId, method: &Method) {
        let request = self.dialog.lock().pending.remove(transaction);
        if matches!(method, Method::Info | Method::Notify | Method::Options) {
            debug!(peer = %self.id, method = %method, "transaction timed out, ignored");
            return;
        }
        if self.state().is_terminal() {
            return;
        }
        if request.is_none() && *method != Method::Invite {
            debug!(peer = %self.id, transaction = %transaction, "timeout for unknown transaction");
            return;
        }
        warn!(peer = %self.id, method = %method, "transaction timed out");
        self.fail("transaction timeout", None).await;
    }
}
