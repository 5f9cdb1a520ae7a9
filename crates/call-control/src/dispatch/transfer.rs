//! Call transfer (REFER, RFC 3515) and dialog replacement (RFC 3891)
//!
//! Transferee side: a REFER is accepted with 202, a new outbound call is
//! placed to the Refer-To target and its outcome is reported with exactly
//! one NOTIFY carrying a terminal `message/sipfrag` and
//! `Subscription-State: terminated`. In-dialog REFERs move the peer to
//! `Referred` meanwhile; out-of-dialog REFERs need a [`TransferAuthority`].
//!
//! Transferor side: NOTIFYs for our REFER are published as
//! `TransferProgress`; a final 2xx hangs up the transferred leg.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::CallControl;
use crate::errors::{CallError, Result};
use crate::events::CallControlEvent;
use crate::peer::{CallPeer, PeerState};
use crate::transport::{CONTENT_TYPE_SIPFRAG, DialogId, Method, NameAddr, SipRequest};
use crate::types::PeerId;

/// Decides whether an out-of-dialog REFER may be acted on
#[async_trait]
pub trait TransferAuthority: Send + Sync {
    async fn authorize(&self, refer: &SipRequest) -> bool;
}

/// Dialog replacement token: `call-id;to-tag=..;from-tag=..`.
///
/// Tags are seen from the recipient of the INVITE carrying it: `to_tag` is
/// the recipient's local tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Replaces {
    pub call_id: String,
    pub to_tag: String,
    pub from_tag: String,
}

impl Replaces {
    /// Token that lets a third party take over our dialog with the remote
    /// side. None until the dialog is confirmed.
    pub fn for_dialog(dialog: &DialogId) -> Option<Self> {
        Some(Self {
            call_id: dialog.call_id.clone(),
            to_tag: dialog.remote_tag.clone()?,
            from_tag: dialog.local_tag.clone(),
        })
    }

    /// Parse a header value, escaped (from a Refer-To URI) or not
    pub fn parse(value: &str) -> Option<Self> {
        let value = percent_decode(value.trim());
        let mut parts = value.split(';');
        let call_id = parts.next()?.trim();
        if call_id.is_empty() {
            return None;
        }
        let (mut to_tag, mut from_tag) = (None, None);
        for param in parts {
            match param.trim().split_once('=') {
                Some((name, tag)) if name.eq_ignore_ascii_case("to-tag") => to_tag = Some(tag.to_string()),
                Some((name, tag)) if name.eq_ignore_ascii_case("from-tag") => from_tag = Some(tag.to_string()),
                _ => {}
            }
        }
        Some(Self { call_id: call_id.to_string(), to_tag: to_tag?, from_tag: from_tag? })
    }

    /// Form usable as a URI header value
    pub fn escaped(&self) -> String {
        percent_encode(&self.to_string())
    }
}

impl fmt::Display for Replaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};to-tag={};from-tag={}", self.call_id, self.to_tag, self.from_tag)
    }
}

fn percent_encode(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            ';' => out.push_str("%3B"),
            '=' => out.push_str("%3D"),
            '@' => out.push_str("%40"),
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            c => out.push(c),
        }
    }
    out
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
            if let Some(byte) = hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Parsed `Refer-To`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReferTarget {
    pub target: NameAddr,
    pub replaces: Option<Replaces>,
}

/// `Refer-To: <sip:carol@example.com?Replaces=...>`. URI headers other
/// than Replaces are dropped.
pub fn parse_refer_to(value: &str) -> Option<ReferTarget> {
    let mut target = NameAddr::parse(value);
    let (uri, headers) = match target.uri.split_once('?') {
        Some((uri, headers)) => (uri.to_string(), Some(headers.to_string())),
        None => (target.uri.clone(), None),
    };
    if uri.is_empty() {
        return None;
    }
    target.uri = uri;
    let replaces = headers.as_deref().and_then(|headers| {
        headers.split('&').find_map(|h| {
            let (name, value) = h.split_once('=')?;
            name.eq_ignore_ascii_case("Replaces").then(|| Replaces::parse(value)).flatten()
        })
    });
    Some(ReferTarget { target, replaces })
}

/// `SIP/2.0 <status> <reason>`
pub fn sipfrag(status: u16, reason: &str) -> String {
    format!("SIP/2.0 {} {}", status, reason)
}

/// Status line of a sipfrag body
pub fn parse_sipfrag_status(body: &str) -> Option<u16> {
    let line = body.lines().next()?;
    let mut parts = line.split_whitespace();
    if !parts.next()?.starts_with("SIP/") {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Where the terminal NOTIFY goes
enum NotifyRoute {
    /// Inside the dialog of the peer that received the REFER
    InDialog(Arc<CallPeer>),
    /// Back along the REFER's own dialog
    OutOfDialog(SipRequest),
}

impl CallControl {
    /// Blind transfer: ask the remote side to call `target`
    pub async fn transfer(&self, peer_id: &PeerId, target: &str) -> Result<()> {
        let peer = self.require_peer(peer_id)?;
        let refer_to = NameAddr::parse(target);
        self.send_refer(&peer, format!("<{}>", refer_to.uri)).await
    }

    /// Attended transfer: the remote side of `peer_id` replaces our dialog
    /// with `target_peer_id`. Both legs are put on hold first.
    pub async fn attended_transfer(&self, peer_id: &PeerId, target_peer_id: &PeerId) -> Result<()> {
        let peer = self.require_peer(peer_id)?;
        let target = self.require_peer(target_peer_id)?;
        peer.put_on_hold(true).await?;
        target.put_on_hold(true).await?;

        let replaces = Replaces::for_dialog(&target.dialog())
            .ok_or_else(|| CallError::transfer_failed("target dialog is not confirmed"))?;
        let refer_to = format!("<{}?Replaces={}>", target.remote_address().uri, replaces.escaped());
        self.send_refer(&peer, refer_to).await
    }

    /// Park the call at `slot` on the configured park server
    pub async fn park(&self, peer_id: &PeerId, slot: &str) -> Result<()> {
        let server = self
            .ctx
            .config
            .park_server
            .clone()
            .ok_or_else(|| CallError::invalid_configuration("park_server", "no park server configured"))?;
        self.transfer(peer_id, &format!("sip:{}@{}", slot, server)).await
    }

    async fn send_refer(&self, peer: &CallPeer, refer_to: String) -> Result<()> {
        let state = peer.state();
        if !state.is_established() {
            return Err(CallError::invalid_state("transfer", state));
        }
        info!(peer = %peer.id(), refer_to = %refer_to, "sending REFER");
        let headers = vec![
            ("Refer-To".to_string(), refer_to),
            ("Referred-By".to_string(), format!("<{}>", self.ctx.config.local_uri)),
        ];
        peer.send_in_dialog(Method::Refer, headers, None).await?;
        Ok(())
    }

    pub(crate) async fn handle_in_dialog_refer(&self, peer: &Arc<CallPeer>, refer: &SipRequest) -> Result<()> {
        let state = peer.state();
        if !state.is_established() || state == PeerState::Referred {
            return self.respond(refer, 491, "Request Pending").await;
        }
        let Some(target) = refer.header("Refer-To").and_then(parse_refer_to) else {
            return self.respond(refer, 400, "Bad Refer-To").await;
        };
        self.respond(refer, 202, "Accepted").await?;
        peer.mark_referred(refer);
        info!(peer = %peer.id(), target = %target.target, "accepted REFER");
        self.spawn_transfer(NotifyRoute::InDialog(peer.clone()), target, refer.header("Referred-By"));
        Ok(())
    }

    pub(crate) async fn handle_out_of_dialog_refer(&self, refer: SipRequest) -> Result<()> {
        let authorized = match &self.transfer_authority {
            Some(authority) => authority.authorize(&refer).await,
            None => false,
        };
        if !authorized {
            info!(from = %refer.from, "REFER declined");
            return self.respond(&refer, 603, "Decline").await;
        }
        let Some(target) = refer.header("Refer-To").and_then(parse_refer_to) else {
            return self.respond(&refer, 400, "Bad Refer-To").await;
        };
        self.respond(&refer, 202, "Accepted").await?;
        let referred_by = refer.header("Referred-By").map(str::to_string);
        self.spawn_transfer(NotifyRoute::OutOfDialog(refer), target, referred_by.as_deref());
        Ok(())
    }

    fn spawn_transfer(&self, route: NotifyRoute, target: ReferTarget, referred_by: Option<&str>) {
        let control = self.clone();
        let referred_by = referred_by.map(str::to_string);
        // subscribe before the call exists so no transition is missed
        let events = self.subscribe();
        tokio::spawn(async move {
            control.run_transfer(route, target, referred_by, events).await;
        });
    }

    async fn run_transfer(
        &self,
        route: NotifyRoute,
        target: ReferTarget,
        referred_by: Option<String>,
        mut events: broadcast::Receiver<CallControlEvent>,
    ) {
        let mut headers = Vec::new();
        if let Some(replaces) = &target.replaces {
            headers.push(("Replaces".to_string(), replaces.to_string()));
        }
        if let Some(by) = referred_by {
            headers.push(("Referred-By".to_string(), by));
        }

        let succeeded = match self.place_call(None, target.target.clone(), headers).await {
            Ok((_, new_peer)) => wait_for_outcome(&mut events, &new_peer).await,
            Err(e) => {
                warn!(target = %target.target, error = %e, "transfer call could not be placed");
                false
            }
        };
        info!(target = %target.target, succeeded, "transfer finished");

        let body = if succeeded { sipfrag(200, "OK") } else { sipfrag(603, "Declined") };
        let headers = vec![
            ("Event".to_string(), "refer".to_string()),
            ("Subscription-State".to_string(), "terminated;reason=noresource".to_string()),
        ];
        match route {
            NotifyRoute::InDialog(peer) => {
                let sent = peer
                    .send_in_dialog(Method::Notify, headers, Some((CONTENT_TYPE_SIPFRAG, body)))
                    .await;
                if let Err(e) = sent {
                    debug!(peer = %peer.id(), error = %e, "transfer NOTIFY not sent");
                }
                if !succeeded {
                    peer.resume_after_transfer("transfer failed").await;
                }
            }
            NotifyRoute::OutOfDialog(refer) => {
                let mut notify = SipRequest::new(
                    Method::Notify,
                    self.ctx.transport.new_branch(),
                    refer.dialog.clone(),
                    refer.to.clone(),
                    refer.from.clone(),
                    1,
                )
                .with_body(CONTENT_TYPE_SIPFRAG, body);
                for (name, value) in headers {
                    notify = notify.with_header(name, value);
                }
                if let Some(contact) = &refer.contact {
                    notify.uri = contact.uri.clone();
                }
                if let Err(e) = self.ctx.transport.send_request(notify).await {
                    debug!(error = %e, "transfer NOTIFY not sent");
                }
            }
        }
    }

    /// NOTIFY reporting on a REFER we sent
    pub(crate) async fn handle_refer_notify(&self, peer: &Arc<CallPeer>, notify: &SipRequest) -> Result<()> {
        self.respond(notify, 200, "OK").await?;
        let Some(status) = notify.body.as_deref().and_then(parse_sipfrag_status) else {
            debug!(peer = %peer.id(), "NOTIFY without sipfrag status");
            return Ok(());
        };
        let terminated = notify
            .header("Subscription-State")
            .is_some_and(|s| s.trim().to_ascii_lowercase().starts_with("terminated"));
        self.ctx.events.publish(CallControlEvent::TransferProgress {
            peer_id: peer.id().clone(),
            status,
            terminated,
        });
        if (200..300).contains(&status) {
            info!(peer = %peer.id(), "transfer completed, leaving call");
            peer.hangup(None, "transferred").await?;
        } else if status >= 300 {
            info!(peer = %peer.id(), status, "transfer failed at the far end");
        }
        Ok(())
    }
}

/// Wait until the new call is up (true) or over (false)
async fn wait_for_outcome(events: &mut broadcast::Receiver<CallControlEvent>, peer: &CallPeer) -> bool {
    loop {
        match events.recv().await {
            Ok(CallControlEvent::PeerStateChanged(change)) if change.peer_id == *peer.id() => {
                if change.new_state.is_established() {
                    return true;
                }
                if change.new_state.is_terminal() {
                    return false;
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(_)) => {
                let state = peer.state();
                if state.is_established() {
                    return true;
                }
                if state.is_terminal() {
                    return false;
                }
            }
            Err(broadcast::error::RecvError::Closed) => return false,
        }
    }
}
