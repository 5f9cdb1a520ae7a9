// REFER handling on both sides of a transfer, attended transfer and park.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use common::*;
use rvoip_call_control::dispatch::transfer::parse_refer_to;
use rvoip_call_control::transport::{CONTENT_TYPE_SIPFRAG, DialogId, Method, NameAddr, SipRequest, TransactionId};
use rvoip_call_control::{CallControl, CallControlEvent, CallError, PeerState, Replaces, TransferAuthority};

const CAROL: &str = "sip:carol@example.com";

struct AllowAll;

#[async_trait]
impl TransferAuthority for AllowAll {
    async fn authorize(&self, _refer: &SipRequest) -> bool {
        true
    }
}

fn refer_from(invite: &SipRequest, cseq: u32, refer_to: &str) -> SipRequest {
    inbound_in_dialog(invite, Method::Refer, cseq)
        .with_header("Refer-To", refer_to)
        .with_header("Referred-By", format!("<{}>", REMOTE_URI))
}

fn out_of_dialog_refer() -> SipRequest {
    let dialog = DialogId::new(uuid::Uuid::new_v4().to_string(), "ourtag").with_remote_tag("referrer");
    SipRequest::new(
        Method::Refer,
        TransactionId("z9hG4bK-remote-refer".to_string()),
        dialog,
        NameAddr::new("sip:operator@example.com"),
        NameAddr::new(LOCAL_URI),
        1,
    )
    .with_contact(NameAddr::new("sip:operator@198.51.100.9:5060"))
    .with_header("Refer-To", format!("<{}>", CAROL))
}

async fn wait_for_notify(transport: &FakeTransport) -> SipRequest {
    wait_for_request(transport, Method::Notify, |_| true).await
}

#[tokio::test]
async fn test_in_dialog_refer_places_call_and_notifies_once() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (invite, peer) = establish_inbound(&control, pcmu_sdp("sendrecv")).await;

    control.handle_request(refer_from(&invite, 2, &format!("<{}>", CAROL))).await.unwrap();

    assert_eq!(transport.response_statuses().last(), Some(&202));
    assert_eq!(peer.state(), PeerState::Referred);

    let carol_invite = wait_for_request(&transport, Method::Invite, |r| r.to.uri == CAROL).await;
    assert_eq!(carol_invite.header("Referred-By"), Some(format!("<{}>", REMOTE_URI).as_str()));
    control.handle_response(sdp_response_to(&carol_invite, 200, pcmu_sdp("sendrecv"))).await;

    let notify = wait_for_notify(&transport).await;
    assert_eq!(notify.dialog.call_id, invite.dialog.call_id);
    assert_eq!(notify.header("Event"), Some("refer"));
    assert!(notify.header("Subscription-State").unwrap().starts_with("terminated"));
    assert_eq!(notify.header("Content-Type"), Some(CONTENT_TYPE_SIPFRAG));
    assert_eq!(notify.body.as_deref(), Some("SIP/2.0 200 OK"));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.requests_of(Method::Notify).len(), 1);

    // the transferor hangs up once it sees the NOTIFY
    control.handle_request(inbound_in_dialog(&invite, Method::Bye, 3)).await.unwrap();
    assert_eq!(peer.state(), PeerState::Disconnected);
}

#[tokio::test]
async fn test_failed_transfer_reports_decline_and_resumes() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (invite, peer) = establish_inbound(&control, pcmu_sdp("sendrecv")).await;

    control.handle_request(refer_from(&invite, 2, &format!("<{}>", CAROL))).await.unwrap();
    let carol_invite = wait_for_request(&transport, Method::Invite, |r| r.to.uri == CAROL).await;
    control.handle_response(response_to(&carol_invite, 486, "Busy Here")).await;

    let notify = wait_for_notify(&transport).await;
    assert_eq!(notify.body.as_deref(), Some("SIP/2.0 603 Declined"));

    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(peer.state(), PeerState::Connected);
}

#[tokio::test]
async fn test_refer_while_referred_gets_request_pending() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (invite, peer) = establish_inbound(&control, pcmu_sdp("sendrecv")).await;

    control.handle_request(refer_from(&invite, 2, &format!("<{}>", CAROL))).await.unwrap();
    control
        .handle_request(refer_from(&invite, 3, "<sip:dave@example.com>"))
        .await
        .unwrap();

    assert_eq!(transport.response_statuses().last(), Some(&491));
    assert_eq!(peer.state(), PeerState::Referred);
}

#[tokio::test]
async fn test_refer_without_target_is_rejected() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (invite, peer) = establish_inbound(&control, pcmu_sdp("sendrecv")).await;

    control.handle_request(inbound_in_dialog(&invite, Method::Refer, 2)).await.unwrap();

    assert_eq!(transport.response_statuses().last(), Some(&400));
    assert_eq!(peer.state(), PeerState::Connected);
}

#[tokio::test]
async fn test_out_of_dialog_refer_declined_without_authority() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);

    control.handle_request(out_of_dialog_refer()).await.unwrap();

    assert_eq!(transport.response_statuses(), vec![603]);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(transport.requests_of(Method::Invite).is_empty());
}

#[tokio::test]
async fn test_authorized_out_of_dialog_refer_notifies_referrer() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = CallControl::builder(config())
        .with_transport(transport.clone())
        .with_media_engine(engine.clone())
        .with_transfer_authority(Arc::new(AllowAll))
        .build()
        .unwrap();
    let refer = out_of_dialog_refer();

    control.handle_request(refer.clone()).await.unwrap();
    assert_eq!(transport.response_statuses(), vec![202]);

    let carol_invite = wait_for_request(&transport, Method::Invite, |r| r.to.uri == CAROL).await;
    control.handle_response(sdp_response_to(&carol_invite, 200, pcmu_sdp("sendrecv"))).await;

    let notify = wait_for_notify(&transport).await;
    assert_eq!(notify.cseq, 1);
    assert_eq!(notify.dialog, refer.dialog);
    assert_eq!(notify.from, refer.to);
    assert_eq!(notify.to, refer.from);
    assert_eq!(notify.uri, "sip:operator@198.51.100.9:5060");
    assert_eq!(notify.body.as_deref(), Some("SIP/2.0 200 OK"));
}

#[tokio::test]
async fn test_transferor_leaves_on_success_notify() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let mut events = control.subscribe();
    let (_, peer) = establish_outbound(&control, &transport).await;

    control.transfer(peer.id(), CAROL).await.unwrap();
    let refer = transport.last_request(Method::Refer).unwrap();
    assert_eq!(refer.header("Refer-To"), Some("<sip:carol@example.com>"));
    assert_eq!(refer.header("Referred-By"), Some("<sip:alice@example.com>"));
    control.handle_response(response_to(&refer, 202, "Accepted")).await;
    assert_eq!(peer.state(), PeerState::Connected);

    let notify = SipRequest::new(
        Method::Notify,
        TransactionId("z9hG4bK-remote-notify".to_string()),
        peer.dialog(),
        NameAddr::new(REMOTE_URI),
        NameAddr::new(LOCAL_URI),
        1,
    )
    .with_header("Event", "refer")
    .with_header("Subscription-State", "terminated;reason=noresource")
    .with_body(CONTENT_TYPE_SIPFRAG, "SIP/2.0 200 OK");
    control.handle_request(notify).await.unwrap();

    assert_eq!(transport.response_statuses(), vec![200]);
    assert_eq!(transport.requests_of(Method::Bye).len(), 1);
    assert_eq!(peer.state(), PeerState::Disconnected);
    assert!(control.peer(peer.id()).is_none());

    let progress = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(CallControlEvent::TransferProgress { status, terminated, .. }) = events.recv().await {
                return (status, terminated);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(progress, (200, true));
}

#[tokio::test]
async fn test_transferor_stays_on_failed_refer() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (_, peer) = establish_outbound(&control, &transport).await;

    control.transfer(peer.id(), CAROL).await.unwrap();
    let refer = transport.last_request(Method::Refer).unwrap();
    control.handle_response(response_to(&refer, 603, "Decline")).await;

    assert_eq!(peer.state(), PeerState::Connected);
    assert!(transport.requests_of(Method::Bye).is_empty());
}

#[tokio::test]
async fn test_attended_transfer_refers_with_replaces() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (_, first) = establish_outbound(&control, &transport).await;
    let (_, second) = establish_outbound(&control, &transport).await;

    control.attended_transfer(first.id(), second.id()).await.unwrap();

    // both legs went on hold first
    assert_eq!(transport.requests_of(Method::Invite).len(), 4);
    let refer = transport.last_request(Method::Refer).unwrap();
    assert_eq!(refer.dialog.call_id, first.dialog().call_id);

    let target = parse_refer_to(refer.header("Refer-To").unwrap()).unwrap();
    assert_eq!(target.target.uri, REMOTE_URI);
    assert_eq!(target.replaces, Replaces::for_dialog(&second.dialog()));
}

#[tokio::test]
async fn test_park_needs_park_server() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();

    let control = control(&transport, &engine);
    let (_, peer) = establish_outbound(&control, &transport).await;
    let result = control.park(peer.id(), "701").await;
    assert!(matches!(result, Err(CallError::InvalidConfiguration { .. })));
    assert!(transport.requests_of(Method::Refer).is_empty());

    let control = control_with(config().with_park_server("park.example.com"), &transport, &engine);
    let (_, peer) = establish_outbound(&control, &transport).await;
    control.park(peer.id(), "701").await.unwrap();
    let refer = transport.last_request(Method::Refer).unwrap();
    assert_eq!(refer.header("Refer-To"), Some("<sip:701@park.example.com>"));
}

#[tokio::test]
async fn test_transfer_requires_established_call() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (_, peer) = control.create_outgoing_call(REMOTE_URI).await.unwrap();

    let result = control.transfer(peer.id(), CAROL).await;

    assert!(matches!(result, Err(CallError::InvalidState { .. })));
}
