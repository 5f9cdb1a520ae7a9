// Inbound calls: ringing, answering, rejection, late offers and in-dialog
// requests from the caller.

mod common;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;

use common::*;
use rvoip_call_control::transport::{CONTENT_TYPE_SDP, Method, NameAddr};
use rvoip_call_control::{
    CallControl, CallControlEvent, CallError, DisplayNameResolver, NegotiationFailure, PeerState, RejectPolicy,
    SessionDescription,
};

fn audio_video_sdp() -> String {
    let mut sdp = pcmu_sdp("sendrecv");
    sdp.push_str("m=video 5006 RTP/AVP 99\r\na=rtpmap:99 H264/90000\r\na=sendrecv\r\n");
    sdp
}

#[tokio::test]
async fn test_incoming_call_rings_and_is_announced() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let mut events = control.subscribe();

    let invite = inbound_invite(Some(pcmu_sdp("sendrecv")));
    control.handle_request(invite.clone()).await.unwrap();

    assert_eq!(transport.response_statuses(), vec![180]);
    let peer = peer_for(&control, &invite);
    assert_eq!(peer.state(), PeerState::IncomingCall);
    assert_eq!(peer.remote_address().uri, REMOTE_URI);

    let announced = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(CallControlEvent::IncomingCall { peer_id, from, .. }) = events.recv().await {
                return (peer_id, from);
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(&announced.0, peer.id());
    assert_eq!(announced.1.uri, REMOTE_URI);
    // no media before the user answers
    assert_eq!(engine.created_count(), 0);
}

#[tokio::test]
async fn test_answer_prefers_local_codec_order() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);

    let offer = audio_sdp("111 0", &["111 opus/48000/2", "0 PCMU/8000"], "sendrecv");
    let invite = inbound_invite(Some(offer));
    control.handle_request(invite.clone()).await.unwrap();
    let peer = peer_for(&control, &invite);

    control.answer(peer.id()).await.unwrap();
    assert_eq!(peer.state(), PeerState::ConnectingIncomingCall);

    let ok = transport.last_response(200).unwrap();
    assert_eq!(ok.header("Content-Type"), Some(CONTENT_TYPE_SDP));
    let answer = SessionDescription::parse(ok.body.as_deref().unwrap()).unwrap();
    assert_eq!(answer.media.len(), 1);
    assert_eq!(answer.media[0].port, 40000);
    assert_eq!(answer.media[0].formats[0], "0");

    let created = engine.created.lock().clone();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].format.encoding, "PCMU");
    // streams start once the ACK confirms the dialog
    assert!(engine.started.lock().is_empty());

    control.handle_request(inbound_in_dialog(&invite, Method::Ack, 1)).await.unwrap();
    assert_eq!(peer.state(), PeerState::Connected);
    assert_eq!(engine.started.lock().len(), 1);
}

#[tokio::test]
async fn test_offer_without_usable_media_is_rejected() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);

    let offer = "v=0\r\no=- 1 1 IN IP4 198.51.100.7\r\ns=-\r\nc=IN IP4 198.51.100.7\r\nt=0 0\r\n\
                 m=text 5006 RTP/AVP 98\r\na=rtpmap:98 t140/1000\r\n";
    let invite = inbound_invite(Some(offer.to_string()));
    control.handle_request(invite.clone()).await.unwrap();
    let peer = peer_for(&control, &invite);

    let result = control.answer(peer.id()).await;

    assert!(matches!(
        result,
        Err(CallError::Negotiation(NegotiationFailure::NoValidDescriptions))
    ));
    assert_eq!(transport.response_statuses(), vec![180, 488]);
    assert_eq!(peer.state(), PeerState::Failed);
    assert_eq!(engine.created_count(), 0);
    assert!(control.peer(peer.id()).is_none());
}

#[tokio::test]
async fn test_unknown_media_line_is_disabled_in_answer() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);

    let mut offer = pcmu_sdp("sendrecv");
    offer.push_str("m=text 5008 RTP/AVP 98\r\na=rtpmap:98 t140/1000\r\n");
    let invite = inbound_invite(Some(offer));
    control.handle_request(invite.clone()).await.unwrap();
    control.answer(peer_for(&control, &invite).id()).await.unwrap();

    let ok = transport.last_response(200).unwrap();
    let answer = SessionDescription::parse(ok.body.as_deref().unwrap()).unwrap();
    assert_eq!(answer.media.len(), 2);
    assert_eq!(answer.media[0].media, "audio");
    assert_ne!(answer.media[0].port, 0);
    assert_eq!(answer.media[1].media, "text");
    assert_eq!(answer.media[1].port, 0);
    assert_eq!(engine.created_count(), 1);
}

#[tokio::test]
async fn test_late_offer_answer_arrives_in_ack() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);

    let invite = inbound_invite(None);
    control.handle_request(invite.clone()).await.unwrap();
    let peer = peer_for(&control, &invite);
    control.answer(peer.id()).await.unwrap();

    let ok = transport.last_response(200).unwrap();
    let offer = SessionDescription::parse(ok.body.as_deref().unwrap()).unwrap();
    assert_eq!(offer.media[0].formats, vec!["0", "9", "111"]);
    assert_eq!(engine.created_count(), 0);

    let ack = inbound_in_dialog(&invite, Method::Ack, 1).with_body(CONTENT_TYPE_SDP, pcmu_sdp("sendrecv"));
    control.handle_request(ack).await.unwrap();

    assert_eq!(peer.state(), PeerState::Connected);
    assert_eq!(engine.created_count(), 1);
    assert_eq!(engine.started.lock().len(), 1);
}

#[tokio::test]
async fn test_late_offer_ack_without_answer_ends_call() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);

    let invite = inbound_invite(None);
    control.handle_request(invite.clone()).await.unwrap();
    let peer = peer_for(&control, &invite);
    control.answer(peer.id()).await.unwrap();

    control.handle_request(inbound_in_dialog(&invite, Method::Ack, 1)).await.unwrap();

    assert_eq!(peer.state(), PeerState::Failed);
    let bye = transport.last_request(Method::Bye).unwrap();
    assert!(bye.header("Reason").unwrap().contains("cause=488"));
}

#[tokio::test]
async fn test_hangup_while_ringing_applies_reject_policy() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();

    let control = control(&transport, &engine);
    let invite = inbound_invite(Some(pcmu_sdp("sendrecv")));
    control.handle_request(invite.clone()).await.unwrap();
    let peer = peer_for(&control, &invite);
    control.hangup(peer.id()).await.unwrap();
    assert_eq!(peer.state(), PeerState::Disconnected);
    assert_eq!(transport.response_statuses(), vec![180, 486]);

    let transport = FakeTransport::new();
    let control = control_with(config().with_reject_policy(RejectPolicy::Decline), &transport, &engine);
    let invite = inbound_invite(Some(pcmu_sdp("sendrecv")));
    control.handle_request(invite.clone()).await.unwrap();
    control.hangup(peer_for(&control, &invite).id()).await.unwrap();
    assert_eq!(transport.response_statuses(), vec![180, 603]);
}

#[tokio::test]
async fn test_caller_cancels_before_answer() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);

    let invite = inbound_invite(Some(pcmu_sdp("sendrecv")));
    control.handle_request(invite.clone()).await.unwrap();
    let peer = peer_for(&control, &invite);

    control.handle_request(inbound_in_dialog(&invite, Method::Cancel, 1)).await.unwrap();

    assert_eq!(transport.response_statuses(), vec![180, 200, 487]);
    assert_eq!(peer.state(), PeerState::Disconnected);
    assert!(control.peer(peer.id()).is_none());
    assert!(control.answer(peer.id()).await.is_err());
}

#[tokio::test]
async fn test_precreated_stream_is_retargeted_on_answer() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control_with(config().with_stream_precreation(true), &transport, &engine);

    let invite = inbound_invite(Some(pcmu_sdp("sendrecv")));
    control.handle_request(invite.clone()).await.unwrap();
    assert_eq!(engine.created_count(), 1);

    control.answer(peer_for(&control, &invite).id()).await.unwrap();

    assert_eq!(engine.created_count(), 1);
    assert_eq!(engine.retargeted.lock().len(), 1);
}

struct AddressBook;

#[async_trait]
impl DisplayNameResolver for AddressBook {
    async fn resolve(&self, address: &NameAddr) -> Option<String> {
        (address.uri == REMOTE_URI).then(|| "Bob Builder".to_string())
    }
}

#[tokio::test]
async fn test_display_name_is_resolved() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = CallControl::builder(config())
        .with_transport(transport.clone())
        .with_media_engine(engine.clone())
        .with_display_name_resolver(Arc::new(AddressBook))
        .build()
        .unwrap();
    let mut events = control.subscribe();

    let invite = inbound_invite(Some(pcmu_sdp("sendrecv")));
    control.handle_request(invite.clone()).await.unwrap();
    let peer = peer_for(&control, &invite);

    let resolved = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Ok(CallControlEvent::DisplayNameResolved { display_name, .. }) = events.recv().await {
                return display_name;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(resolved, "Bob Builder");
    assert_eq!(peer.display_name().as_deref(), Some("Bob Builder"));
}

#[tokio::test]
async fn test_remote_hold_and_resume() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (invite, peer) = establish_inbound(&control, pcmu_sdp("sendrecv")).await;

    let hold = inbound_in_dialog(&invite, Method::Invite, 2).with_body(CONTENT_TYPE_SDP, pcmu_sdp("sendonly"));
    control.handle_request(hold).await.unwrap();
    assert_eq!(peer.state(), PeerState::OnHoldRemotely);
    let answer = SessionDescription::parse(transport.last_response(200).unwrap().body.as_deref().unwrap()).unwrap();
    assert_eq!(answer.media[0].direction(), Some(rvoip_call_control::MediaDirection::RecvOnly));

    let resume = inbound_in_dialog(&invite, Method::Invite, 3).with_body(CONTENT_TYPE_SDP, pcmu_sdp("sendrecv"));
    control.handle_request(resume).await.unwrap();
    assert_eq!(peer.state(), PeerState::Connected);
    assert_eq!(engine.created_count(), 1);
}

#[tokio::test]
async fn test_unacceptable_reinvite_ends_call() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (invite, peer) = establish_inbound(&control, pcmu_sdp("sendrecv")).await;

    let offer = audio_sdp("18", &["18 G729/8000"], "sendrecv");
    let reinvite = inbound_in_dialog(&invite, Method::Invite, 2).with_body(CONTENT_TYPE_SDP, offer);
    control.handle_request(reinvite).await.unwrap();

    assert!(transport.last_response(488).is_some());
    assert_eq!(transport.requests_of(Method::Bye).len(), 1);
    assert_eq!(peer.state(), PeerState::Disconnected);
    assert!(control.peer(peer.id()).is_none());
}

#[tokio::test]
async fn test_offerless_reinvite_gets_offer() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (invite, peer) = establish_inbound(&control, pcmu_sdp("sendrecv")).await;

    control.handle_request(inbound_in_dialog(&invite, Method::Invite, 2)).await.unwrap();
    let ok = transport.last_response(200).unwrap();
    assert!(ok.body.is_some());

    let ack = inbound_in_dialog(&invite, Method::Ack, 2).with_body(CONTENT_TYPE_SDP, pcmu_sdp("sendrecv"));
    control.handle_request(ack).await.unwrap();
    assert_eq!(peer.state(), PeerState::Connected);
}

#[tokio::test]
async fn test_picture_fast_update_requests_keyframe() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_video();
    let control = control(&transport, &engine);
    let (invite, _peer) = establish_inbound(&control, audio_video_sdp()).await;
    assert_eq!(engine.created_count(), 2);

    let info = inbound_in_dialog(&invite, Method::Info, 2).with_body(
        "application/media_control+xml",
        "<media_control><vc_primitive><to_encoder><picture_fast_update/></to_encoder></vc_primitive></media_control>",
    );
    control.handle_request(info).await.unwrap();

    assert_eq!(transport.response_statuses().last(), Some(&200));
    assert_eq!(engine.keyframes.lock().len(), 1);
}

#[tokio::test]
async fn test_replacing_invite_takes_over_dialog() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let (old_invite, old_peer) = establish_inbound(&control, pcmu_sdp("sendrecv")).await;

    let replacing = inbound_invite(Some(pcmu_sdp("sendrecv"))).with_header(
        "Replaces",
        format!("{};to-tag=ourtag;from-tag=theirtag", old_invite.dialog.call_id),
    );
    control.handle_request(replacing.clone()).await.unwrap();

    let new_peer = peer_for(&control, &replacing);
    assert_eq!(new_peer.state(), PeerState::ConnectingIncomingCall);
    assert_eq!(new_peer.call_id(), old_peer.call_id());
    assert_eq!(old_peer.state(), PeerState::Disconnected);
    let bye = transport.last_request(Method::Bye).unwrap();
    assert_eq!(bye.dialog.call_id, old_invite.dialog.call_id);
    assert!(control.peer(old_peer.id()).is_none());
}

#[tokio::test]
async fn test_replaces_for_unknown_dialog_is_refused() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);

    let invite = inbound_invite(Some(pcmu_sdp("sendrecv")))
        .with_header("Replaces", "nosuchcall@example.com;to-tag=a;from-tag=b");
    control.handle_request(invite).await.unwrap();

    assert_eq!(transport.response_statuses(), vec![481]);
    assert!(control.active_calls().is_empty());
}

#[tokio::test]
async fn test_requests_outside_any_dialog() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let invite = inbound_invite(None);

    control.handle_request(inbound_in_dialog(&invite, Method::Bye, 2)).await.unwrap();
    control.handle_request(inbound_in_dialog(&invite, Method::Options, 3)).await.unwrap();
    control.handle_request(inbound_in_dialog(&invite, Method::Ack, 1)).await.unwrap();

    assert_eq!(transport.response_statuses(), vec![481, 200]);
}

#[tokio::test]
async fn test_negotiation_is_serialized_per_peer() {
    let transport = FakeTransport::new();
    let engine = FakeEngine::audio_only();
    let control = control(&transport, &engine);
    let invite = inbound_invite(Some(pcmu_sdp("sendrecv")));
    control.handle_request(invite.clone()).await.unwrap();
    let peer = peer_for(&control, &invite);

    let guard = peer.negotiation().await;
    let mut second = tokio_test::task::spawn(peer.negotiation());
    assert!(second.poll().is_pending());

    let answering = {
        let control = control.clone();
        let peer_id = peer.id().clone();
        tokio::spawn(async move { control.answer(&peer_id).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(peer.state(), PeerState::IncomingCall);
    assert!(transport.last_response(200).is_none());

    drop(guard);
    assert!(second.is_woken());
    drop(tokio_test::assert_ready!(second.poll()));
    drop(second);

    answering.await.unwrap().unwrap();
    assert_eq!(peer.state(), PeerState::ConnectingIncomingCall);
}
