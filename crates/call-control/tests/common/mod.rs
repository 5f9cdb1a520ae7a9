// Shared fakes for the call-control scenario tests: a recording transaction
// provider, an in-memory media engine and a signing security authority.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Notify, broadcast};

use rvoip_call_control::media::{MediaDevice, MediaEngine, MediaError, MediaFormat, RtpExtension, StreamHandle, StreamSpec};
use rvoip_call_control::transport::{CONTENT_TYPE_SDP, DialogId, Method, NameAddr, SipRequest, SipResponse, TransactionId};
use rvoip_call_control::{
    Call, CallControl, CallControlConfig, CallControlEvent, CallError, CallPeer, MediaDirection, MediaType, PeerId,
    PeerState, Result, SecurityAuthority, TransactionProvider,
};

pub const LOCAL_URI: &str = "sip:alice@example.com";
pub const REMOTE_URI: &str = "sip:bob@example.com";

/// Records everything the core sends
#[derive(Default)]
pub struct FakeTransport {
    requests: Mutex<Vec<SipRequest>>,
    responses: Mutex<Vec<SipResponse>>,
    branch: AtomicU64,
    pub fail_sends: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn requests(&self) -> Vec<SipRequest> {
        self.requests.lock().clone()
    }

    pub fn responses(&self) -> Vec<SipResponse> {
        self.responses.lock().clone()
    }

    pub fn requests_of(&self, method: Method) -> Vec<SipRequest> {
        self.requests().into_iter().filter(|r| r.method == method).collect()
    }

    pub fn last_request(&self, method: Method) -> Option<SipRequest> {
        self.requests_of(method).pop()
    }

    pub fn response_statuses(&self) -> Vec<u16> {
        self.responses().iter().map(|r| r.status).collect()
    }

    pub fn last_response(&self, status: u16) -> Option<SipResponse> {
        self.responses().into_iter().filter(|r| r.status == status).last()
    }
}

#[async_trait]
impl TransactionProvider for FakeTransport {
    async fn send_request(&self, request: SipRequest) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CallError::transport_failed("network unreachable"));
        }
        self.requests.lock().push(request);
        Ok(())
    }

    async fn send_response(&self, response: SipResponse) -> Result<()> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(CallError::transport_failed("network unreachable"));
        }
        self.responses.lock().push(response);
        Ok(())
    }

    fn new_branch(&self) -> TransactionId {
        let n = self.branch.fetch_add(1, Ordering::SeqCst);
        TransactionId(format!("z9hG4bK-test-{}", n))
    }
}

/// Media engine keeping streams in memory
pub struct FakeEngine {
    pub video_device: bool,
    pub audio_formats: Vec<MediaFormat>,
    next: AtomicU64,
    pub created: Mutex<Vec<StreamSpec>>,
    pub retargeted: Mutex<Vec<StreamSpec>>,
    pub started: Mutex<Vec<StreamHandle>>,
    pub closed: Mutex<Vec<StreamHandle>>,
    pub muted: Mutex<Vec<(StreamHandle, bool)>>,
    pub keyframes: Mutex<Vec<StreamHandle>>,
    gated: AtomicBool,
    pub stream_requested: Notify,
    stream_release: Notify,
}

impl FakeEngine {
    pub fn audio_only() -> Arc<Self> {
        Arc::new(Self::with_formats(vec![MediaFormat::pcmu(), MediaFormat::g722(), MediaFormat::opus()], false))
    }

    pub fn audio_video() -> Arc<Self> {
        Arc::new(Self::with_formats(vec![MediaFormat::pcmu(), MediaFormat::g722(), MediaFormat::opus()], true))
    }

    pub fn with_formats(audio_formats: Vec<MediaFormat>, video_device: bool) -> Self {
        Self {
            video_device,
            audio_formats,
            next: AtomicU64::new(1),
            created: Mutex::new(Vec::new()),
            retargeted: Mutex::new(Vec::new()),
            started: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            muted: Mutex::new(Vec::new()),
            keyframes: Mutex::new(Vec::new()),
            gated: AtomicBool::new(false),
            stream_requested: Notify::new(),
            stream_release: Notify::new(),
        }
    }

    /// Hold every `create_stream` until `release_streams` is called
    pub fn gate_streams(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release_streams(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.stream_release.notify_waiters();
    }

    pub fn created_count(&self) -> usize {
        self.created.lock().len()
    }
}

#[async_trait]
impl MediaEngine for FakeEngine {
    fn device(&self, media_type: MediaType) -> Option<MediaDevice> {
        match media_type {
            MediaType::Audio => Some(MediaDevice::new("default audio", media_type, MediaDirection::SendRecv)),
            MediaType::Video if self.video_device => {
                Some(MediaDevice::new("default camera", media_type, MediaDirection::SendRecv))
            }
            MediaType::Video => None,
        }
    }

    fn supported_formats(&self, media_type: MediaType) -> Vec<MediaFormat> {
        match media_type {
            MediaType::Audio => self.audio_formats.clone(),
            MediaType::Video => vec![MediaFormat::h264()],
        }
    }

    fn supported_extensions(&self, _media_type: MediaType) -> Vec<RtpExtension> {
        vec![RtpExtension::new(1, RtpExtension::AUDIO_LEVEL)]
    }

    fn local_target(&self, media_type: MediaType) -> SocketAddr {
        match media_type {
            MediaType::Audio => SocketAddr::from(([192, 0, 2, 1], 40000)),
            MediaType::Video => SocketAddr::from(([192, 0, 2, 1], 40002)),
        }
    }

    fn zrtp_hash(&self, _media_type: MediaType) -> Option<String> {
        None
    }

    async fn create_stream(&self, spec: StreamSpec) -> std::result::Result<StreamHandle, MediaError> {
        if self.gated.load(Ordering::SeqCst) {
            let released = self.stream_release.notified();
            self.stream_requested.notify_one();
            released.await;
        }
        let handle = StreamHandle(self.next.fetch_add(1, Ordering::SeqCst));
        self.created.lock().push(spec);
        Ok(handle)
    }

    async fn retarget_stream(&self, _handle: StreamHandle, spec: &StreamSpec) -> std::result::Result<(), MediaError> {
        self.retargeted.lock().push(spec.clone());
        Ok(())
    }

    async fn start_stream(&self, handle: StreamHandle) -> std::result::Result<(), MediaError> {
        self.started.lock().push(handle);
        Ok(())
    }

    async fn set_mute(&self, handle: StreamHandle, muted: bool) -> std::result::Result<(), MediaError> {
        self.muted.lock().push((handle, muted));
        Ok(())
    }

    async fn close_stream(&self, handle: StreamHandle) -> std::result::Result<(), MediaError> {
        self.closed.lock().push(handle);
        Ok(())
    }

    async fn request_keyframe(&self, handle: StreamHandle) -> std::result::Result<(), MediaError> {
        self.keyframes.lock().push(handle);
        Ok(())
    }
}

/// Adds a canned Authorization header, or refuses
pub struct FakeAuthority {
    pub refuse: bool,
}

#[async_trait]
impl SecurityAuthority for FakeAuthority {
    async fn authenticate(&self, challenge: &SipResponse, request: SipRequest) -> Result<SipRequest> {
        if self.refuse {
            return Err(CallError::authentication_failed("no credentials for realm"));
        }
        let header = if challenge.status == 407 { "Proxy-Authorization" } else { "Authorization" };
        Ok(request.with_header(header, "Digest username=\"alice\", response=\"0123\""))
    }
}

pub fn config() -> CallControlConfig {
    CallControlConfig::new(LOCAL_URI)
}

pub fn control(transport: &Arc<FakeTransport>, engine: &Arc<FakeEngine>) -> CallControl {
    control_with(config(), transport, engine)
}

pub fn control_with(config: CallControlConfig, transport: &Arc<FakeTransport>, engine: &Arc<FakeEngine>) -> CallControl {
    CallControl::builder(config)
        .with_transport(transport.clone())
        .with_media_engine(engine.clone())
        .build()
        .expect("valid test configuration")
}

/// A remote description with one audio line
pub fn audio_sdp(formats: &str, rtpmaps: &[&str], direction: &str) -> String {
    let mut sdp = String::from(
        "v=0\r\no=- 4242 1 IN IP4 198.51.100.7\r\ns=-\r\nc=IN IP4 198.51.100.7\r\nt=0 0\r\n",
    );
    sdp.push_str(&format!("m=audio 5004 RTP/AVP {}\r\n", formats));
    for rtpmap in rtpmaps {
        sdp.push_str(&format!("a=rtpmap:{}\r\n", rtpmap));
    }
    sdp.push_str(&format!("a={}\r\n", direction));
    sdp
}

/// Remote offer/answer with PCMU only
pub fn pcmu_sdp(direction: &str) -> String {
    audio_sdp("0", &["0 PCMU/8000"], direction)
}

/// Inbound INVITE as the provider would deliver it
pub fn inbound_invite(sdp: Option<String>) -> SipRequest {
    let dialog = DialogId::new(uuid::Uuid::new_v4().to_string(), "ourtag").with_remote_tag("theirtag");
    let request = SipRequest::new(
        Method::Invite,
        TransactionId(format!("z9hG4bK-remote-{}", uuid::Uuid::new_v4().simple())),
        dialog,
        NameAddr::new(REMOTE_URI),
        NameAddr::new(LOCAL_URI),
        1,
    )
    .with_contact(NameAddr::new("sip:bob@198.51.100.7:5060"));
    match sdp {
        Some(sdp) => request.with_body(CONTENT_TYPE_SDP, sdp),
        None => request,
    }
}

/// In-dialog request from the remote side, following `invite`
pub fn inbound_in_dialog(invite: &SipRequest, method: Method, cseq: u32) -> SipRequest {
    SipRequest::new(
        method,
        TransactionId(format!("z9hG4bK-remote-{}", uuid::Uuid::new_v4().simple())),
        invite.dialog.clone(),
        invite.from.clone(),
        invite.to.clone(),
        cseq,
    )
}

/// Response from the remote side to one of our requests
pub fn response_to(request: &SipRequest, status: u16, reason: &str) -> SipResponse {
    let mut response = SipResponse::to_request(request, status, reason);
    response.dialog = request.dialog.clone().with_remote_tag("remote-tag");
    response
}

pub fn sdp_response_to(request: &SipRequest, status: u16, sdp: String) -> SipResponse {
    response_to(request, status, "OK")
        .with_contact(NameAddr::new("sip:bob@198.51.100.7:5060"))
        .with_body(CONTENT_TYPE_SDP, sdp)
}

/// Wait for a peer to reach `state`, failing after a second
pub async fn wait_for_state(
    events: &mut broadcast::Receiver<CallControlEvent>,
    peer_id: &PeerId,
    state: PeerState,
) {
    let waited = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            match events.recv().await {
                Ok(CallControlEvent::PeerStateChanged(change))
                    if change.peer_id == *peer_id && change.new_state == state =>
                {
                    return;
                }
                Ok(_) => {}
                Err(e) => panic!("event stream ended: {e}"),
            }
        }
    })
    .await;
    assert!(waited.is_ok(), "peer never reached {state}");
}

/// Wait until the transport has sent a request matching `pred`
pub async fn wait_for_request(
    transport: &FakeTransport,
    method: Method,
    pred: impl Fn(&SipRequest) -> bool,
) -> SipRequest {
    let found = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if let Some(request) = transport.requests_of(method.clone()).into_iter().find(|r| pred(r)) {
                return request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    found.unwrap_or_else(|_| panic!("no matching {method} was sent"))
}

/// The INVITE that opened `peer`'s dialog, as last sent
pub fn invite_of(transport: &FakeTransport, peer: &CallPeer) -> SipRequest {
    let call_id = peer.dialog().call_id;
    transport
        .requests_of(Method::Invite)
        .into_iter()
        .filter(|r| r.dialog.call_id == call_id)
        .last()
        .expect("peer sent an INVITE")
}

/// The peer created for an inbound request's dialog
pub fn peer_for(control: &CallControl, request: &SipRequest) -> Arc<CallPeer> {
    control
        .active_calls()
        .iter()
        .flat_map(|c| c.peers())
        .find(|p| p.dialog().call_id == request.dialog.call_id)
        .expect("peer registered for dialog")
}

/// Outbound call answered with PCMU
pub async fn establish_outbound(control: &CallControl, transport: &FakeTransport) -> (Arc<Call>, Arc<CallPeer>) {
    let (call, peer) = control.create_outgoing_call(REMOTE_URI).await.expect("call placed");
    let invite = invite_of(transport, &peer);
    control.handle_response(sdp_response_to(&invite, 200, pcmu_sdp("sendrecv"))).await;
    assert_eq!(peer.state(), PeerState::Connected);
    (call, peer)
}

/// Inbound call answered and confirmed by ACK
pub async fn establish_inbound(control: &CallControl, sdp: String) -> (SipRequest, Arc<CallPeer>) {
    let invite = inbound_invite(Some(sdp));
    control.handle_request(invite.clone()).await.expect("INVITE handled");
    let peer = peer_for(control, &invite);
    control.answer(peer.id()).await.expect("answered");
    control
        .handle_request(inbound_in_dialog(&invite, Method::Ack, 1))
        .await
        .expect("ACK handled");
    assert_eq!(peer.state(), PeerState::Connected);
    (invite, peer)
}
