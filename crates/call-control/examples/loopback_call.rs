//! Two call-control instances wired back to back in one process.
//!
//! Alice calls Bob, Bob answers, Alice puts the call on hold and resumes
//! it, then hangs up. Every SIP message crosses an in-memory link that
//! flips dialog tags the way a real transaction layer would.
//!
//! ```text
//! RUST_LOG=rvoip_call_control=debug cargo run --example loopback_call
//! ```

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::sleep;

use rvoip_call_control::transport::{DialogId, SipRequest, SipResponse, TransactionId, TransactionProvider};
use rvoip_call_control::{
    CallControl, CallControlConfig, CallControlEvent, MediaDevice, MediaDirection, MediaEngine, MediaError,
    MediaFormat, MediaType, PeerState, Result, RtpExtension, StreamHandle, StreamSpec,
};

enum Message {
    Request(SipRequest),
    Response(SipResponse),
}

/// Tags handed out by the answering side of each dialog
type TagBook = Arc<Mutex<HashMap<(String, String), String>>>;

/// One direction of the in-memory link
struct LoopbackTransport {
    name: &'static str,
    outbox: mpsc::UnboundedSender<Message>,
    tags: TagBook,
    branch: AtomicU64,
}

impl LoopbackTransport {
    /// The same dialog as the other side sees it
    fn flip(&self, dialog: &DialogId) -> DialogId {
        let remote = dialog.remote_tag.clone().unwrap_or_else(|| {
            self.tags
                .lock()
                .entry((dialog.call_id.clone(), dialog.local_tag.clone()))
                .or_insert_with(|| format!("{:08x}", rand::random::<u32>()))
                .clone()
        });
        DialogId::new(dialog.call_id.clone(), remote).with_remote_tag(dialog.local_tag.clone())
    }

    fn deliver(&self, message: Message) -> Result<()> {
        self.outbox
            .send(message)
            .map_err(|_| rvoip_call_control::CallError::transport_failed("link closed"))
    }
}

#[async_trait]
impl TransactionProvider for LoopbackTransport {
    async fn send_request(&self, mut request: SipRequest) -> Result<()> {
        tracing::debug!(side = self.name, method = %request.method, "→ request");
        request.dialog = self.flip(&request.dialog);
        self.deliver(Message::Request(request))
    }

    async fn send_response(&self, mut response: SipResponse) -> Result<()> {
        tracing::debug!(side = self.name, status = response.status, "→ response");
        response.dialog = self.flip(&response.dialog);
        self.deliver(Message::Response(response))
    }

    fn new_branch(&self) -> TransactionId {
        let n = self.branch.fetch_add(1, Ordering::Relaxed);
        TransactionId(format!("z9hG4bK-{}-{}", self.name, n))
    }
}

/// Media engine that only logs what it is asked to do
struct LoggingEngine {
    name: &'static str,
    port: u16,
    next: AtomicU64,
}

#[async_trait]
impl MediaEngine for LoggingEngine {
    fn device(&self, media_type: MediaType) -> Option<MediaDevice> {
        match media_type {
            MediaType::Audio => Some(MediaDevice::new("loopback", media_type, MediaDirection::SendRecv)),
            MediaType::Video => None,
        }
    }

    fn supported_formats(&self, _media_type: MediaType) -> Vec<MediaFormat> {
        vec![MediaFormat::opus(), MediaFormat::pcmu()]
    }

    fn supported_extensions(&self, _media_type: MediaType) -> Vec<RtpExtension> {
        vec![RtpExtension::new(1, RtpExtension::AUDIO_LEVEL)]
    }

    fn local_target(&self, _media_type: MediaType) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], self.port))
    }

    fn zrtp_hash(&self, _media_type: MediaType) -> Option<String> {
        None
    }

    async fn create_stream(&self, spec: StreamSpec) -> std::result::Result<StreamHandle, MediaError> {
        let handle = StreamHandle(self.next.fetch_add(1, Ordering::Relaxed));
        tracing::info!(side = self.name, format = %spec.format, target = ?spec.target, direction = ?spec.direction, "🎵 stream created");
        Ok(handle)
    }

    async fn retarget_stream(&self, _handle: StreamHandle, spec: &StreamSpec) -> std::result::Result<(), MediaError> {
        tracing::info!(side = self.name, direction = ?spec.direction, "🔁 stream updated");
        Ok(())
    }

    async fn start_stream(&self, _handle: StreamHandle) -> std::result::Result<(), MediaError> {
        tracing::info!(side = self.name, "▶️ stream started");
        Ok(())
    }

    async fn set_mute(&self, _handle: StreamHandle, _muted: bool) -> std::result::Result<(), MediaError> {
        Ok(())
    }

    async fn close_stream(&self, _handle: StreamHandle) -> std::result::Result<(), MediaError> {
        tracing::info!(side = self.name, "⏹️ stream closed");
        Ok(())
    }

    async fn request_keyframe(&self, _handle: StreamHandle) -> std::result::Result<(), MediaError> {
        Ok(())
    }
}

/// Feed everything arriving on `inbox` into `control`, in order
fn pump(control: CallControl, mut inbox: mpsc::UnboundedReceiver<Message>) {
    tokio::spawn(async move {
        while let Some(message) = inbox.recv().await {
            match message {
                Message::Request(request) => {
                    if let Err(e) = control.handle_request(request).await {
                        tracing::warn!(error = %e, "request handling failed");
                    }
                }
                Message::Response(response) => control.handle_response(response).await,
            }
        }
    });
}

fn endpoint(
    name: &'static str,
    uri: &str,
    port: u16,
    outbox: mpsc::UnboundedSender<Message>,
    tags: TagBook,
) -> Result<CallControl> {
    let transport = Arc::new(LoopbackTransport { name, outbox, tags, branch: AtomicU64::new(1) });
    let engine = Arc::new(LoggingEngine { name, port, next: AtomicU64::new(1) });
    CallControl::builder(CallControlConfig::new(uri).with_display_name(name))
        .with_transport(transport)
        .with_media_engine(engine)
        .build()
}

async fn wait_until(control: &CallControl, peer: &rvoip_call_control::PeerId, state: PeerState) {
    for _ in 0..100 {
        match control.peer(peer) {
            Some(p) if p.state() == state => return,
            None if state.is_terminal() => return,
            _ => sleep(Duration::from_millis(10)).await,
        }
    }
    tracing::warn!(peer = %peer, expected = %state, "state not reached");
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let (to_bob, bob_inbox) = mpsc::unbounded_channel();
    let (to_alice, alice_inbox) = mpsc::unbounded_channel();
    let tags = TagBook::default();

    let alice = endpoint("alice", "sip:alice@127.0.0.1", 40000, to_bob, tags.clone())?;
    let bob = endpoint("bob", "sip:bob@127.0.0.1", 42000, to_alice, tags)?;
    pump(alice.clone(), alice_inbox);
    pump(bob.clone(), bob_inbox);

    // Bob answers whatever rings
    let mut bob_events = bob.subscribe();
    let answering = bob.clone();
    tokio::spawn(async move {
        while let Ok(event) = bob_events.recv().await {
            if let CallControlEvent::IncomingCall { peer_id, from, .. } = event {
                tracing::info!("📞 bob: incoming call from {}", from);
                if let Err(e) = answering.answer(&peer_id).await {
                    tracing::warn!(error = %e, "answer failed");
                }
            }
        }
    });

    tracing::info!("📞 alice: calling bob");
    let (_call, peer) = alice.create_outgoing_call("sip:bob@127.0.0.1").await?;
    wait_until(&alice, peer.id(), PeerState::Connected).await;
    tracing::info!("✅ call connected");

    alice.put_on_hold(peer.id(), true).await?;
    wait_until(&alice, peer.id(), PeerState::OnHoldLocally).await;
    tracing::info!("⏸️ on hold");

    alice.put_on_hold(peer.id(), false).await?;
    wait_until(&alice, peer.id(), PeerState::Connected).await;
    tracing::info!("▶️ resumed");

    alice.hangup(peer.id()).await?;
    sleep(Duration::from_millis(100)).await;
    tracing::info!(alice = ?alice.stats(), bob = ?bob.stats(), "👋 done");

    alice.shutdown().await;
    bob.shutdown().await;
    Ok(())
}
