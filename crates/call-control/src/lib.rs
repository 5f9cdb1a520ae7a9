//! # RVoIP Call Control
//!
//! Call-control core of a SIP user agent: the per-peer call state machine,
//! the SDP offer/answer engine, and the dispatch layer that routes protocol
//! events to peers, answers authentication challenges, retries 491s and
//! coordinates REFER transfers.
//!
//! The crate sits between two collaborators it only knows as traits:
//!
//! - [`TransactionProvider`]: the SIP transaction/dialog stack (wire
//!   parsing, retransmissions, transaction matching)
//! - [`MediaEngine`]: devices, codecs and RTP streams
//!
//! ## Architecture
//!
//! - `sdp`: session description model and parser
//! - `negotiation`: offer/answer engine ([`MediaHandler`])
//! - `peer`: call peer state machine ([`CallPeer`], [`PeerState`])
//! - `call`, `registry`: calls and the active-call registry
//! - `dispatch`: [`CallControl`], auth and 491 retry, transfers
//! - `config`, `errors`, `events`: configuration, error types, notifications

pub mod call;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod events;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod registry;
pub mod sdp;
pub mod transport;
pub mod types;

pub use call::{Call, CallState};
pub use config::{CallControlConfig, MediaPolicy, RejectPolicy, RetryPolicy, SecureTransportPolicy, SecurityConfig};
pub use dispatch::auth::{AccountControl, SecurityAuthority};
pub use dispatch::transfer::{Replaces, TransferAuthority};
pub use dispatch::{CallControl, CallControlBuilder, DisplayNameResolver};
pub use errors::{CallError, NegotiationFailure, Result};
pub use events::{CallControlEvent, EventPublisher, PeerStateEvent};
pub use media::{MediaDevice, MediaEngine, MediaError, MediaFormat, RtpExtension, StreamHandle, StreamSpec};
pub use negotiation::MediaHandler;
pub use peer::{CallDirection, CallPeer, PeerState};
pub use registry::ActiveCallRegistry;
pub use sdp::SessionDescription;
pub use transport::{DialogId, Method, NameAddr, SipRequest, SipResponse, TransactionId, TransactionProvider};
pub use types::{CallId, MediaDirection, MediaType, PeerId};
