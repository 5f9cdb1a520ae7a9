//! Core identifiers and value types shared by every layer of the call-control core.
//!
//! The negotiation engine, the peer state machine and the dispatch layer all
//! speak in terms of these types, so they live in one place.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier of a logical call
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CallId(pub String);

impl CallId {
    pub fn new() -> Self {
        Self(format!("call-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of a call peer (one remote party of a call)
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct PeerId(pub String);

impl PeerId {
    pub fn new() -> Self {
        Self(format!("peer-{}", uuid::Uuid::new_v4()))
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Media types the negotiation engine understands.
///
/// The declaration order is the fixed enumeration order used when building
/// offers: audio first, then video.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub enum MediaType {
    Audio,
    Video,
}

impl MediaType {
    /// All media types in offer order
    pub const ALL: [MediaType; 2] = [MediaType::Audio, MediaType::Video];

    /// Map an SDP `m=` media token; anything else (text, application, ...) is unsupported.
    pub fn from_sdp(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "audio" => Some(MediaType::Audio),
            "video" => Some(MediaType::Video),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MediaType::Audio => "audio",
            MediaType::Video => "video",
        }
    }
}

impl fmt::Display for MediaType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Media direction as a two-bit lattice.
///
/// `SendRecv` is the top element, `Inactive` the bottom; `SendOnly` and
/// `RecvOnly` are incomparable. [`MediaDirection::and`] is the meet.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaDirection {
    SendRecv,
    SendOnly,
    RecvOnly,
    Inactive,
}

impl MediaDirection {
    const SEND: u8 = 0b01;
    const RECV: u8 = 0b10;

    fn bits(self) -> u8 {
        match self {
            MediaDirection::SendRecv => Self::SEND | Self::RECV,
            MediaDirection::SendOnly => Self::SEND,
            MediaDirection::RecvOnly => Self::RECV,
            MediaDirection::Inactive => 0,
        }
    }

    fn from_bits(bits: u8) -> Self {
        match bits & (Self::SEND | Self::RECV) {
            b if b == Self::SEND | Self::RECV => MediaDirection::SendRecv,
            b if b == Self::SEND => MediaDirection::SendOnly,
            b if b == Self::RECV => MediaDirection::RecvOnly,
            _ => MediaDirection::Inactive,
        }
    }

    /// Meet of two directions (commutative, `Inactive` absorbs)
    pub fn and(self, other: MediaDirection) -> MediaDirection {
        Self::from_bits(self.bits() & other.bits())
    }

    /// Join of two directions
    pub fn or(self, other: MediaDirection) -> MediaDirection {
        Self::from_bits(self.bits() | other.bits())
    }

    /// The same flow seen from the other end of the stream
    pub fn reverse(self) -> MediaDirection {
        match self {
            MediaDirection::SendOnly => MediaDirection::RecvOnly,
            MediaDirection::RecvOnly => MediaDirection::SendOnly,
            other => other,
        }
    }

    pub fn allows_sending(self) -> bool {
        self.bits() & Self::SEND != 0
    }

    pub fn allows_receiving(self) -> bool {
        self.bits() & Self::RECV != 0
    }

    /// SDP attribute name (`a=sendrecv` etc.)
    pub fn as_sdp(&self) -> &'static str {
        match self {
            MediaDirection::SendRecv => "sendrecv",
            MediaDirection::SendOnly => "sendonly",
            MediaDirection::RecvOnly => "recvonly",
            MediaDirection::Inactive => "inactive",
        }
    }

    pub fn from_sdp(name: &str) -> Option<Self> {
        match name {
            "sendrecv" => Some(MediaDirection::SendRecv),
            "sendonly" => Some(MediaDirection::SendOnly),
            "recvonly" => Some(MediaDirection::RecvOnly),
            "inactive" => Some(MediaDirection::Inactive),
            _ => None,
        }
    }
}

impl Default for MediaDirection {
    fn default() -> Self {
        MediaDirection::SendRecv
    }
}

impl fmt::Display for MediaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sdp())
    }
}

/// Media keying protocols a security control can implement
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum SrtpProtocol {
    Sdes,
    Zrtp,
}

/// RTP transport profile of an `m=` line
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub enum TransportProfile {
    /// `RTP/AVP`
    Plain,
    /// `RTP/SAVP`
    Secure,
}

impl TransportProfile {
    pub fn as_sdp(&self) -> &'static str {
        match self {
            TransportProfile::Plain => "RTP/AVP",
            TransportProfile::Secure => "RTP/SAVP",
        }
    }

    /// Feedback variants (`RTP/AVPF`, `RTP/SAVPF`) fold into their base profile.
    pub fn from_sdp(proto: &str) -> Option<Self> {
        match proto.to_ascii_uppercase().as_str() {
            "RTP/AVP" | "RTP/AVPF" => Some(TransportProfile::Plain),
            "RTP/SAVP" | "RTP/SAVPF" => Some(TransportProfile::Secure),
            _ => None,
        }
    }
}
