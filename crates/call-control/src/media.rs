//! Media engine boundary
//!
//! The call-control core never captures, encodes or transports media itself.
//! It consumes a [`MediaEngine`] that reports device capability and supported
//! formats per media type, and creates, re-targets, starts and closes streams
//! from a [`StreamSpec`] produced by the negotiation engine.

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;
use nom::{
    IResult,
    bytes::complete::take_while1,
    character::complete::{char, digit1, space1},
    combinator::{map_res, opt},
    sequence::preceded,
};
use thiserror::Error;

use crate::types::{MediaDirection, MediaType};

/// Errors reported by the media engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    #[error("no device available for {0}")]
    NoDevice(MediaType),

    #[error("stream creation failed: {0}")]
    StreamCreation(String),

    #[error("unknown stream {0}")]
    UnknownStream(StreamHandle),

    #[error("media engine error: {0}")]
    Engine(String),
}

/// A payload format (codec) as negotiated in SDP
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaFormat {
    /// RTP payload type
    pub payload_type: u8,
    /// Encoding name (`PCMU`, `opus`, `H264`, ...)
    pub encoding: String,
    /// Clock rate in Hz
    pub clock_rate: u32,
    /// Channel count for audio, when not 1
    pub channels: Option<u8>,
    /// Format parameters (`a=fmtp`)
    pub fmtp: Option<String>,
}

impl MediaFormat {
    pub fn new(payload_type: u8, encoding: impl Into<String>, clock_rate: u32) -> Self {
        Self {
            payload_type,
            encoding: encoding.into(),
            clock_rate,
            channels: None,
            fmtp: None,
        }
    }

    pub fn with_channels(mut self, channels: u8) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn with_fmtp(mut self, fmtp: impl Into<String>) -> Self {
        self.fmtp = Some(fmtp.into());
        self
    }

    pub fn pcmu() -> Self {
        Self::new(0, "PCMU", 8000)
    }

    pub fn pcma() -> Self {
        Self::new(8, "PCMA", 8000)
    }

    pub fn g722() -> Self {
        Self::new(9, "G722", 8000)
    }

    pub fn opus() -> Self {
        Self::new(111, "opus", 48000).with_channels(2)
    }

    pub fn h264() -> Self {
        Self::new(99, "H264", 90000).with_fmtp("profile-level-id=42801f;packetization-mode=1")
    }

    /// Formats bound to static payload types (RFC 3551) that may be offered
    /// without an `a=rtpmap` line.
    pub fn from_static_payload(payload_type: u8) -> Option<Self> {
        let (encoding, clock_rate) = match payload_type {
            0 => ("PCMU", 8000),
            3 => ("GSM", 8000),
            4 => ("G723", 8000),
            8 => ("PCMA", 8000),
            9 => ("G722", 8000),
            18 => ("G729", 8000),
            26 => ("JPEG", 90000),
            31 => ("H261", 90000),
            34 => ("H263", 90000),
            _ => return None,
        };
        Some(Self::new(payload_type, encoding, clock_rate))
    }

    /// Same codec, regardless of payload type and format parameters
    pub fn same_codec(&self, other: &MediaFormat) -> bool {
        self.encoding.eq_ignore_ascii_case(&other.encoding)
            && self.clock_rate == other.clock_rate
            && self.channels.unwrap_or(1) == other.channels.unwrap_or(1)
    }

    /// Whether the payload type is in the dynamic range
    pub fn is_dynamic(&self) -> bool {
        self.payload_type >= 96
    }

    /// `a=rtpmap` value without the payload type
    pub fn rtpmap(&self) -> String {
        match self.channels {
            Some(ch) if ch != 1 => format!("{}/{}/{}", self.encoding, self.clock_rate, ch),
            _ => format!("{}/{}", self.encoding, self.clock_rate),
        }
    }

    /// Build from a payload type and its `a=rtpmap` value (`opus/48000/2`)
    pub fn from_rtpmap(payload_type: u8, rtpmap: &str) -> Option<Self> {
        let mut parts = rtpmap.trim().split('/');
        let encoding = parts.next().filter(|e| !e.is_empty())?;
        let clock_rate = parts.next()?.parse().ok()?;
        let channels = parts.next().and_then(|c| c.parse().ok()).filter(|c| *c != 1);
        Some(Self {
            payload_type,
            encoding: encoding.to_string(),
            clock_rate,
            channels,
            fmtp: None,
        })
    }
}

impl fmt::Display for MediaFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.rtpmap(), self.payload_type)
    }
}

/// A capture/render device for one media type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDevice {
    pub name: String,
    pub media_type: MediaType,
    /// What the device can do (a camera-only device is `SendOnly`)
    pub direction: MediaDirection,
}

impl MediaDevice {
    pub fn new(name: impl Into<String>, media_type: MediaType, direction: MediaDirection) -> Self {
        Self { name: name.into(), media_type, direction }
    }
}

/// RTP header extension (`a=extmap`, RFC 8285)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtpExtension {
    pub id: u16,
    pub direction: Option<MediaDirection>,
    pub uri: String,
}

impl RtpExtension {
    pub const AUDIO_LEVEL: &'static str = "urn:ietf:params:rtp-hdrext:ssrc-audio-level";
    pub const ABS_SEND_TIME: &'static str =
        "http://www.webrtc.org/experiments/rtp-hdrext/abs-send-time";

    pub fn new(id: u16, uri: impl Into<String>) -> Self {
        Self { id, direction: None, uri: uri.into() }
    }

    /// Parse the value of an `a=extmap` attribute: `<id>[/<direction>] <uri> [params]`
    pub fn parse(value: &str) -> Option<Self> {
        fn extmap(input: &str) -> IResult<&str, (u16, Option<&str>, &str)> {
            let (input, id) = map_res(digit1, str::parse::<u16>)(input)?;
            let (input, dir) = opt(preceded(char('/'), take_while1(|c: char| c.is_ascii_alphabetic())))(input)?;
            let (input, _) = space1(input)?;
            let (input, uri) = take_while1(|c: char| !c.is_ascii_whitespace())(input)?;
            Ok((input, (id, dir, uri)))
        }

        let (_, (id, dir, uri)) = extmap(value.trim()).ok()?;
        if !(1..=255).contains(&id) {
            return None;
        }
        let direction = match dir {
            Some(d) => Some(MediaDirection::from_sdp(d)?),
            None => None,
        };
        Some(Self { id, direction, uri: uri.to_string() })
    }

    pub fn to_sdp_value(&self) -> String {
        match self.direction {
            Some(d) => format!("{}/{} {}", self.id, d.as_sdp(), self.uri),
            None => format!("{} {}", self.id, self.uri),
        }
    }
}

/// Keying material handed to the engine for an SRTP stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamKeying {
    Sdes {
        suite: String,
        local_key: String,
        remote_key: String,
    },
    Zrtp {
        remote_hash: Option<String>,
    },
}

/// Everything the media engine needs to create or update a stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub media_type: MediaType,
    pub device: String,
    pub format: MediaFormat,
    pub target: Option<SocketAddr>,
    pub direction: MediaDirection,
    pub extensions: Vec<RtpExtension>,
    /// Master stream of the call, used for synchronization
    pub master: bool,
    pub keying: Option<StreamKeying>,
}

/// Opaque handle to an engine stream
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq)]
pub struct StreamHandle(pub u64);

impl fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// The media engine consumed by the negotiation engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Active device for a media type, if any
    fn device(&self, media_type: MediaType) -> Option<MediaDevice>;

    /// Supported formats in local preference order
    fn supported_formats(&self, media_type: MediaType) -> Vec<MediaFormat>;

    /// Supported RTP header extensions
    fn supported_extensions(&self, media_type: MediaType) -> Vec<RtpExtension>;

    /// Local RTP address advertised in descriptions
    fn local_target(&self, media_type: MediaType) -> SocketAddr;

    /// Local ZRTP hello hash, when the engine implements ZRTP
    fn zrtp_hash(&self, media_type: MediaType) -> Option<String>;

    async fn create_stream(&self, spec: StreamSpec) -> Result<StreamHandle, MediaError>;

    /// Update an existing stream in place (target, direction, keys)
    async fn retarget_stream(&self, handle: StreamHandle, spec: &StreamSpec) -> Result<(), MediaError>;

    async fn start_stream(&self, handle: StreamHandle) -> Result<(), MediaError>;

    async fn set_mute(&self, handle: StreamHandle, muted: bool) -> Result<(), MediaError>;

    async fn close_stream(&self, handle: StreamHandle) -> Result<(), MediaError>;

    async fn request_keyframe(&self, handle: StreamHandle) -> Result<(), MediaError>;
}
