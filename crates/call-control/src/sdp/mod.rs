//! Structured session descriptions
//!
//! This is the boundary to the session description codec: a small structured
//! model of an SDP body, a tolerant nom-based parser ([`parser`]) and a
//! `Display` serializer. The negotiation engine only reads and writes this
//! model; it never touches SDP text directly.
//!
//! ```text
//! v=0
//! o=- 4711 1 IN IP4 192.0.2.10
//! s=-
//! c=IN IP4 192.0.2.10
//! t=0 0
//! m=audio 5004 RTP/AVP 0 8 101
//! a=rtpmap:101 telephone-event/8000
//! a=sendrecv
//! ```

pub mod parser;

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use thiserror::Error;

use crate::types::MediaDirection;

pub use parser::parse_session_description;

/// Errors raised while parsing a session description
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SdpError {
    #[error("missing v= line")]
    MissingVersion,

    #[error("invalid {line_type}= line: {line}")]
    InvalidLine { line_type: char, line: String },

    #[error("invalid media port: {0}")]
    InvalidPort(String),
}

/// `o=` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Origin {
    pub username: String,
    pub session_id: u64,
    pub session_version: u64,
    pub address: String,
}

impl Origin {
    pub fn new(session_id: u64, address: impl Into<String>) -> Self {
        Self {
            username: "-".to_string(),
            session_id,
            session_version: 1,
            address: address.into(),
        }
    }
}

/// `c=` line (network type is always `IN`)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Connection {
    pub address: String,
}

impl Connection {
    pub fn new(address: impl Into<String>) -> Self {
        Self { address: address.into() }
    }

    fn addr_type(&self) -> &'static str {
        if self.address.contains(':') { "IP6" } else { "IP4" }
    }
}

/// `a=` line; property attributes have no value
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub name: String,
    pub value: Option<String>,
}

impl Attribute {
    pub fn property(name: impl Into<String>) -> Self {
        Self { name: name.into(), value: None }
    }

    pub fn value(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: Some(value.into()) }
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(v) => write!(f, "a={}:{}", self.name, v),
            None => write!(f, "a={}", self.name),
        }
    }
}

/// One `m=` section
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaDescription {
    pub media: String,
    pub port: u16,
    pub protocol: String,
    pub formats: Vec<String>,
    pub connection: Option<Connection>,
    pub attributes: Vec<Attribute>,
}

impl MediaDescription {
    pub fn new(media: impl Into<String>, port: u16, protocol: impl Into<String>) -> Self {
        Self {
            media: media.into(),
            port,
            protocol: protocol.into(),
            formats: Vec::new(),
            connection: None,
            attributes: Vec::new(),
        }
    }

    /// Disabling answer for a rejected line: same media and protocol, port 0.
    pub fn disabled_from(offer: &MediaDescription) -> Self {
        let mut md = Self::new(offer.media.clone(), 0, offer.protocol.clone());
        // RFC 3264 requires at least one format even on a rejected line
        md.formats = offer.formats.iter().take(1).cloned().collect();
        if md.formats.is_empty() {
            md.formats.push("0".to_string());
        }
        md
    }

    pub fn is_disabled(&self) -> bool {
        self.port == 0
    }

    pub fn push_attribute(&mut self, attribute: Attribute) {
        self.attributes.push(attribute);
    }

    /// First value of the named attribute
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.name.eq_ignore_ascii_case(name))
            .and_then(|a| a.value.as_deref())
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name.eq_ignore_ascii_case(name))
    }

    /// All values of the named attribute, in order
    pub fn attributes_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.attributes
            .iter()
            .filter(move |a| a.name.eq_ignore_ascii_case(name))
            .filter_map(|a| a.value.as_deref())
    }

    /// Media-level direction attribute, if present
    pub fn direction(&self) -> Option<MediaDirection> {
        self.attributes
            .iter()
            .filter(|a| a.value.is_none())
            .find_map(|a| MediaDirection::from_sdp(&a.name))
    }

    /// Replace any direction attribute with `direction`
    pub fn set_direction(&mut self, direction: MediaDirection) {
        self.attributes
            .retain(|a| !(a.value.is_none() && MediaDirection::from_sdp(&a.name).is_some()));
        self.attributes.push(Attribute::property(direction.as_sdp()));
    }

    /// `a=rtpmap` value for a payload type
    pub fn rtpmap(&self, payload_type: &str) -> Option<&str> {
        self.lookup_by_payload("rtpmap", payload_type)
    }

    /// `a=fmtp` value for a payload type
    pub fn fmtp(&self, payload_type: &str) -> Option<&str> {
        self.lookup_by_payload("fmtp", payload_type)
    }

    fn lookup_by_payload<'a>(&'a self, name: &'a str, payload_type: &str) -> Option<&'a str> {
        self.attributes_named(name).find_map(|v| {
            let (pt, rest) = v.split_once(' ')?;
            (pt == payload_type).then(|| rest.trim())
        })
    }
}

impl fmt::Display for MediaDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m={} {} {}", self.media, self.port, self.protocol)?;
        for fmt_token in &self.formats {
            write!(f, " {}", fmt_token)?;
        }
        f.write_str("\r\n")?;
        if let Some(c) = &self.connection {
            write!(f, "c=IN {} {}\r\n", c.addr_type(), c.address)?;
        }
        for a in &self.attributes {
            write!(f, "{}\r\n", a)?;
        }
        Ok(())
    }
}

/// A complete session description
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescription {
    pub origin: Origin,
    pub session_name: String,
    pub connection: Option<Connection>,
    pub attributes: Vec<Attribute>,
    pub media: Vec<MediaDescription>,
}

impl SessionDescription {
    pub fn new(origin: Origin) -> Self {
        let connection = Some(Connection::new(origin.address.clone()));
        Self {
            origin,
            session_name: "-".to_string(),
            connection,
            attributes: Vec::new(),
            media: Vec::new(),
        }
    }

    pub fn parse(text: &str) -> Result<Self, SdpError> {
        parse_session_description(text)
    }

    /// Session-level direction attribute, if present
    pub fn direction(&self) -> Option<MediaDirection> {
        self.attributes
            .iter()
            .filter(|a| a.value.is_none())
            .find_map(|a| MediaDirection::from_sdp(&a.name))
    }

    /// Direction of a media line, falling back to session level, then `sendrecv`.
    pub fn effective_direction(&self, md: &MediaDescription) -> MediaDirection {
        md.direction().or_else(|| self.direction()).unwrap_or_default()
    }

    /// RTP target of a media line (media-level `c=` wins over session level)
    pub fn target(&self, md: &MediaDescription) -> Option<SocketAddr> {
        let conn = md.connection.as_ref().or(self.connection.as_ref())?;
        let ip: IpAddr = conn.address.parse().ok()?;
        Some(SocketAddr::new(ip, md.port))
    }

    pub fn has_session_attribute(&self, name: &str) -> bool {
        self.attributes.iter().any(|a| a.name.eq_ignore_ascii_case(name))
    }
}

impl fmt::Display for SessionDescription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("v=0\r\n")?;
        let o = &self.origin;
        let addr_type = if o.address.contains(':') { "IP6" } else { "IP4" };
        write!(
            f,
            "o={} {} {} IN {} {}\r\n",
            o.username, o.session_id, o.session_version, addr_type, o.address
        )?;
        write!(f, "s={}\r\n", self.session_name)?;
        if let Some(c) = &self.connection {
            write!(f, "c=IN {} {}\r\n", c.addr_type(), c.address)?;
        }
        f.write_str("t=0 0\r\n")?;
        for a in &self.attributes {
            write!(f, "{}\r\n", a)?;
        }
        for m in &self.media {
            write!(f, "{}", m)?;
        }
        Ok(())
    }
}
