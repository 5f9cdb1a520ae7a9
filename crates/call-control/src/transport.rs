//! Transaction/dialog provider boundary
//!
//! Wire-level SIP parsing, retransmission and transaction matching belong to
//! the provider. The core sees already-correlated requests and responses,
//! each carrying its transaction id and the dialog it belongs to, seen from
//! the local side (local tag = our tag).
//!
//! Provider → core: [`crate::CallControl::handle_request`],
//! [`crate::CallControl::handle_response`], [`crate::CallControl::handle_timeout`].
//! Core → provider: [`TransactionProvider`].

use std::fmt;

use async_trait::async_trait;

use crate::errors::Result;

/// SIP methods the core sends or handles
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub enum Method {
    Invite,
    Ack,
    Bye,
    Cancel,
    Refer,
    Notify,
    Info,
    Update,
    Options,
    Other(String),
}

impl Method {
    pub fn as_str(&self) -> &str {
        match self {
            Method::Invite => "INVITE",
            Method::Ack => "ACK",
            Method::Bye => "BYE",
            Method::Cancel => "CANCEL",
            Method::Refer => "REFER",
            Method::Notify => "NOTIFY",
            Method::Info => "INFO",
            Method::Update => "UPDATE",
            Method::Options => "OPTIONS",
            Method::Other(m) => m,
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Dialog identity: Call-ID plus both tags, from the local perspective
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct DialogId {
    pub call_id: String,
    pub local_tag: String,
    /// Unknown until the first tagged response of an outbound dialog
    pub remote_tag: Option<String>,
}

impl DialogId {
    pub fn new(call_id: impl Into<String>, local_tag: impl Into<String>) -> Self {
        Self { call_id: call_id.into(), local_tag: local_tag.into(), remote_tag: None }
    }

    /// Fresh locally originated dialog
    pub fn generate() -> Self {
        let call_id = uuid::Uuid::new_v4().simple().to_string();
        let tag = uuid::Uuid::new_v4().simple().to_string();
        Self::new(call_id, tag[..8].to_string())
    }

    pub fn with_remote_tag(mut self, tag: impl Into<String>) -> Self {
        self.remote_tag = Some(tag.into());
        self
    }

    /// Registry key; stable before the remote tag is known
    pub fn key(&self) -> String {
        format!("{};{}", self.call_id, self.local_tag)
    }
}

impl fmt::Display for DialogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}",
            self.call_id,
            self.local_tag,
            self.remote_tag.as_deref().unwrap_or("-")
        )
    }
}

/// Transaction handle (branch)
#[derive(Debug, Clone, Hash, PartialEq, Eq)]
pub struct TransactionId(pub String);

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// `"Display Name" <sip:user@host>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NameAddr {
    pub display_name: Option<String>,
    pub uri: String,
}

impl NameAddr {
    pub fn new(uri: impl Into<String>) -> Self {
        Self { display_name: None, uri: uri.into() }
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Parse a header value in name-addr or addr-spec form. Header
    /// parameters after `>` are dropped.
    pub fn parse(value: &str) -> Self {
        let value = value.trim();
        match (value.find('<'), value.find('>')) {
            (Some(start), Some(end)) if start < end => {
                let name = value[..start].trim().trim_matches('"').trim();
                Self {
                    display_name: (!name.is_empty()).then(|| name.to_string()),
                    uri: value[start + 1..end].trim().to_string(),
                }
            }
            _ => Self::new(value.split(';').next().unwrap_or(value).trim()),
        }
    }

    /// URI without parameters or headers, lowercased scheme and host
    pub fn canonical_uri(&self) -> String {
        let uri = self.uri.split(['?', ';']).next().unwrap_or(&self.uri);
        // the user part is case sensitive
        match uri.split_once('@') {
            Some((user, host)) => {
                let user = match user.split_once(':') {
                    Some((scheme, name)) => format!("{}:{}", scheme.to_ascii_lowercase(), name),
                    None => user.to_string(),
                };
                format!("{}@{}", user, host.to_ascii_lowercase())
            }
            None => uri.to_ascii_lowercase(),
        }
    }

    /// Same address of record, ignoring display name and URI parameters
    pub fn same_address(&self, other: &NameAddr) -> bool {
        self.canonical_uri() == other.canonical_uri()
    }
}

impl fmt::Display for NameAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "\"{}\" <{}>", name, self.uri),
            None => write!(f, "<{}>", self.uri),
        }
    }
}

/// Header list with case-insensitive lookup
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(&name));
        self.0.push((name, value.into()));
    }

    pub fn remove(&mut self, name: &str) {
        self.0.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

pub const CONTENT_TYPE_SDP: &str = "application/sdp";
pub const CONTENT_TYPE_SIPFRAG: &str = "message/sipfrag;version=2.0";
pub const CONTENT_TYPE_MEDIA_CONTROL: &str = "application/media_control+xml";

/// A SIP request as seen by the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipRequest {
    pub method: Method,
    pub transaction: TransactionId,
    pub dialog: DialogId,
    /// Request-URI
    pub uri: String,
    pub from: NameAddr,
    pub to: NameAddr,
    pub contact: Option<NameAddr>,
    pub cseq: u32,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipRequest {
    pub fn new(
        method: Method,
        transaction: TransactionId,
        dialog: DialogId,
        from: NameAddr,
        to: NameAddr,
        cseq: u32,
    ) -> Self {
        Self {
            uri: to.uri.clone(),
            method,
            transaction,
            dialog,
            from,
            to,
            contact: None,
            cseq,
            headers: Headers::default(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_contact(mut self, contact: NameAddr) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    /// Body when it is a session description
    pub fn sdp(&self) -> Option<&str> {
        sdp_body(&self.headers, self.body.as_deref())
    }

    /// Same request on a fresh transaction (auth retry, 491 resend)
    pub fn clone_onto(&self, transaction: TransactionId, cseq: u32) -> Self {
        let mut request = self.clone();
        request.transaction = transaction;
        request.cseq = cseq;
        request
    }
}

/// A SIP response as seen by the core
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SipResponse {
    pub status: u16,
    pub reason: String,
    /// Method of the request this answers (from CSeq)
    pub method: Method,
    pub transaction: TransactionId,
    pub dialog: DialogId,
    pub contact: Option<NameAddr>,
    pub headers: Headers,
    pub body: Option<String>,
}

impl SipResponse {
    /// Response to an inbound request
    pub fn to_request(request: &SipRequest, status: u16, reason: impl Into<String>) -> Self {
        Self {
            status,
            reason: reason.into(),
            method: request.method.clone(),
            transaction: request.transaction.clone(),
            dialog: request.dialog.clone(),
            contact: None,
            headers: Headers::default(),
            body: None,
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.set(name, value);
        self
    }

    pub fn with_contact(mut self, contact: NameAddr) -> Self {
        self.contact = Some(contact);
        self
    }

    pub fn with_body(mut self, content_type: &str, body: impl Into<String>) -> Self {
        self.headers.set("Content-Type", content_type);
        self.body = Some(body.into());
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name)
    }

    pub fn sdp(&self) -> Option<&str> {
        sdp_body(&self.headers, self.body.as_deref())
    }

    pub fn is_provisional(&self) -> bool {
        (100..200).contains(&self.status)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn is_redirect(&self) -> bool {
        (300..400).contains(&self.status)
    }

    pub fn is_failure(&self) -> bool {
        self.status >= 400
    }
}

fn sdp_body<'a>(headers: &Headers, body: Option<&'a str>) -> Option<&'a str> {
    let body = body.filter(|b| !b.trim().is_empty())?;
    match headers.get("Content-Type") {
        Some(ct) if !ct.to_ascii_lowercase().starts_with(CONTENT_TYPE_SDP) => None,
        _ => Some(body),
    }
}

/// The transaction/dialog stack consumed by the core
#[async_trait]
pub trait TransactionProvider: Send + Sync {
    /// Send a request on the transaction it carries
    async fn send_request(&self, request: SipRequest) -> Result<()>;

    /// Send a response on the server transaction it carries
    async fn send_response(&self, response: SipResponse) -> Result<()>;

    /// Allocate a fresh client transaction
    fn new_branch(&self) -> TransactionId;
}
