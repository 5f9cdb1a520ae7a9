//! Error types for the call-control core
//!
//! Errors fall into four categories that drive how the state machine reacts:
//!
//! - **Negotiation** - no compatible device, no common codec, secure-transport
//!   policy violation or a malformed remote description. Expected during normal
//!   operation; turned into a 488 rejection or a typed failure, never dropped.
//! - **Transport** - send failures and transaction timeouts. The owning peer is
//!   hung up or failed; only auth challenges and 491 are retried.
//! - **State** - an operation that is not legal in the peer's current state.
//! - **Internal** - defects (broken invariants, malformed messages from the
//!   provider). These are bugs, not protocol outcomes.

use thiserror::Error;

use crate::media::MediaError;
use crate::peer::PeerState;
use crate::sdp::SdpError;

/// Result type alias for call-control operations
pub type Result<T> = std::result::Result<T, CallError>;

/// Why an offer/answer exchange could not be completed.
///
/// Each reason has a distinct user-facing message; the precedence used when
/// every media line failed is `NoCompatibleDevice`, then
/// `SecurityPolicyViolation`, then `NoValidDescriptions`.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NegotiationFailure {
    #[error("no compatible media device found")]
    NoCompatibleDevice,

    #[error("remote description violates the secure transport policy")]
    SecurityPolicyViolation,

    #[error("no valid media descriptions")]
    NoValidDescriptions,

    #[error("malformed session description: {0}")]
    MalformedDescription(String),

    #[error("media engine failure: {0}")]
    MediaEngine(String),
}

impl NegotiationFailure {
    /// Stable reason code for analytics and UI lookup
    pub fn reason_code(&self) -> &'static str {
        match self {
            NegotiationFailure::NoCompatibleDevice => "no-device",
            NegotiationFailure::SecurityPolicyViolation => "insecure-transport",
            NegotiationFailure::NoValidDescriptions => "no-valid-descriptions",
            NegotiationFailure::MalformedDescription(_) => "malformed-description",
            NegotiationFailure::MediaEngine(_) => "media-engine",
        }
    }

    /// Message shown to the user when a call fails for this reason
    pub fn user_message(&self) -> &'static str {
        match self {
            NegotiationFailure::NoCompatibleDevice => {
                "Failed to establish media: no compatible audio or video device was found."
            }
            NegotiationFailure::SecurityPolicyViolation => {
                "The remote party does not support secure media, which your account requires."
            }
            NegotiationFailure::NoValidDescriptions => {
                "The remote party did not offer any media this client can use."
            }
            NegotiationFailure::MalformedDescription(_) => {
                "The remote party sent an invalid media description."
            }
            NegotiationFailure::MediaEngine(_) => "The media engine could not set up the call.",
        }
    }

    /// SIP status used when the failure is answered on the wire
    pub fn status_code(&self) -> u16 {
        match self {
            NegotiationFailure::MediaEngine(_) => 500,
            _ => 488,
        }
    }
}

/// Error type for every call-control operation
#[derive(Error, Debug, Clone)]
pub enum CallError {
    #[error("Media negotiation failed: {0}")]
    Negotiation(#[from] NegotiationFailure),

    #[error("Transport failed: {reason}")]
    TransportFailed { reason: String },

    #[error("Transaction timed out: {method}")]
    TransactionTimeout { method: String },

    #[error("Authentication failed: {reason}")]
    AuthenticationFailed { reason: String },

    #[error("Invalid peer state for {operation}: {state:?}")]
    InvalidState { operation: String, state: PeerState },

    #[error("Peer not found: {peer}")]
    PeerNotFound { peer: String },

    #[error("Call not found: {call}")]
    CallNotFound { call: String },

    #[error("Transfer failed: {reason}")]
    TransferFailed { reason: String },

    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfiguration { field: String, reason: String },

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl CallError {
    pub fn transport_failed(reason: impl Into<String>) -> Self {
        Self::TransportFailed { reason: reason.into() }
    }

    pub fn authentication_failed(reason: impl Into<String>) -> Self {
        Self::AuthenticationFailed { reason: reason.into() }
    }

    pub fn invalid_state(operation: impl Into<String>, state: PeerState) -> Self {
        Self::InvalidState { operation: operation.into(), state }
    }

    pub fn peer_not_found(peer: impl std::fmt::Display) -> Self {
        Self::PeerNotFound { peer: peer.to_string() }
    }

    pub fn call_not_found(call: impl std::fmt::Display) -> Self {
        Self::CallNotFound { call: call.to_string() }
    }

    pub fn transfer_failed(reason: impl Into<String>) -> Self {
        Self::TransferFailed { reason: reason.into() }
    }

    pub fn invalid_configuration(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfiguration { field: field.into(), reason: reason.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Error category for logging and metrics
    pub fn category(&self) -> &'static str {
        match self {
            CallError::Negotiation(_) | CallError::Media(_) => "negotiation",
            CallError::TransportFailed { .. } | CallError::TransactionTimeout { .. } => "transport",
            CallError::AuthenticationFailed { .. } => "authentication",
            CallError::InvalidState { .. }
            | CallError::PeerNotFound { .. }
            | CallError::CallNotFound { .. } => "state",
            CallError::TransferFailed { .. } => "transfer",
            CallError::InvalidConfiguration { .. } => "configuration",
            CallError::Internal { .. } => "internal",
        }
    }

    /// Whether retrying the same operation later can succeed
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            CallError::TransportFailed { .. } | CallError::TransactionTimeout { .. }
        )
    }

    /// Expected protocol outcome as opposed to a defect
    pub fn is_expected(&self) -> bool {
        !matches!(self, CallError::Internal { .. })
    }
}

impl From<SdpError> for CallError {
    fn from(e: SdpError) -> Self {
        CallError::Negotiation(NegotiationFailure::from(e))
    }
}

impl From<SdpError> for NegotiationFailure {
    fn from(e: SdpError) -> Self {
        NegotiationFailure::MalformedDescription(e.to_string())
    }
}

impl From<MediaError> for NegotiationFailure {
    fn from(e: MediaError) -> Self {
        NegotiationFailure::MediaEngine(e.to_string())
    }
}
