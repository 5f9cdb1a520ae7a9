//! Call-control configuration
//!
//! ```text
//! ┌──────────────────────────────┐
//! │ CallControlConfig            │
//! │  local_uri / display_name    │
//! │  security ── transport policy, SDES suites, ZRTP
//! │  media ───── video tx/rx, RTCP-XR, pre-creation, direction prefs
//! │  reject_policy ── 486 or 603 for declined incoming calls
//! │  retry ───── ledger TTL and sweep, auth attempts
//! │  park_server                 │
//! └──────────────────────────────┘
//! ```
//!
//! Built in code with the `with_*` methods or loaded from YAML:
//!
//! ```rust
//! use rvoip_call_control::config::{CallControlConfig, SecureTransportPolicy};
//!
//! let config = CallControlConfig::from_yaml_str(
//!     "local_uri: sip:alice@example.com\nsecurity:\n  transport: mandatory\n",
//! )
//! .unwrap();
//! assert_eq!(config.security.transport, SecureTransportPolicy::Mandatory);
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{CallError, Result};
use crate::negotiation::security::SdesSuite;
use crate::types::{MediaDirection, MediaType, TransportProfile};

/// Whether media must, may or must not use `RTP/SAVP`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecureTransportPolicy {
    Off,
    Optional,
    Mandatory,
}

impl SecureTransportPolicy {
    /// Transport profiles to offer, one descriptor each, in order
    pub fn offered_profiles(&self) -> &'static [TransportProfile] {
        match self {
            SecureTransportPolicy::Off => &[TransportProfile::Plain],
            SecureTransportPolicy::Optional => &[TransportProfile::Secure, TransportProfile::Plain],
            SecureTransportPolicy::Mandatory => &[TransportProfile::Secure],
        }
    }

    pub fn accepts(&self, profile: TransportProfile) -> bool {
        !(matches!(self, SecureTransportPolicy::Mandatory) && profile == TransportProfile::Plain)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub transport: SecureTransportPolicy,
    pub sdes_enabled: bool,
    /// Enabled SDES crypto suites in preference order
    pub sdes_suites: Vec<String>,
    pub zrtp_enabled: bool,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            transport: SecureTransportPolicy::Off,
            sdes_enabled: true,
            sdes_suites: vec![
                SdesSuite::AesCm128HmacSha1_80.name().to_string(),
                SdesSuite::AesCm128HmacSha1_32.name().to_string(),
            ],
            zrtp_enabled: false,
        }
    }
}

impl SecurityConfig {
    /// Enabled suites that this build knows how to key
    pub fn enabled_suites(&self) -> Vec<SdesSuite> {
        if !self.sdes_enabled {
            return Vec::new();
        }
        self.sdes_suites.iter().filter_map(|s| SdesSuite::from_name(s)).collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaPolicy {
    pub video_transmission_enabled: bool,
    pub video_reception_enabled: bool,
    /// Advertise `a=rtcp-xr:voip-metrics` on audio
    pub rtcp_xr: bool,
    /// Create streams speculatively when an INVITE arrives
    pub precreate_streams: bool,
    pub audio_direction: MediaDirection,
    pub video_direction: MediaDirection,
}

impl Default for MediaPolicy {
    fn default() -> Self {
        Self {
            video_transmission_enabled: true,
            video_reception_enabled: true,
            rtcp_xr: true,
            precreate_streams: false,
            audio_direction: MediaDirection::SendRecv,
            video_direction: MediaDirection::SendRecv,
        }
    }
}

impl MediaPolicy {
    /// User direction preference for a media type
    pub fn direction_preference(&self, media_type: MediaType) -> MediaDirection {
        match media_type {
            MediaType::Audio => self.audio_direction,
            MediaType::Video => self.video_direction,
        }
    }
}

/// How an unanswered incoming call is refused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectPolicy {
    /// 486 Busy Here
    Busy,
    /// 603 Decline
    Decline,
}

impl RejectPolicy {
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            RejectPolicy::Busy => (486, "Busy Here"),
            RejectPolicy::Decline => (603, "Decline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// How long an unmatched response observer is kept
    pub ledger_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Challenges answered per request before the peer fails
    pub max_auth_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            ledger_ttl_secs: 32,
            sweep_interval_secs: 5,
            max_auth_attempts: 2,
        }
    }
}

impl RetryPolicy {
    pub fn ledger_ttl(&self) -> Duration {
        Duration::from_secs(self.ledger_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallControlConfig {
    /// Our address of record
    pub local_uri: String,
    pub display_name: Option<String>,
    pub user_agent: String,
    pub security: SecurityConfig,
    pub media: MediaPolicy,
    pub reject_policy: RejectPolicy,
    pub retry: RetryPolicy,
    /// Host of the call park service
    pub park_server: Option<String>,
}

impl Default for CallControlConfig {
    fn default() -> Self {
        Self {
            local_uri: "sip:anonymous@localhost".to_string(),
            display_name: None,
            user_agent: format!("rvoip-call-control/{}", env!("CARGO_PKG_VERSION")),
            security: SecurityConfig::default(),
            media: MediaPolicy::default(),
            reject_policy: RejectPolicy::Busy,
            retry: RetryPolicy::default(),
            park_server: None,
        }
    }
}

impl CallControlConfig {
    pub fn new(local_uri: impl Into<String>) -> Self {
        Self { local_uri: local_uri.into(), ..Default::default() }
    }

    /// Parse and validate a YAML document
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| CallError::invalid_configuration("yaml", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml_string(&self) -> Result<String> {
        serde_yaml::to_string(self).map_err(|e| CallError::internal(e.to_string()))
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_secure_transport(mut self, policy: SecureTransportPolicy) -> Self {
        self.security.transport = policy;
        self
    }

    pub fn with_sdes_suites(mut self, suites: Vec<String>) -> Self {
        self.security.sdes_enabled = !suites.is_empty();
        self.security.sdes_suites = suites;
        self
    }

    pub fn with_zrtp(mut self, enabled: bool) -> Self {
        self.security.zrtp_enabled = enabled;
        self
    }

    pub fn with_video(mut self, transmit: bool, receive: bool) -> Self {
        self.media.video_transmission_enabled = transmit;
        self.media.video_reception_enabled = receive;
        self
    }

    pub fn with_rtcp_xr(mut self, enabled: bool) -> Self {
        self.media.rtcp_xr = enabled;
        self
    }

    pub fn with_stream_precreation(mut self, enabled: bool) -> Self {
        self.media.precreate_streams = enabled;
        self
    }

    pub fn with_reject_policy(mut self, policy: RejectPolicy) -> Self {
        self.reject_policy = policy;
        self
    }

    pub fn with_max_auth_attempts(mut self, attempts: u32) -> Self {
        self.retry.max_auth_attempts = attempts;
        self
    }

    pub fn with_park_server(mut self, host: impl Into<String>) -> Self {
        self.park_server = Some(host.into());
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.local_uri.starts_with("sip:") || self.local_uri.starts_with("sips:")) {
            return Err(CallError::invalid_configuration(
                "local_uri",
                format!("not a SIP URI: {}", self.local_uri),
            ));
        }

        let sec = &self.security;
        if sec.sdes_enabled {
            if sec.sdes_suites.is_empty() {
                return Err(CallError::invalid_configuration(
                    "security.sdes_suites",
                    "SDES enabled without any crypto suite",
                ));
            }
            if let Some(unknown) = sec.sdes_suites.iter().find(|s| SdesSuite::from_name(s).is_none()) {
                return Err(CallError::invalid_configuration(
                    "security.sdes_suites",
                    format!("unknown crypto suite {}", unknown),
                ));
            }
        }
        if sec.transport != SecureTransportPolicy::Off && !sec.sdes_enabled && !sec.zrtp_enabled {
            return Err(CallError::invalid_configuration(
                "security.transport",
                "secure transport requires SDES or ZRTP",
            ));
        }

        if self.retry.max_auth_attempts == 0 {
            return Err(CallError::invalid_configuration("retry.max_auth_attempts", "must be at least 1"));
        }
        if self.retry.sweep_interval_secs == 0 || self.retry.ledger_ttl_secs == 0 {
            return Err(CallError::invalid_configuration("retry", "ledger timers must be non-zero"));
        }

        if matches!(&self.park_server, Some(host) if host.trim().is_empty()) {
            return Err(CallError::invalid_configuration("park_server", "empty host"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        CallControlConfig::default().validate().unwrap();
    }

    #[test]
    fn test_profiles_per_policy() {
        use TransportProfile::*;
        assert_eq!(SecureTransportPolicy::Off.offered_profiles(), &[Plain]);
        assert_eq!(SecureTransportPolicy::Optional.offered_profiles(), &[Secure, Plain]);
        assert_eq!(SecureTransportPolicy::Mandatory.offered_profiles(), &[Secure]);
        assert!(!SecureTransportPolicy::Mandatory.accepts(Plain));
        assert!(SecureTransportPolicy::Optional.accepts(Plain));
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = CallControlConfig::new("sip:bob@example.com")
            .with_secure_transport(SecureTransportPolicy::Optional)
            .with_reject_policy(RejectPolicy::Decline)
            .with_park_server("park.example.com");
        let yaml = config.to_yaml_string().unwrap();
        assert_eq!(CallControlConfig::from_yaml_str(&yaml).unwrap(), config);
    }

    #[test]
    fn test_yaml_partial_uses_defaults() {
        let config = CallControlConfig::from_yaml_str(
            "local_uri: sip:carol@example.com\nmedia:\n  video_reception_enabled: false\n",
        )
        .unwrap();
        assert!(!config.media.video_reception_enabled);
        assert!(config.media.video_transmission_enabled);
        assert_eq!(config.reject_policy, RejectPolicy::Busy);
    }

    #[test]
    fn test_validation_errors() {
        let err = CallControlConfig::new("http://nope").validate().unwrap_err();
        assert!(matches!(err, CallError::InvalidConfiguration { ref field, .. } if field == "local_uri"));

        let config = CallControlConfig::default()
            .with_sdes_suites(vec![])
            .with_secure_transport(SecureTransportPolicy::Mandatory);
        assert!(config.validate().is_err());

        let config = CallControlConfig::default().with_sdes_suites(vec!["ROT13".into()]);
        assert!(config.validate().is_err());

        assert!(CallControlConfig::default().with_max_auth_attempts(0).validate().is_err());
    }
}
