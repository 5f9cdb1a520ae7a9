//! SRTP keying controls: SDES (RFC 4568) and ZRTP hash advertisement
//!
//! SDES runs as offerer (one `a=crypto` line per enabled suite, fresh key per
//! line) or responder (first of the peer's suites that is locally enabled).
//! Crypto lines that do not parse, name an unknown suite or carry a key of
//! the wrong length are skipped, never rejected: some deployed endpoints send
//! a non-standard suite name next to valid ones.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use rand::RngCore;
use rand::rngs::OsRng;
use tracing::debug;

use crate::media::StreamKeying;
use crate::types::{MediaType, SrtpProtocol};

/// SDES crypto suites this build can key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SdesSuite {
    AesCm128HmacSha1_80,
    AesCm128HmacSha1_32,
    F8_128HmacSha1_80,
    Aes256CmHmacSha1_80,
    Aes256CmHmacSha1_32,
}

impl SdesSuite {
    pub fn name(&self) -> &'static str {
        match self {
            SdesSuite::AesCm128HmacSha1_80 => "AES_CM_128_HMAC_SHA1_80",
            SdesSuite::AesCm128HmacSha1_32 => "AES_CM_128_HMAC_SHA1_32",
            SdesSuite::F8_128HmacSha1_80 => "F8_128_HMAC_SHA1_80",
            SdesSuite::Aes256CmHmacSha1_80 => "AES_256_CM_HMAC_SHA1_80",
            SdesSuite::Aes256CmHmacSha1_32 => "AES_256_CM_HMAC_SHA1_32",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "AES_CM_128_HMAC_SHA1_80" => Some(SdesSuite::AesCm128HmacSha1_80),
            "AES_CM_128_HMAC_SHA1_32" => Some(SdesSuite::AesCm128HmacSha1_32),
            "F8_128_HMAC_SHA1_80" => Some(SdesSuite::F8_128HmacSha1_80),
            "AES_256_CM_HMAC_SHA1_80" => Some(SdesSuite::Aes256CmHmacSha1_80),
            "AES_256_CM_HMAC_SHA1_32" => Some(SdesSuite::Aes256CmHmacSha1_32),
            _ => None,
        }
    }

    /// Master key + master salt length in bytes
    pub fn key_salt_len(&self) -> usize {
        match self {
            SdesSuite::Aes256CmHmacSha1_80 | SdesSuite::Aes256CmHmacSha1_32 => 32 + 14,
            _ => 16 + 14,
        }
    }

    fn generate_key(&self) -> String {
        let mut key_salt = vec![0u8; self.key_salt_len()];
        OsRng.fill_bytes(&mut key_salt);
        STANDARD.encode(&key_salt)
    }
}

/// `a=crypto:<tag> <suite> inline:<key>[|lifetime][|mki] [session params]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CryptoAttribute {
    pub tag: u32,
    pub suite: String,
    /// Base64 key+salt, without lifetime/MKI
    pub key: String,
    /// Lifetime and MKI after the key, if any
    pub key_params: Option<String>,
    pub session_params: Vec<String>,
}

impl CryptoAttribute {
    pub fn new(tag: u32, suite: SdesSuite, key: String) -> Self {
        Self {
            tag,
            suite: suite.name().to_string(),
            key,
            key_params: None,
            session_params: Vec::new(),
        }
    }

    /// Parse an attribute value; `None` for anything malformed
    pub fn parse(value: &str) -> Option<Self> {
        let mut parts = value.split_whitespace();
        let tag = parts.next()?.parse().ok()?;
        let suite = parts.next()?.to_string();
        let key_info = parts.next()?.strip_prefix("inline:")?;
        let (key, key_params) = match key_info.split_once('|') {
            Some((k, p)) => (k, Some(p.to_string())),
            None => (key_info, None),
        };
        if key.is_empty() {
            return None;
        }
        Some(Self {
            tag,
            suite,
            key: key.to_string(),
            key_params,
            session_params: parts.map(str::to_string).collect(),
        })
    }

    /// The suite, when known and the key has the right length for it
    pub fn valid_suite(&self) -> Option<SdesSuite> {
        let suite = SdesSuite::from_name(&self.suite)?;
        let decoded = STANDARD.decode(&self.key).ok()?;
        (decoded.len() == suite.key_salt_len()).then_some(suite)
    }

    pub fn to_sdp_value(&self) -> String {
        let mut value = format!("{} {} inline:{}", self.tag, self.suite, self.key);
        if let Some(params) = &self.key_params {
            value.push('|');
            value.push_str(params);
        }
        for p in &self.session_params {
            value.push(' ');
            value.push_str(p);
        }
        value
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SdesSelection {
    suite: SdesSuite,
    local: CryptoAttribute,
    remote: CryptoAttribute,
}

/// SDES state for one media type
#[derive(Debug, Clone)]
pub struct SdesControl {
    media_type: MediaType,
    offered: Vec<CryptoAttribute>,
    selected: Option<SdesSelection>,
}

impl SdesControl {
    pub fn new(media_type: MediaType) -> Self {
        Self { media_type, offered: Vec::new(), selected: None }
    }

    /// Crypto lines for an offer. Keys are kept across re-offers as long
    /// as the suite list is unchanged.
    pub fn offer(&mut self, suites: &[SdesSuite]) -> Vec<CryptoAttribute> {
        if let Some(sel) = &self.selected {
            if suites.contains(&sel.suite) {
                return vec![sel.local.clone()];
            }
        }
        let unchanged = self.offered.len() == suites.len()
            && self.offered.iter().zip(suites).all(|(o, s)| o.suite == s.name());
        if !unchanged {
            self.offered = suites
                .iter()
                .enumerate()
                .map(|(i, s)| CryptoAttribute::new(i as u32 + 1, *s, s.generate_key()))
                .collect();
        }
        self.offered.clone()
    }

    /// Respond to the peer's crypto lines. Returns our answer line.
    pub fn answer<'a>(
        &mut self,
        remote_lines: impl IntoIterator<Item = &'a str>,
        enabled: &[SdesSuite],
    ) -> Option<CryptoAttribute> {
        for line in remote_lines {
            let Some(remote) = CryptoAttribute::parse(line) else {
                debug!(media = %self.media_type, line, "ignoring malformed crypto attribute");
                continue;
            };
            let Some(suite) = remote.valid_suite() else {
                debug!(media = %self.media_type, suite = %remote.suite, "ignoring unusable crypto suite");
                continue;
            };
            if !enabled.contains(&suite) {
                continue;
            }
            // keep our key when the peer re-offers the same suite
            let key = match &self.selected {
                Some(sel) if sel.suite == suite => sel.local.key.clone(),
                _ => suite.generate_key(),
            };
            let local = CryptoAttribute::new(remote.tag, suite, key);
            self.selected = Some(SdesSelection { suite, local: local.clone(), remote });
            return Some(local);
        }
        None
    }

    /// Match the peer's answer against our offered lines
    pub fn process_answer<'a>(&mut self, remote_lines: impl IntoIterator<Item = &'a str>) -> bool {
        for line in remote_lines {
            let Some(remote) = CryptoAttribute::parse(line) else { continue };
            let Some(suite) = remote.valid_suite() else { continue };
            let matched = self
                .offered
                .iter()
                .chain(self.selected.as_ref().map(|s| &s.local))
                .find(|o| o.tag == remote.tag && o.suite == remote.suite)
                .cloned();
            if let Some(local) = matched {
                self.selected = Some(SdesSelection { suite, local, remote });
                return true;
            }
        }
        false
    }

    pub fn is_established(&self) -> bool {
        self.selected.is_some()
    }

    pub fn keying(&self) -> Option<StreamKeying> {
        self.selected.as_ref().map(|sel| StreamKeying::Sdes {
            suite: sel.suite.name().to_string(),
            local_key: sel.local.key.clone(),
            remote_key: sel.remote.key.clone(),
        })
    }
}

/// ZRTP is negotiated in the media path; SDP only carries the hello hash
#[derive(Debug, Clone, Default)]
pub struct ZrtpControl {
    pub local_hash: Option<String>,
    pub remote_hash: Option<String>,
}

impl ZrtpControl {
    pub fn keying(&self) -> StreamKeying {
        StreamKeying::Zrtp { remote_hash: self.remote_hash.clone() }
    }
}

#[derive(Debug, Clone)]
pub enum SecurityControl {
    Sdes(SdesControl),
    Zrtp(ZrtpControl),
}

impl SecurityControl {
    pub fn protocol(&self) -> SrtpProtocol {
        match self {
            SecurityControl::Sdes(_) => SrtpProtocol::Sdes,
            SecurityControl::Zrtp(_) => SrtpProtocol::Zrtp,
        }
    }

    pub fn keying(&self) -> Option<StreamKeying> {
        match self {
            SecurityControl::Sdes(c) => c.keying(),
            SecurityControl::Zrtp(c) => Some(c.keying()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY_128: &str = "WVNfX19zZW1jdGwgKCkgewkyMjA7fQp9CnVubGVz";

    #[test]
    fn test_parse_crypto_attribute() {
        let line = format!("1 AES_CM_128_HMAC_SHA1_80 inline:{}|2^20|1:32 KDR=1", KEY_128);
        let attr = CryptoAttribute::parse(&line).unwrap();
        assert_eq!(attr.tag, 1);
        assert_eq!(attr.key, KEY_128);
        assert_eq!(attr.key_params.as_deref(), Some("2^20|1:32"));
        assert_eq!(attr.session_params, vec!["KDR=1"]);
        assert_eq!(attr.valid_suite(), Some(SdesSuite::AesCm128HmacSha1_80));
        assert!(attr.to_sdp_value().ends_with("|2^20|1:32 KDR=1"));
    }

    #[test]
    fn test_malformed_lines() {
        assert!(CryptoAttribute::parse("x AES_CM_128_HMAC_SHA1_80 inline:abc").is_none());
        assert!(CryptoAttribute::parse("1 AES_CM_128_HMAC_SHA1_80 uri:abc").is_none());
        assert!(CryptoAttribute::parse("1").is_none());
        let short = CryptoAttribute::parse("1 AES_CM_128_HMAC_SHA1_80 inline:AAAA").unwrap();
        assert_eq!(short.valid_suite(), None);
    }

    #[test]
    fn test_responder_skips_unknown_and_picks_first_enabled() {
        let mut control = SdesControl::new(MediaType::Audio);
        let lines = [
            "1 AES_CM_128_HMAC_SHA1_80_BOGUS inline:abcd".to_string(),
            "garbage".to_string(),
            format!("2 AES_CM_128_HMAC_SHA1_32 inline:{}", KEY_128),
            format!("3 AES_CM_128_HMAC_SHA1_80 inline:{}", KEY_128),
        ];
        let enabled = [SdesSuite::AesCm128HmacSha1_80, SdesSuite::AesCm128HmacSha1_32];
        let answer = control.answer(lines.iter().map(String::as_str), &enabled).unwrap();
        assert_eq!(answer.tag, 2);
        assert_eq!(answer.suite, "AES_CM_128_HMAC_SHA1_32");
        assert_eq!(STANDARD.decode(&answer.key).unwrap().len(), 30);
        assert!(matches!(control.keying(), Some(StreamKeying::Sdes { remote_key, .. }) if remote_key == KEY_128));
    }

    #[test]
    fn test_responder_without_common_suite() {
        let mut control = SdesControl::new(MediaType::Audio);
        let line = format!("1 AES_CM_128_HMAC_SHA1_32 inline:{}", KEY_128);
        assert!(control.answer([line.as_str()], &[SdesSuite::AesCm128HmacSha1_80]).is_none());
        assert!(!control.is_established());
    }

    #[test]
    fn test_offerer_flow() {
        let mut control = SdesControl::new(MediaType::Video);
        let suites = [SdesSuite::AesCm128HmacSha1_80, SdesSuite::Aes256CmHmacSha1_80];
        let offer = control.offer(&suites);
        assert_eq!(offer.len(), 2);
        assert_eq!(STANDARD.decode(&offer[1].key).unwrap().len(), 46);
        // stable across re-offers
        assert_eq!(control.offer(&suites), offer);

        let answer = format!("2 AES_256_CM_HMAC_SHA1_80 inline:{}", STANDARD.encode([7u8; 46]));
        assert!(control.process_answer([answer.as_str()]));
        assert!(control.is_established());
        // after selection only the chosen line is offered again
        assert_eq!(control.offer(&suites), vec![offer[1].clone()]);
    }
}
