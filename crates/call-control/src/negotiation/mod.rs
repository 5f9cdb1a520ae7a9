//! Offer/answer negotiation engine
//!
//! [`MediaHandler`] owns the negotiation state of one call peer: the last
//! local description, active streams per media type, security controls per
//! `(MediaType, SrtpProtocol)`, hold flags, and the payload type and RTP
//! extension registries. It is always used behind the peer's offer/answer
//! lock, so exactly one exchange is processed at a time.
//!
//! # Offers
//!
//! Audio then video. Each type needs an active device and a non-inactive
//! direction, and yields one descriptor per transport profile of the secure
//! transport policy (`Off` → AVP, `Optional` → SAVP then AVP, `Mandatory` →
//! SAVP). SDES crypto lines go on the first descriptor of each type only.
//!
//! # Answers
//!
//! Lines are answered in arrival order. Lines that cannot be used get a
//! disabling answer (port 0) instead of failing the exchange; only when no
//! line is usable does the whole answer fail, with the most specific reason:
//!
//! ```text
//! NoCompatibleDevice > SecurityPolicyViolation > NoValidDescriptions
//! ```

pub mod direction;
pub mod formats;
pub mod security;

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use rand::Rng;
use tracing::{debug, info, warn};

use crate::config::CallControlConfig;
use crate::errors::NegotiationFailure;
use crate::media::{MediaEngine, MediaError, MediaFormat, RtpExtension, StreamHandle, StreamSpec};
use crate::sdp::{Attribute, MediaDescription, Origin, SessionDescription};
use crate::types::{MediaDirection, MediaType, SrtpProtocol, TransportProfile};

use self::direction::{answer_direction, offer_direction};
use self::formats::{
    ExtensionRegistry, PayloadTypeRegistry, intersect_extensions, intersect_local_order,
    intersect_remote_order, remote_extensions, remote_formats, write_extensions, write_formats,
};
use self::security::{SdesControl, SecurityControl, ZrtpControl};

/// Value of `a=rtcp-xr` advertised on audio
pub const RTCP_XR_VOIP_METRICS: &str = "voip-metrics";

type NegotiationResult<T> = std::result::Result<T, NegotiationFailure>;

/// A stream created through the media engine
#[derive(Debug, Clone)]
pub struct ActiveStream {
    pub handle: StreamHandle,
    pub spec: StreamSpec,
    pub started: bool,
}

/// Outcome of negotiating one media line, applied only once the whole
/// exchange succeeded
#[derive(Debug, Clone)]
struct AcceptedLine {
    media_type: MediaType,
    device: String,
    /// Answer descriptor (offers only)
    description: Option<MediaDescription>,
    /// Format the stream binds to
    format: MediaFormat,
    /// Remote payload type bindings to remember
    bindings: Vec<MediaFormat>,
    target: Option<SocketAddr>,
    direction: MediaDirection,
    remote_holding: bool,
    extensions: Vec<RtpExtension>,
    security: Option<SecurityControl>,
    framerate: Option<u32>,
}

/// Most specific reason when every line failed
fn most_specific(failures: &[NegotiationFailure]) -> NegotiationFailure {
    let priority = [
        NegotiationFailure::NoCompatibleDevice,
        NegotiationFailure::SecurityPolicyViolation,
    ];
    for reason in priority {
        if failures.contains(&reason) {
            return reason;
        }
    }
    failures
        .iter()
        .find(|f| matches!(f, NegotiationFailure::MediaEngine(_)))
        .cloned()
        .unwrap_or(NegotiationFailure::NoValidDescriptions)
}

/// Negotiation state of one call peer
pub struct MediaHandler {
    engine: Arc<dyn MediaEngine>,
    config: Arc<CallControlConfig>,
    local_sdp: Option<SessionDescription>,
    streams: HashMap<MediaType, ActiveStream>,
    security: HashMap<(MediaType, SrtpProtocol), SecurityControl>,
    local_hold: bool,
    remote_hold: bool,
    /// Encryption methods the remote side advertised in its last description
    remote_encryption: HashSet<SrtpProtocol>,
    payload_types: PayloadTypeRegistry,
    extensions: ExtensionRegistry,
    remote_framerate: Option<u32>,
    master: Option<MediaType>,
    muted: bool,
}

impl MediaHandler {
    pub fn new(engine: Arc<dyn MediaEngine>, config: Arc<CallControlConfig>) -> Self {
        Self {
            engine,
            config,
            local_sdp: None,
            streams: HashMap::new(),
            security: HashMap::new(),
            local_hold: false,
            remote_hold: false,
            remote_encryption: HashSet::new(),
            payload_types: PayloadTypeRegistry::default(),
            extensions: ExtensionRegistry::default(),
            remote_framerate: None,
            master: None,
            muted: false,
        }
    }

    pub fn local_description(&self) -> Option<&SessionDescription> {
        self.local_sdp.as_ref()
    }

    pub fn is_locally_on_hold(&self) -> bool {
        self.local_hold
    }

    pub fn is_remotely_on_hold(&self) -> bool {
        self.remote_hold
    }

    /// Returns whether the flag changed
    pub fn set_local_hold(&mut self, on_hold: bool) -> bool {
        let changed = self.local_hold != on_hold;
        self.local_hold = on_hold;
        changed
    }

    pub fn stream(&self, media_type: MediaType) -> Option<&ActiveStream> {
        self.streams.get(&media_type)
    }

    pub fn master_stream(&self) -> Option<MediaType> {
        self.master
    }

    pub fn remote_encryption_methods(&self) -> &HashSet<SrtpProtocol> {
        &self.remote_encryption
    }

    /// Security protocol in effect for a media type
    pub fn security_protocol(&self, media_type: MediaType) -> Option<SrtpProtocol> {
        self.keying_control(media_type).map(SecurityControl::protocol)
    }

    fn next_origin(&self) -> Origin {
        match &self.local_sdp {
            Some(previous) => {
                let mut origin = previous.origin.clone();
                origin.session_version += 1;
                origin
            }
            None => {
                let session_id = rand::thread_rng().gen_range(1..=u64::from(u32::MAX));
                let address = self.engine.local_target(MediaType::Audio).ip().to_string();
                Origin::new(session_id, address)
            }
        }
    }

    /// Build an initial offer
    pub fn create_offer(&mut self) -> NegotiationResult<SessionDescription> {
        let offer = self.build_offer(self.next_origin())?;
        debug!(lines = offer.media.len(), "created offer");
        self.local_sdp = Some(offer.clone());
        Ok(offer)
    }

    /// Build an offer replacing the previous local description (hold
    /// toggle, periodic re-INVITE). Earlier media lines keep their position;
    /// lines with no current counterpart are disabled.
    pub fn create_update_offer(&mut self) -> NegotiationResult<SessionDescription> {
        let Some(previous) = self.local_sdp.clone() else {
            return self.create_offer();
        };
        let fresh = self.build_offer(self.next_origin())?;

        let mut pool = fresh.media.clone();
        let mut media = Vec::with_capacity(previous.media.len().max(pool.len()));
        for old in &previous.media {
            match pool.iter().position(|m| m.media == old.media) {
                Some(pos) => media.push(pool.remove(pos)),
                None => media.push(MediaDescription::disabled_from(old)),
            }
        }
        media.extend(pool);

        let offer = SessionDescription { media, ..fresh };
        debug!(version = offer.origin.session_version, hold = self.local_hold, "created update offer");
        self.local_sdp = Some(offer.clone());
        Ok(offer)
    }

    fn build_offer(&mut self, origin: Origin) -> NegotiationResult<SessionDescription> {
        let config = Arc::clone(&self.config);
        let suites = config.security.enabled_suites();
        let mut sdp = SessionDescription::new(origin);

        for media_type in MediaType::ALL {
            if media_type == MediaType::Video
                && !config.media.video_transmission_enabled
                && !self.streams.contains_key(&MediaType::Video)
            {
                continue;
            }
            let Some(device) = self.engine.device(media_type) else {
                debug!(media = %media_type, "no active device, not offering");
                continue;
            };
            let direction = offer_direction(
                media_type,
                device.direction,
                config.media.direction_preference(media_type),
                self.local_hold,
            );
            if direction == MediaDirection::Inactive {
                continue;
            }

            let mut formats = self.payload_types.resolve(&self.engine.supported_formats(media_type));
            if media_type == MediaType::Video {
                formats.truncate(1);
            }
            if formats.is_empty() {
                continue;
            }
            let extensions = self.extensions.resolve(&self.engine.supported_extensions(media_type));
            let port = self.engine.local_target(media_type).port();

            let crypto = if suites.is_empty() {
                Vec::new()
            } else {
                let control = self
                    .security
                    .entry((media_type, SrtpProtocol::Sdes))
                    .or_insert_with(|| SecurityControl::Sdes(SdesControl::new(media_type)));
                match control {
                    SecurityControl::Sdes(sdes) => sdes.offer(&suites),
                    SecurityControl::Zrtp(_) => Vec::new(),
                }
            };
            let zrtp_hash = if config.security.zrtp_enabled {
                self.engine.zrtp_hash(media_type)
            } else {
                None
            };
            if let Some(hash) = &zrtp_hash {
                let control = self
                    .security
                    .entry((media_type, SrtpProtocol::Zrtp))
                    .or_insert_with(|| SecurityControl::Zrtp(ZrtpControl::default()));
                if let SecurityControl::Zrtp(zrtp) = control {
                    zrtp.local_hash = Some(hash.clone());
                }
            }

            for (i, profile) in config.security.transport.offered_profiles().iter().enumerate() {
                let mut md = MediaDescription::new(media_type.as_str(), port, profile.as_sdp());
                write_formats(&mut md, &formats);
                md.set_direction(direction);
                write_extensions(&mut md, &extensions);
                self.add_capabilities(&mut md, media_type);
                // crypto lines go on the first line of the type only. With a secure
                // profile offered that line is RTP/SAVP, the one RFC 4568 keys apply to;
                // under `Mandatory` it is the only line.
                if i == 0 {
                    for c in &crypto {
                        md.push_attribute(Attribute::value("crypto", c.to_sdp_value()));
                    }
                }
                if let Some(hash) = &zrtp_hash {
                    md.push_attribute(Attribute::value("zrtp-hash", hash.clone()));
                }
                sdp.media.push(md);
            }
        }

        if sdp.media.is_empty() {
            warn!("no media could be offered");
            return Err(NegotiationFailure::NoCompatibleDevice);
        }
        Ok(sdp)
    }

    fn add_capabilities(&self, md: &mut MediaDescription, media_type: MediaType) {
        match media_type {
            MediaType::Audio if self.config.media.rtcp_xr => {
                md.push_attribute(Attribute::value("rtcp-xr", RTCP_XR_VOIP_METRICS));
            }
            MediaType::Video => {
                if let Some(fps) = self.remote_framerate {
                    md.push_attribute(Attribute::value("framerate", fps.to_string()));
                }
            }
            _ => {}
        }
    }

    /// Answer a remote offer. With `create_media` the negotiated streams are
    /// created (or pre-created ones re-targeted); without it only the answer
    /// is computed.
    pub async fn process_offer(
        &mut self,
        offer: &SessionDescription,
        create_media: bool,
    ) -> NegotiationResult<SessionDescription> {
        let mut answer = SessionDescription::new(self.next_origin());
        let mut accepted: Vec<(usize, AcceptedLine)> = Vec::new();
        let mut failures = Vec::new();
        let mut answered: HashSet<MediaType> = HashSet::new();

        for md in &offer.media {
            let duplicate = MediaType::from_sdp(&md.media).is_some_and(|t| answered.contains(&t));
            if duplicate {
                answer.media.push(MediaDescription::disabled_from(md));
                continue;
            }
            match self.answer_line(offer, md) {
                Ok(line) => {
                    answered.insert(line.media_type);
                    let description = line.description.clone().unwrap_or_else(|| MediaDescription::disabled_from(md));
                    answer.media.push(description);
                    accepted.push((answer.media.len() - 1, line));
                }
                Err(reason) => {
                    debug!(media = %md.media, proto = %md.protocol, reason = %reason, "rejecting media line");
                    failures.push(reason);
                    answer.media.push(MediaDescription::disabled_from(md));
                }
            }
        }
        self.note_remote_encryption(offer);

        if accepted.is_empty() {
            let reason = most_specific(&failures);
            warn!(reason = reason.reason_code(), "no usable media in offer");
            return Err(reason);
        }

        self.remote_hold = accepted.iter().all(|(_, l)| l.remote_holding);
        let lines: Vec<AcceptedLine> = accepted.iter().map(|(_, l)| l).cloned().collect();
        self.commit(&lines);

        if create_media {
            let failed = self.bind_streams(lines).await;
            for media_type in &failed {
                if let Some((idx, _)) = accepted.iter().find(|(_, l)| l.media_type == *media_type) {
                    let disabled = MediaDescription::disabled_from(&answer.media[*idx]);
                    answer.media[*idx] = disabled;
                }
            }
            if failed.len() == accepted.len() {
                return Err(NegotiationFailure::MediaEngine("no stream could be created".to_string()));
            }
        }

        info!(
            accepted = accepted.len(),
            rejected = answer.media.len() - accepted.len(),
            remote_hold = self.remote_hold,
            "answered offer"
        );
        self.local_sdp = Some(answer.clone());
        Ok(answer)
    }

    fn answer_line(&self, offer: &SessionDescription, md: &MediaDescription) -> NegotiationResult<AcceptedLine> {
        let config = &self.config;
        let profile = TransportProfile::from_sdp(&md.protocol).ok_or(NegotiationFailure::NoValidDescriptions)?;
        if !config.security.transport.accepts(profile) {
            return Err(NegotiationFailure::SecurityPolicyViolation);
        }
        let media_type = MediaType::from_sdp(&md.media).ok_or(NegotiationFailure::NoValidDescriptions)?;
        let device = self.engine.device(media_type).ok_or(NegotiationFailure::NoCompatibleDevice)?;

        let remote_direction = offer.effective_direction(md);
        let local = device.direction.and(config.media.direction_preference(media_type));
        let direction = answer_direction(local, remote_direction, self.local_hold);

        if md.is_disabled() {
            return Err(NegotiationFailure::NoValidDescriptions);
        }
        if media_type == MediaType::Video && !config.media.video_reception_enabled {
            return Err(NegotiationFailure::NoValidDescriptions);
        }

        let matches = intersect_local_order(&self.engine.supported_formats(media_type), &remote_formats(md));
        let Some(preferred) = matches.first() else {
            return Err(NegotiationFailure::NoValidDescriptions);
        };
        let extensions = intersect_extensions(&self.engine.supported_extensions(media_type), &remote_extensions(md));
        let (security, security_attr) = self.answer_security(media_type, profile, md)?;

        let port = self.engine.local_target(media_type).port();
        let mut line = MediaDescription::new(md.media.clone(), port, md.protocol.clone());
        let answered_formats: Vec<MediaFormat> = match media_type {
            // advertise what we would like to receive, stream what was agreed
            MediaType::Video => {
                let mut local = preferred.local.clone();
                local.payload_type = preferred.remote.payload_type;
                vec![local]
            }
            MediaType::Audio => matches.iter().map(|m| m.remote.clone()).collect(),
        };
        write_formats(&mut line, &answered_formats);
        line.set_direction(direction);
        write_extensions(&mut line, &extensions);
        if media_type == MediaType::Audio && config.media.rtcp_xr && md.has_attribute("rtcp-xr") {
            line.push_attribute(Attribute::value("rtcp-xr", RTCP_XR_VOIP_METRICS));
        }
        if let Some(attr) = security_attr {
            line.push_attribute(attr);
        }

        let target = offer.target(md);
        let held_by_address = target.is_some_and(|t| t.ip().is_unspecified());
        Ok(AcceptedLine {
            media_type,
            device: device.name,
            description: Some(line),
            format: preferred.remote.clone(),
            bindings: matches.iter().map(|m| m.remote.clone()).collect(),
            target,
            direction,
            remote_holding: held_by_address || !remote_direction.allows_receiving(),
            extensions,
            security,
            framerate: md.attribute("framerate").and_then(|v| v.trim().parse().ok()),
        })
    }

    /// SDES as responder, else ZRTP acknowledgement
    fn answer_security(
        &self,
        media_type: MediaType,
        profile: TransportProfile,
        md: &MediaDescription,
    ) -> NegotiationResult<(Option<SecurityControl>, Option<Attribute>)> {
        let config = &self.config.security;
        let suites = config.enabled_suites();

        if !suites.is_empty() && md.has_attribute("crypto") {
            let mut control = match self.security.get(&(media_type, SrtpProtocol::Sdes)) {
                Some(SecurityControl::Sdes(existing)) => existing.clone(),
                _ => SdesControl::new(media_type),
            };
            if let Some(local) = control.answer(md.attributes_named("crypto"), &suites) {
                let attr = Attribute::value("crypto", local.to_sdp_value());
                return Ok((Some(SecurityControl::Sdes(control)), Some(attr)));
            }
        }

        if config.zrtp_enabled {
            if let Some(remote_hash) = md.attribute("zrtp-hash") {
                let local_hash = self.engine.zrtp_hash(media_type);
                let attr = local_hash.clone().map(|h| Attribute::value("zrtp-hash", h));
                let control = ZrtpControl { local_hash, remote_hash: Some(remote_hash.to_string()) };
                return Ok((Some(SecurityControl::Zrtp(control)), attr));
            }
        }

        if profile == TransportProfile::Secure
            || config.transport == crate::config::SecureTransportPolicy::Mandatory
        {
            return Err(NegotiationFailure::SecurityPolicyViolation);
        }
        Ok((None, None))
    }

    /// Apply the answer to an offer we sent
    pub async fn process_answer(&mut self, answer: &SessionDescription) -> NegotiationResult<()> {
        let mut lines = Vec::new();
        let mut failures = Vec::new();
        let mut answered: HashSet<MediaType> = HashSet::new();

        for md in &answer.media {
            let Some(media_type) = MediaType::from_sdp(&md.media) else { continue };
            if answered.contains(&media_type) || md.is_disabled() {
                continue;
            }
            match self.accept_answer_line(answer, md, media_type) {
                Ok(line) => {
                    answered.insert(media_type);
                    lines.push(line);
                }
                Err(reason) => {
                    debug!(media = %media_type, reason = %reason, "answer line unusable");
                    failures.push(reason);
                }
            }
        }
        self.note_remote_encryption(answer);

        // rejected or missing lines close their stream
        let closed: Vec<MediaType> = self
            .streams
            .keys()
            .filter(|t| !answered.contains(t))
            .copied()
            .collect();
        for media_type in closed {
            self.close_stream(media_type).await;
        }

        if lines.is_empty() {
            let reason = most_specific(&failures);
            warn!(reason = reason.reason_code(), "no usable media in answer");
            return Err(reason);
        }

        self.commit(&lines);
        let failed = self.bind_streams(lines).await;
        if !failed.is_empty() && self.streams.is_empty() {
            return Err(NegotiationFailure::MediaEngine("no stream could be created".to_string()));
        }
        info!(streams = self.streams.len(), "processed answer");
        Ok(())
    }

    fn accept_answer_line(
        &self,
        answer: &SessionDescription,
        md: &MediaDescription,
        media_type: MediaType,
    ) -> NegotiationResult<AcceptedLine> {
        let config = &self.config;
        let profile = TransportProfile::from_sdp(&md.protocol).ok_or(NegotiationFailure::NoValidDescriptions)?;
        if !config.security.transport.accepts(profile) {
            return Err(NegotiationFailure::SecurityPolicyViolation);
        }
        let device = self.engine.device(media_type).ok_or(NegotiationFailure::NoCompatibleDevice)?;

        // what we offered for this type, or what we would offer now
        let offered = self
            .local_sdp
            .as_ref()
            .and_then(|sdp| sdp.media.iter().find(|m| m.media == md.media && !m.is_disabled()))
            .and_then(MediaDescription::direction)
            .unwrap_or_else(|| {
                offer_direction(
                    media_type,
                    device.direction,
                    config.media.direction_preference(media_type),
                    self.local_hold,
                )
            });
        let remote_direction = answer.effective_direction(md);
        let direction = answer_direction(offered, remote_direction, self.local_hold);

        let matches = intersect_remote_order(&self.engine.supported_formats(media_type), &remote_formats(md));
        let Some(chosen) = matches.first() else {
            return Err(NegotiationFailure::NoValidDescriptions);
        };
        let extensions = intersect_extensions(&self.engine.supported_extensions(media_type), &remote_extensions(md));

        let mut security = None;
        if md.has_attribute("crypto") {
            if let Some(SecurityControl::Sdes(existing)) = self.security.get(&(media_type, SrtpProtocol::Sdes)) {
                let mut control = existing.clone();
                if control.process_answer(md.attributes_named("crypto")) {
                    security = Some(SecurityControl::Sdes(control));
                }
            }
        }
        if security.is_none() && config.security.zrtp_enabled {
            if let Some(remote_hash) = md.attribute("zrtp-hash") {
                let local_hash = match self.security.get(&(media_type, SrtpProtocol::Zrtp)) {
                    Some(SecurityControl::Zrtp(z)) => z.local_hash.clone(),
                    _ => self.engine.zrtp_hash(media_type),
                };
                security = Some(SecurityControl::Zrtp(ZrtpControl {
                    local_hash,
                    remote_hash: Some(remote_hash.to_string()),
                }));
            }
        }
        if security.is_none()
            && (profile == TransportProfile::Secure
                || config.security.transport == crate::config::SecureTransportPolicy::Mandatory)
        {
            return Err(NegotiationFailure::SecurityPolicyViolation);
        }

        Ok(AcceptedLine {
            media_type,
            device: device.name,
            description: None,
            format: chosen.remote.clone(),
            bindings: matches.iter().map(|m| m.remote.clone()).collect(),
            target: answer.target(md),
            direction,
            remote_holding: false,
            extensions,
            security,
            framerate: md.attribute("framerate").and_then(|v| v.trim().parse().ok()),
        })
    }

    fn note_remote_encryption(&mut self, remote: &SessionDescription) {
        self.remote_encryption.clear();
        for md in remote.media.iter().filter(|m| !m.is_disabled()) {
            if md.has_attribute("crypto") {
                self.remote_encryption.insert(SrtpProtocol::Sdes);
            }
            if md.has_attribute("zrtp-hash") {
                self.remote_encryption.insert(SrtpProtocol::Zrtp);
            }
        }
    }

    /// Registries, security controls and master designation
    fn commit(&mut self, lines: &[AcceptedLine]) {
        for line in lines {
            for format in &line.bindings {
                if format.is_dynamic() {
                    self.payload_types.bind(format);
                }
            }
            for ext in &line.extensions {
                self.extensions.bind(ext);
            }
            if line.media_type == MediaType::Video {
                if let Some(fps) = line.framerate {
                    self.remote_framerate = Some(fps);
                }
            }
            if let Some(control) = &line.security {
                let protocol = control.protocol();
                if protocol == SrtpProtocol::Sdes {
                    // one keying protocol per media type
                    self.security.remove(&(line.media_type, SrtpProtocol::Zrtp));
                }
                self.security.insert((line.media_type, protocol), control.clone());
            }
        }

        self.master = if lines.len() > 1 && lines.iter().any(|l| l.media_type == MediaType::Audio) {
            Some(MediaType::Audio)
        } else {
            lines.first().map(|l| l.media_type)
        };
    }

    fn keying_control(&self, media_type: MediaType) -> Option<&SecurityControl> {
        let sdes = self
            .security
            .get(&(media_type, SrtpProtocol::Sdes))
            .filter(|c| matches!(c, SecurityControl::Sdes(s) if s.is_established()));
        sdes.or_else(|| {
            self.security
                .get(&(media_type, SrtpProtocol::Zrtp))
                .filter(|c| matches!(c, SecurityControl::Zrtp(z) if z.remote_hash.is_some()))
        })
    }

    fn stream_spec(&self, line: &AcceptedLine) -> StreamSpec {
        StreamSpec {
            media_type: line.media_type,
            device: line.device.clone(),
            format: line.format.clone(),
            target: line.target,
            direction: line.direction,
            extensions: line.extensions.clone(),
            master: self.master == Some(line.media_type),
            keying: self.keying_control(line.media_type).and_then(SecurityControl::keying),
        }
    }

    /// Create or update streams; returns the media types that failed
    async fn bind_streams(&mut self, lines: Vec<AcceptedLine>) -> Vec<MediaType> {
        let mut failed = Vec::new();
        for line in &lines {
            let spec = self.stream_spec(line);
            if let Err(e) = self.bind_stream(spec).await {
                warn!(media = %line.media_type, error = %e, "failed to bind stream");
                self.close_stream(line.media_type).await;
                failed.push(line.media_type);
            }
        }
        failed
    }

    async fn bind_stream(&mut self, spec: StreamSpec) -> Result<(), MediaError> {
        let media_type = spec.media_type;
        if let Some(active) = self.streams.get_mut(&media_type) {
            let same_format = active.spec.format.same_codec(&spec.format)
                && active.spec.format.payload_type == spec.format.payload_type;
            if same_format {
                debug!(media = %media_type, stream = %active.handle, "re-targeting existing stream");
                self.engine.retarget_stream(active.handle, &spec).await?;
                active.spec = spec;
                return Ok(());
            }
            debug!(media = %media_type, "format changed, recreating stream");
            self.close_stream(media_type).await;
        }
        let handle = self.engine.create_stream(spec.clone()).await?;
        debug!(media = %media_type, stream = %handle, format = %spec.format, "created stream");
        self.streams.insert(media_type, ActiveStream { handle, spec, started: false });
        Ok(())
    }

    /// Create streams for an offer before the call is answered, so the
    /// answer only has to re-target them. Returns how many were created.
    pub async fn precreate_streams(&mut self, offer: &SessionDescription) -> Result<usize, MediaError> {
        let mut created = 0;
        let mut seen = HashSet::new();
        for md in &offer.media {
            let Ok(line) = self.answer_line(offer, md) else { continue };
            if !seen.insert(line.media_type) || self.streams.contains_key(&line.media_type) {
                continue;
            }
            let mut spec = self.stream_spec(&line);
            // keys are only known once the answer is committed
            spec.keying = None;
            let handle = self.engine.create_stream(spec.clone()).await?;
            self.streams.insert(line.media_type, ActiveStream { handle, spec, started: false });
            created += 1;
        }
        Ok(created)
    }

    /// Start every stream that is not running yet
    pub async fn start(&mut self) -> Result<(), MediaError> {
        for (media_type, stream) in self.streams.iter_mut() {
            if stream.started {
                continue;
            }
            self.engine.start_stream(stream.handle).await?;
            stream.started = true;
            if *media_type == MediaType::Audio && self.muted {
                self.engine.set_mute(stream.handle, true).await?;
            }
            info!(media = %media_type, stream = %stream.handle, "started stream");
        }
        Ok(())
    }

    pub async fn set_mute(&mut self, muted: bool) -> Result<(), MediaError> {
        self.muted = muted;
        if let Some(audio) = self.streams.get(&MediaType::Audio) {
            self.engine.set_mute(audio.handle, muted).await?;
        }
        Ok(())
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub async fn request_keyframe(&self) -> Result<(), MediaError> {
        match self.streams.get(&MediaType::Video) {
            Some(video) => self.engine.request_keyframe(video.handle).await,
            None => Err(MediaError::NoDevice(MediaType::Video)),
        }
    }

    async fn close_stream(&mut self, media_type: MediaType) {
        if let Some(stream) = self.streams.remove(&media_type) {
            if let Err(e) = self.engine.close_stream(stream.handle).await {
                warn!(media = %media_type, error = %e, "failed to close stream");
            }
        }
        if self.master == Some(media_type) {
            self.master = None;
        }
    }

    /// Close every stream; the handler can negotiate again afterwards
    pub async fn close(&mut self) {
        let types: Vec<MediaType> = self.streams.keys().copied().collect();
        for media_type in types {
            self.close_stream(media_type).await;
        }
    }
}
