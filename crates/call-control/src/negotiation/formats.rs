//! Format and RTP header extension matching
//!
//! Remote formats are read from the `m=` format list plus `a=rtpmap`/`a=fmtp`,
//! falling back to the static payload table. Payload type and extension id
//! registries keep numbers stable across re-offers and adopt whatever the
//! remote side bound them to.

use std::collections::HashMap;

use crate::media::{MediaFormat, RtpExtension};
use crate::sdp::{Attribute, MediaDescription};

/// A codec both sides support
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatMatch {
    /// Our version of the codec (our fmtp)
    pub local: MediaFormat,
    /// The remote version, with the remote payload type
    pub remote: MediaFormat,
}

/// Formats offered in a media line, in the line's order. Unknown dynamic
/// payload types without `a=rtpmap` are skipped.
pub fn remote_formats(md: &MediaDescription) -> Vec<MediaFormat> {
    md.formats
        .iter()
        .filter_map(|token| {
            let pt: u8 = token.parse().ok()?;
            let mut format = match md.rtpmap(token) {
                Some(rtpmap) => MediaFormat::from_rtpmap(pt, rtpmap)?,
                None => MediaFormat::from_static_payload(pt)?,
            };
            format.fmtp = md.fmtp(token).map(str::to_string);
            Some(format)
        })
        .collect()
}

/// Codecs both sides support, in local preference order
pub fn intersect_local_order(local: &[MediaFormat], remote: &[MediaFormat]) -> Vec<FormatMatch> {
    local
        .iter()
        .filter_map(|l| {
            remote
                .iter()
                .find(|r| r.same_codec(l))
                .map(|r| FormatMatch { local: l.clone(), remote: r.clone() })
        })
        .collect()
}

/// Codecs both sides support, in the remote line's order (processing answers)
pub fn intersect_remote_order(local: &[MediaFormat], remote: &[MediaFormat]) -> Vec<FormatMatch> {
    remote
        .iter()
        .filter_map(|r| {
            local
                .iter()
                .find(|l| l.same_codec(r))
                .map(|l| FormatMatch { local: l.clone(), remote: r.clone() })
        })
        .collect()
}

/// Extensions both sides support, by URI, adopting the remote ids
pub fn intersect_extensions(local: &[RtpExtension], remote: &[RtpExtension]) -> Vec<RtpExtension> {
    remote
        .iter()
        .filter(|r| local.iter().any(|l| l.uri == r.uri))
        .cloned()
        .collect()
}

pub fn remote_extensions(md: &MediaDescription) -> Vec<RtpExtension> {
    md.attributes_named("extmap").filter_map(RtpExtension::parse).collect()
}

/// Append formats to a media line: `m=` tokens, `a=rtpmap`, `a=fmtp`
pub fn write_formats(md: &mut MediaDescription, formats: &[MediaFormat]) {
    for f in formats {
        let pt = f.payload_type.to_string();
        md.formats.push(pt.clone());
        md.push_attribute(Attribute::value("rtpmap", format!("{} {}", pt, f.rtpmap())));
        if let Some(fmtp) = &f.fmtp {
            md.push_attribute(Attribute::value("fmtp", format!("{} {}", pt, fmtp)));
        }
    }
}

pub fn write_extensions(md: &mut MediaDescription, extensions: &[RtpExtension]) {
    for ext in extensions {
        md.push_attribute(Attribute::value("extmap", ext.to_sdp_value()));
    }
}

/// Dynamic payload type bindings for one peer
#[derive(Debug, Default)]
pub struct PayloadTypeRegistry {
    bound: Vec<MediaFormat>,
}

impl PayloadTypeRegistry {
    const DYNAMIC: std::ops::RangeInclusive<u8> = 96..=127;

    /// Remember the payload type the remote side uses for a codec
    pub fn bind(&mut self, format: &MediaFormat) {
        self.bound.retain(|b| !b.same_codec(format) && b.payload_type != format.payload_type);
        self.bound.push(format.clone());
    }

    /// Our formats renumbered to the bound payload types. Dynamic types that
    /// collide with a binding of another codec are moved to a free number.
    pub fn resolve(&self, formats: &[MediaFormat]) -> Vec<MediaFormat> {
        let mut out: Vec<MediaFormat> = Vec::with_capacity(formats.len());
        for f in formats {
            let mut f = f.clone();
            if let Some(bound) = self.bound.iter().find(|b| b.same_codec(&f)) {
                f.payload_type = bound.payload_type;
            } else if f.is_dynamic() && self.is_taken(f.payload_type, &f, &out) {
                match Self::DYNAMIC.clone().find(|pt| !self.is_taken(*pt, &f, &out)) {
                    Some(pt) => f.payload_type = pt,
                    None => continue,
                }
            }
            out.push(f);
        }
        out
    }

    fn is_taken(&self, pt: u8, format: &MediaFormat, pending: &[MediaFormat]) -> bool {
        self.bound
            .iter()
            .chain(pending.iter())
            .any(|b| b.payload_type == pt && !b.same_codec(format))
    }
}

/// RTP header extension id bindings for one peer
#[derive(Debug, Default)]
pub struct ExtensionRegistry {
    ids: HashMap<String, u16>,
}

impl ExtensionRegistry {
    pub fn bind(&mut self, extension: &RtpExtension) {
        self.ids.retain(|uri, id| *id != extension.id || *uri == extension.uri);
        self.ids.insert(extension.uri.clone(), extension.id);
    }

    /// Our extensions with bound ids; unbound ones get the lowest free id
    pub fn resolve(&self, extensions: &[RtpExtension]) -> Vec<RtpExtension> {
        let mut used: Vec<u16> = self.ids.values().copied().collect();
        let mut out = Vec::with_capacity(extensions.len());
        for ext in extensions {
            let mut ext = ext.clone();
            if let Some(id) = self.ids.get(&ext.uri) {
                ext.id = *id;
            } else if used.contains(&ext.id) {
                match (1..=14).find(|id| !used.contains(id)) {
                    Some(id) => ext.id = id,
                    None => continue,
                }
            }
            used.push(ext.id);
            out.push(ext);
        }
        out
    }
}
