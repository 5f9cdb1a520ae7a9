//! Direction composition for offers and answers

use crate::types::{MediaDirection, MediaType};

/// Direction announced in an offer.
///
/// Device capability ∧ user preference; video is always offered
/// `sendrecv`. Local hold then caps the result to `sendonly`.
pub fn offer_direction(
    media_type: MediaType,
    device: MediaDirection,
    preference: MediaDirection,
    local_hold: bool,
) -> MediaDirection {
    let mut direction = match media_type {
        MediaType::Video => MediaDirection::SendRecv,
        MediaType::Audio => device.and(preference),
    };
    if local_hold {
        direction = direction.and(MediaDirection::SendOnly);
    }
    direction
}

/// Direction of an answer line.
///
/// Never answers with a capability the offerer did not ask for and never
/// exceeds the local device.
///
/// | local \ remote offer | sendrecv | sendonly | recvonly | inactive |
/// |----------------------|----------|----------|----------|----------|
/// | sendrecv             | sendrecv | recvonly | sendonly | inactive |
/// | sendonly             | sendonly | inactive | sendonly | inactive |
/// | recvonly             | recvonly | recvonly | inactive | inactive |
pub fn answer_direction(
    local: MediaDirection,
    remote_offer: MediaDirection,
    local_hold: bool,
) -> MediaDirection {
    let mut direction = local.and(remote_offer.reverse());
    if local_hold {
        direction = direction.and(MediaDirection::SendOnly);
    }
    direction
}
