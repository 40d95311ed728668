use crate::hash_id::Id20;
use rand::RngCore;

/// Peers are keyed by a 20-byte id, unique within one torrent's registry.
pub type PeerId = Id20;

/// Fingerprint used by the peers this tracker simulates.
pub const CLIENT_FINGERPRINT: &[u8; 8] = b"-PC0001-";

/// Fills everything after the 8-byte fingerprint with random bytes.
pub fn generate_peer_id(fingerprint: &[u8; 8]) -> PeerId {
    let mut peer_id = [0u8; 20];

    peer_id[..8].copy_from_slice(fingerprint);
    rand::rng().fill_bytes(&mut peer_id[8..]);

    Id20::new(peer_id)
}

pub fn generate_client_peer_id() -> PeerId {
    generate_peer_id(CLIENT_FINGERPRINT)
}
