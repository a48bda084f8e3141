//! Two-level fingerprint derivation.

use serde::Serialize;
use tiny_keccak::{Hasher, Sha3};

use crate::cache::digest::FileDigest;

/// A 128-bit fingerprint, used for both `ActionCacheKey` (action_key) and bulk keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, serde::Deserialize)]
pub struct Fingerprint(pub [u8; 16]);

impl Fingerprint {
    pub fn hex(&self) -> String {
        hex::encode(self.0)
    }

    /// The two hex nibble-pairs used to shard the on-disk layout:
    /// `<cache>/<key[0..2]>/<key[2..4]>/...`.
    pub fn shard(&self) -> (String, String) {
        let hex = self.hex();
        (hex[0..2].to_string(), hex[2..4].to_string())
    }
}

fn hash_to_fingerprint(parts: &[&[u8]]) -> Fingerprint {
    let mut hasher = Sha3::v256();
    for part in parts {
        hasher.update(part);
    }
    let mut full = [0u8; 32];
    hasher.finalize(&mut full);
    let mut out = [0u8; 16];
    out.copy_from_slice(&full[..16]);
    Fingerprint(out)
}

/// Anything that can be turned into the stable byte representation an action's rules serialize
/// to for fingerprinting. Kept as a trait (rather than requiring `serde::Serialize` directly on
/// [`crate::actions::Action`]) so callers can choose exactly what subset of an action's fields
/// participate in the key — e.g. excluding `working_dir`, which may legitimately vary between
/// machines without changing the action's semantic identity.
pub trait SerializeForFingerprint {
    fn serialize_for_fingerprint(&self) -> Vec<u8>;
}

impl<T: Serialize> SerializeForFingerprint for T {
    fn serialize_for_fingerprint(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("fingerprint serialization is infallible for action rules")
    }
}

fn concat_digests(digests: &[FileDigest]) -> Vec<u8> {
    let mut buf = Vec::new();
    for d in digests {
        buf.extend_from_slice(d.path.to_string_lossy().as_bytes());
        buf.extend_from_slice(&d.hash);
    }
    buf
}

/// `action_key = H(seed ‖ serialize(action_rules) ‖ Σ serialize(file_digest_i))` over the
/// action's *declared* inputs, in rule order.
pub fn action_key(seed: u64, rules: &impl SerializeForFingerprint, declared_input_digests: &[FileDigest]) -> Fingerprint {
    let rules_bytes = rules.serialize_for_fingerprint();
    let digest_bytes = concat_digests(declared_input_digests);
    hash_to_fingerprint(&[&seed.to_le_bytes(), &rules_bytes, &digest_bytes])
}

/// `bulk_key = H(action_key ‖ Σ serialize(file_digest_i))` over *all* inputs actually used at
/// run time (declared ∪ traced).
pub fn bulk_key(action_key: Fingerprint, actual_input_digests: &[FileDigest]) -> Fingerprint {
    let digest_bytes = concat_digests(actual_input_digests);
    hash_to_fingerprint(&[&action_key.0, &digest_bytes])
}
