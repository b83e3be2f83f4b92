//! HMAC-SHA256 fingerprinting over canonical JSON. Secrets are never
//! recorded directly — only their HMAC-SHA256 fingerprints, using
//! deterministic canonical hashing so identical payloads yield identical
//! fingerprints.

use elspeth_core::canonical::canonical_json;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// A run-lifetime HMAC key. Never serialized; held only in memory for the
/// duration of a run.
#[derive(Clone)]
pub struct FingerprintKey(Vec<u8>);

impl FingerprintKey {
    pub fn new(key_bytes: impl Into<Vec<u8>>) -> Self {
        FingerprintKey(key_bytes.into())
    }

    /// Fingerprint an arbitrary serializable payload, canonicalizing it
    /// first so field/map ordering never affects the result.
    pub fn fingerprint<T: serde::Serialize>(&self, payload: &T) -> String {
        let canonical = canonical_json(payload).expect("payload always serializes");
        self.fingerprint_bytes(canonical.as_bytes())
    }

    pub fn fingerprint_bytes(&self, bytes: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts any key length");
        mac.update(bytes);
        hex::encode(mac.finalize().into_bytes())
    }
}
