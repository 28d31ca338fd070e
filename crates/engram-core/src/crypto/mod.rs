//! Field-level envelope encryption
//!
//! Sensitive columns are encrypted per field per write with AES-256-GCM and
//! a fresh 96-bit nonce. Keys come from the caller: either raw 32-byte
//! material or a passphrase run through Argon2id with the per-database salt
//! stored in the reserved metadata store.
//!
//! The key ring is an ordered list of `(key-id, key)`; writes always use the
//! head. During rotation the ring holds both old and new keys so readers
//! tolerate mixed-key state until the sweep finishes.

pub mod rotation;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use zeroize::{Zeroize, Zeroizing};

use crate::config::{KdfParams, KeySource};
use crate::error::{DbError, DbResult};

/// AES-GCM nonce length in bytes
const NONCE_LEN: usize = 12;
/// AES-GCM authentication tag length in bytes
const TAG_LEN: usize = 16;
/// KDF salt length in bytes
pub const SALT_LEN: usize = 16;

/// On-disk form of one encrypted field
///
/// Field names are the wire contract: `k` key-id, `n` nonce, `c` ciphertext,
/// `t` auth tag, all but `k` base64url without padding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// Key id the field was encrypted under
    pub k: String,
    /// Nonce, base64url
    pub n: String,
    /// Ciphertext, base64url
    pub c: String,
    /// Authentication tag, base64url
    pub t: String,
}

struct KeyEntry {
    id: String,
    key: Zeroizing<[u8; 32]>,
}

/// Ordered key ring; head is active for writes, reads try entries by key-id
pub struct FieldCipher {
    ring: Vec<KeyEntry>,
}

impl std::fmt::Debug for FieldCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldCipher")
            .field("key_ids", &self.key_ids())
            .finish()
    }
}

impl FieldCipher {
    /// Ring with a single key
    pub fn new(key: [u8; 32]) -> Self {
        let id = key_id(&key);
        Self {
            ring: vec![KeyEntry {
                id,
                key: Zeroizing::new(key),
            }],
        }
    }

    /// Key id active for new writes
    pub fn active_key_id(&self) -> &str {
        // ring is never empty: constructed with one key, retire keeps the head
        self.ring.first().map_or("", |e| e.id.as_str())
    }

    /// All key ids in ring order, head first
    pub fn key_ids(&self) -> Vec<String> {
        self.ring.iter().map(|e| e.id.clone()).collect()
    }

    /// Whether `id` is present in the ring
    pub fn contains(&self, id: &str) -> bool {
        self.ring.iter().any(|e| e.id == id)
    }

    /// Prepend a new key, making it active; returns its id.
    ///
    /// Rotating to the key that is already active is a no-op.
    pub fn activate(&mut self, key: [u8; 32]) -> String {
        let id = key_id(&key);
        if self.active_key_id() == id {
            return id;
        }
        self.ring.retain(|e| e.id != id);
        self.ring.insert(
            0,
            KeyEntry {
                id: id.clone(),
                key: Zeroizing::new(key),
            },
        );
        id
    }

    /// Drop and zero every key except the active head
    pub fn retire_inactive(&mut self) {
        // Zeroizing handles the wipe on drop
        self.ring.truncate(1);
    }

    /// Wrap every non-active key under the active one.
    ///
    /// Persisted alongside the rotation marker so a crashed sweep can
    /// rebuild the full ring when the database reopens with the new key.
    pub fn export_wrapped(&self) -> DbResult<Vec<(String, Envelope)>> {
        let mut wrapped = Vec::with_capacity(self.ring.len().saturating_sub(1));
        for entry in self.ring.iter().skip(1) {
            wrapped.push((entry.id.clone(), self.encrypt(entry.key.as_slice())?));
        }
        Ok(wrapped)
    }

    /// Rebuild ring tail entries from wrapped key material
    pub fn import_wrapped(&mut self, wrapped: &[(String, Envelope)]) -> DbResult<()> {
        for (id, envelope) in wrapped {
            if self.contains(id) {
                continue;
            }
            let raw = self.decrypt(envelope)?;
            let key: [u8; 32] = raw
                .try_into()
                .map_err(|_| DbError::DecryptFailed("wrapped key has the wrong length".into()))?;
            self.ring.push(KeyEntry {
                id: id.clone(),
                key: Zeroizing::new(key),
            });
        }
        Ok(())
    }

    /// Encrypt one field value under the active key
    pub fn encrypt(&self, plaintext: &[u8]) -> DbResult<Envelope> {
        let head = self
            .ring
            .first()
            .ok_or_else(|| DbError::DecryptFailed("empty key ring".into()))?;
        let cipher = Aes256Gcm::new_from_slice(head.key.as_slice())
            .map_err(|e| DbError::DecryptFailed(format!("cipher init: {e}")))?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let mut sealed = cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| DbError::DecryptFailed(format!("encrypt: {e}")))?;
        // aes-gcm appends the tag; the envelope keeps it as a separate field
        let tag = sealed.split_off(sealed.len() - TAG_LEN);

        Ok(Envelope {
            k: head.id.clone(),
            n: URL_SAFE_NO_PAD.encode(nonce_bytes),
            c: URL_SAFE_NO_PAD.encode(&sealed),
            t: URL_SAFE_NO_PAD.encode(&tag),
        })
    }

    /// Decrypt one envelope; the key-id must still be in the ring and the
    /// tag must verify
    pub fn decrypt(&self, envelope: &Envelope) -> DbResult<Vec<u8>> {
        let entry = self
            .ring
            .iter()
            .find(|e| e.id == envelope.k)
            .ok_or_else(|| {
                DbError::DecryptFailed(format!("key '{}' is not in the ring", envelope.k))
            })?;
        let cipher = Aes256Gcm::new_from_slice(entry.key.as_slice())
            .map_err(|e| DbError::DecryptFailed(format!("cipher init: {e}")))?;

        let nonce_bytes = decode_b64(&envelope.n, "nonce")?;
        if nonce_bytes.len() != NONCE_LEN {
            return Err(DbError::DecryptFailed(format!(
                "invalid nonce length {}",
                nonce_bytes.len()
            )));
        }
        let mut sealed = decode_b64(&envelope.c, "ciphertext")?;
        let tag = decode_b64(&envelope.t, "tag")?;
        if tag.len() != TAG_LEN {
            return Err(DbError::DecryptFailed(format!(
                "invalid tag length {}",
                tag.len()
            )));
        }
        sealed.extend_from_slice(&tag);

        cipher
            .decrypt(Nonce::from_slice(&nonce_bytes), sealed.as_ref())
            .map_err(|_| DbError::DecryptFailed("authentication tag mismatch".into()))
    }
}

fn decode_b64(input: &str, what: &str) -> DbResult<Vec<u8>> {
    URL_SAFE_NO_PAD
        .decode(input)
        .map_err(|e| DbError::DecryptFailed(format!("invalid {what} encoding: {e}")))
}

/// Key id: first 8 bytes of SHA3-256 of the raw key, hex
pub fn key_id(key: &[u8; 32]) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(key);
    let digest = hasher.finalize();
    digest[..8].iter().map(|b| format!("{b:02x}")).collect()
}

/// Random KDF salt for a fresh database
pub fn generate_salt() -> [u8; SALT_LEN] {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Resolve a [`KeySource`] into raw key material.
///
/// Passphrases go through Argon2id with the database salt; raw keys are
/// length-checked and used as-is.
pub fn derive_key(source: &KeySource, salt: &[u8], params: &KdfParams) -> DbResult<[u8; 32]> {
    match source {
        KeySource::Raw(bytes) => {
            if bytes.len() != 32 {
                return Err(DbError::KeyDerivationFailed(format!(
                    "raw key must be 32 bytes, got {}",
                    bytes.len()
                )));
            }
            let mut key = [0u8; 32];
            key.copy_from_slice(bytes);
            Ok(key)
        }
        KeySource::Passphrase(passphrase) => {
            let argon_params = argon2::Params::new(
                params.memory_cost,
                params.time_cost,
                params.parallelism,
                Some(32),
            )
            .map_err(|e| DbError::KeyDerivationFailed(e.to_string()))?;
            let argon = argon2::Argon2::new(
                argon2::Algorithm::Argon2id,
                argon2::Version::V0x13,
                argon_params,
            );
            let mut key = [0u8; 32];
            argon
                .hash_password_into(passphrase.as_bytes(), salt, &mut key)
                .map_err(|e| DbError::KeyDerivationFailed(e.to_string()))?;
            Ok(key)
        }
    }
}

/// Wipe a raw key buffer
pub fn zeroize_key(key: &mut [u8; 32]) {
    key.zeroize();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_params() -> KdfParams {
        // Small costs keep the KDF fast under test
        KdfParams {
            time_cost: 1,
            memory_cost: 8,
            parallelism: 1,
        }
    }

    #[test]
    fn test_envelope_roundtrip() {
        let cipher = FieldCipher::new([7u8; 32]);
        let envelope = cipher.encrypt(b"top-secret-token").unwrap();
        assert_eq!(envelope.k, cipher.active_key_id());
        assert_eq!(cipher.decrypt(&envelope).unwrap(), b"top-secret-token");
    }

    #[test]
    fn test_fresh_nonce_per_write() {
        let cipher = FieldCipher::new([7u8; 32]);
        let a = cipher.encrypt(b"same plaintext").unwrap();
        let b = cipher.encrypt(b"same plaintext").unwrap();
        assert_ne!(a.n, b.n);
        assert_ne!(a.c, b.c);
    }

    #[test]
    fn test_tampered_tag_fails() {
        let cipher = FieldCipher::new([7u8; 32]);
        let mut envelope = cipher.encrypt(b"payload").unwrap();
        envelope.t = URL_SAFE_NO_PAD.encode([0u8; 16]);
        assert!(matches!(
            cipher.decrypt(&envelope),
            Err(DbError::DecryptFailed(_))
        ));
    }

    #[test]
    fn test_ring_reads_old_key_during_rotation() {
        let mut cipher = FieldCipher::new([1u8; 32]);
        let old_envelope = cipher.encrypt(b"old data").unwrap();

        let new_id = cipher.activate([2u8; 32]);
        assert_eq!(cipher.active_key_id(), new_id);
        assert_eq!(cipher.key_ids().len(), 2);

        // Old envelope still readable while both keys are in the ring
        assert_eq!(cipher.decrypt(&old_envelope).unwrap(), b"old data");

        cipher.retire_inactive();
        assert!(matches!(
            cipher.decrypt(&old_envelope),
            Err(DbError::DecryptFailed(_))
        ));
    }

    #[test]
    fn test_passphrase_derivation_is_deterministic() {
        let salt = [9u8; SALT_LEN];
        let params = test_params();
        let a = derive_key(&KeySource::Passphrase("initial".into()), &salt, &params).unwrap();
        let b = derive_key(&KeySource::Passphrase("initial".into()), &salt, &params).unwrap();
        let c = derive_key(&KeySource::Passphrase("next".into()), &salt, &params).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
