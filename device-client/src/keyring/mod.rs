//! # Template Key Ring
//!
//! Versioned AES-256-GCM keys for sealing biometric templates.
//!
//! Every template row records the id of the key that sealed it. Rotation adds
//! a key and makes it current; rows under older keys stay readable and are
//! re-encrypted on their next write.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rand::RngCore;
use std::collections::BTreeMap;
use tracing::{debug, info};
use zeroize::Zeroizing;

use shared::error::{IdentityError, IdentityResult};

/// AES-GCM nonce length in bytes
pub const IV_LEN: usize = 12;

/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;

/// Symmetric sealing of template bytes under a named key
pub trait TemplateCipher: Send + Sync {
    /// Key id new rows are sealed under
    fn current_key_id(&self) -> String;

    fn has_key(&self, key_id: &str) -> bool;

    /// Returns `(ciphertext, iv)`
    fn encrypt(&self, plaintext: &[u8], key_id: &str) -> IdentityResult<(Vec<u8>, Vec<u8>)>;

    fn decrypt(&self, ciphertext: &[u8], iv: &[u8], key_id: &str)
        -> IdentityResult<Zeroizing<Vec<u8>>>;
}

struct KeyEntry {
    version: u32,
    material: Zeroizing<[u8; KEY_LEN]>,
    added_at: DateTime<Utc>,
}

struct KeyRingInner {
    keys: BTreeMap<String, KeyEntry>,
    current: String,
}

/// Public view of a key ring entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key_id: String,
    pub version: u32,
    pub added_at: DateTime<Utc>,
    pub is_current: bool,
}

/// Ordered map of key id to versioned key material
pub struct KeyRing {
    inner: RwLock<KeyRingInner>,
}

impl KeyRing {
    /// Create a ring holding a single current key
    pub fn new(key_id: impl Into<String>, material: [u8; KEY_LEN]) -> Self {
        let key_id = key_id.into();
        let mut keys = BTreeMap::new();
        keys.insert(
            key_id.clone(),
            KeyEntry {
                version: 1,
                material: Zeroizing::new(material),
                added_at: Utc::now(),
            },
        );
        Self {
            inner: RwLock::new(KeyRingInner { keys, current: key_id }),
        }
    }

    /// Create a ring with a freshly generated key
    pub fn generate(key_id: impl Into<String>) -> Self {
        Self::new(key_id, random_key())
    }

    /// Parse `id:hex,id:hex`; the current key defaults to the last listed
    pub fn from_spec(spec: &str, current: Option<&str>) -> IdentityResult<Self> {
        let mut ring: Option<KeyRing> = None;
        let mut last_id = None;

        for item in spec.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let (key_id, key_hex) = item.split_once(':').ok_or_else(|| {
                IdentityError::InvalidKey("expected entries of the form 'id:hex'".into())
            })?;
            let material = decode_key(key_hex)?;
            match ring.as_ref() {
                None => ring = Some(KeyRing::new(key_id, material)),
                Some(existing) => {
                    existing.add_key(key_id, material)?;
                }
            }
            last_id = Some(key_id.to_string());
        }

        let ring = ring
            .ok_or_else(|| IdentityError::InvalidKey("no template keys configured".into()))?;
        if let Some(current) = current.map(str::to_string).or(last_id) {
            ring.set_current(&current)?;
        }
        Ok(ring)
    }

    /// Add a key without making it current; returns its version
    pub fn add_key(
        &self,
        key_id: impl Into<String>,
        material: [u8; KEY_LEN],
    ) -> IdentityResult<u32> {
        let key_id = key_id.into();
        let mut inner = self.inner.write();
        if inner.keys.contains_key(&key_id) {
            return Err(IdentityError::InvalidKey(format!("key '{}' already present", key_id)));
        }
        let version = inner.keys.values().map(|k| k.version).max().unwrap_or(0) + 1;
        inner.keys.insert(
            key_id.clone(),
            KeyEntry {
                version,
                material: Zeroizing::new(material),
                added_at: Utc::now(),
            },
        );
        debug!(key_id = %key_id, version, "Template key added");
        Ok(version)
    }

    /// Add a key and make it current
    pub fn rotate(
        &self,
        key_id: impl Into<String>,
        material: [u8; KEY_LEN],
    ) -> IdentityResult<u32> {
        let key_id = key_id.into();
        let version = self.add_key(key_id.clone(), material)?;
        self.set_current(&key_id)?;
        info!(key_id = %key_id, version, "Template key rotated");
        Ok(version)
    }

    pub fn set_current(&self, key_id: &str) -> IdentityResult<()> {
        let mut inner = self.inner.write();
        if !inner.keys.contains_key(key_id) {
            return Err(IdentityError::UnknownKey(key_id.to_string()));
        }
        inner.current = key_id.to_string();
        Ok(())
    }

    pub fn keys(&self) -> Vec<KeyInfo> {
        let inner = self.inner.read();
        inner
            .keys
            .iter()
            .map(|(key_id, entry)| KeyInfo {
                key_id: key_id.clone(),
                version: entry.version,
                added_at: entry.added_at,
                is_current: *key_id == inner.current,
            })
            .collect()
    }

    fn cipher_for(&self, key_id: &str) -> IdentityResult<Aes256Gcm> {
        let inner = self.inner.read();
        let entry = inner
            .keys
            .get(key_id)
            .ok_or_else(|| IdentityError::UnknownKey(key_id.to_string()))?;
        Aes256Gcm::new_from_slice(entry.material.as_slice())
            .map_err(|e| IdentityError::EncryptionError(e.to_string()))
    }
}

impl TemplateCipher for KeyRing {
    fn current_key_id(&self) -> String {
        self.inner.read().current.clone()
    }

    fn has_key(&self, key_id: &str) -> bool {
        self.inner.read().keys.contains_key(key_id)
    }

    fn encrypt(&self, plaintext: &[u8], key_id: &str) -> IdentityResult<(Vec<u8>, Vec<u8>)> {
        let cipher = self.cipher_for(key_id)?;
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| IdentityError::EncryptionError(e.to_string()))?;
        Ok((ciphertext, nonce.to_vec()))
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        iv: &[u8],
        key_id: &str,
    ) -> IdentityResult<Zeroizing<Vec<u8>>> {
        if iv.len() != IV_LEN {
            return Err(IdentityError::EncryptionError(format!(
                "expected {}-byte IV, got {}",
                IV_LEN,
                iv.len()
            )));
        }
        let cipher = self.cipher_for(key_id)?;
        let plaintext = cipher
            .decrypt(Nonce::from_slice(iv), ciphertext)
            .map_err(|e| IdentityError::EncryptionError(e.to_string()))?;
        Ok(Zeroizing::new(plaintext))
    }
}

/// Fresh random key material
pub fn random_key() -> [u8; KEY_LEN] {
    let mut material = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut material);
    material
}

fn decode_key(key_hex: &str) -> IdentityResult<[u8; KEY_LEN]> {
    let bytes = Zeroizing::new(hex::decode(key_hex.trim())?);
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| {
            IdentityError::InvalidKey(format!(
                "expected {} key bytes, got {}",
                KEY_LEN,
                bytes.len()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt_roundtrip() {
        let ring = KeyRing::generate("k1");
        let (ciphertext, iv) = ring.encrypt(b"minutiae", "k1").unwrap();

        assert_eq!(iv.len(), IV_LEN);
        assert_ne!(ciphertext.as_slice(), b"minutiae");
        let plaintext = ring.decrypt(&ciphertext, &iv, "k1").unwrap();
        assert_eq!(plaintext.as_slice(), b"minutiae");
    }

    #[test]
    fn test_unknown_key_rejected() {
        let ring = KeyRing::generate("k1");
        assert!(matches!(
            ring.encrypt(b"x", "k9"),
            Err(IdentityError::UnknownKey(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let ring = KeyRing::generate("k1");
        let (mut ciphertext, iv) = ring.encrypt(b"template", "k1").unwrap();
        ciphertext[0] ^= 0x01;
        assert!(matches!(
            ring.decrypt(&ciphertext, &iv, "k1"),
            Err(IdentityError::EncryptionError(_))
        ));
        assert!(ring.decrypt(&ciphertext, &iv[..8], "k1").is_err());
    }

    #[test]
    fn test_rotation_keeps_old_keys_readable() {
        let ring = KeyRing::generate("k1");
        let (old_ct, old_iv) = ring.encrypt(b"old", "k1").unwrap();

        let version = ring.rotate("k2", random_key()).unwrap();
        assert_eq!(version, 2);
        assert_eq!(ring.current_key_id(), "k2");
        assert_eq!(ring.decrypt(&old_ct, &old_iv, "k1").unwrap().as_slice(), b"old");

        let keys = ring.keys();
        assert_eq!(keys.len(), 2);
        assert!(keys.iter().any(|k| k.key_id == "k2" && k.is_current));
        assert!(ring.rotate("k2", random_key()).is_err());
    }

    #[test]
    fn test_from_spec() {
        let k1 = hex::encode([1u8; KEY_LEN]);
        let k2 = hex::encode([2u8; KEY_LEN]);
        let ring = KeyRing::from_spec(&format!("k1:{},k2:{}", k1, k2), None).unwrap();
        assert_eq!(ring.current_key_id(), "k2");

        let ring = KeyRing::from_spec(&format!("k1:{},k2:{}", k1, k2), Some("k1")).unwrap();
        assert_eq!(ring.current_key_id(), "k1");

        assert!(KeyRing::from_spec("k1:abcd", None).is_err());
        assert!(KeyRing::from_spec("", None).is_err());
        assert!(KeyRing::from_spec(&format!("k1:{}", k1), Some("k7")).is_err());
    }
}
