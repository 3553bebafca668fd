use aes_gcm::Aes256Gcm;
use aes_gcm::aead::KeyInit;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use rand::RngCore;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::OidcError;

pub(crate) const KEY_MATERIAL_LEN: usize = 32;
const KEY_ID_BYTES: usize = 16;

/// One symmetric key of the ring.
///
/// A key encrypts new cookies while it is the ring's current key and decrypts
/// cookies until `expiration_at`.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectionKey {
    pub id: String,
    #[serde(serialize_with = "encode_material", deserialize_with = "decode_material")]
    material: Vec<u8>,
    pub created_at: u64,
    pub activation_at: u64,
    pub expiration_at: u64,
}

impl ProtectionKey {
    pub fn generate(now: u64, activation_at: u64, lifetime_secs: u64) -> Self {
        let mut material = vec![0u8; KEY_MATERIAL_LEN];
        rand::rng().fill_bytes(&mut material);
        let mut id = [0u8; KEY_ID_BYTES];
        rand::rng().fill_bytes(&mut id);

        Self {
            id: hex::encode(id),
            material,
            created_at: now,
            activation_at,
            expiration_at: activation_at.saturating_add(lifetime_secs),
        }
    }

    pub fn is_active(&self, now: u64) -> bool {
        self.activation_at <= now && now < self.expiration_at
    }

    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.expiration_at
    }

    pub(crate) fn cipher(&self) -> Result<Aes256Gcm, OidcError> {
        Aes256Gcm::new_from_slice(&self.material).map_err(|_| OidcError::Crypto)
    }
}

/// Whether `id` has the shape of a generated key id.
pub(crate) fn is_key_id(id: &str) -> bool {
    id.len() == KEY_ID_BYTES * 2 && id.bytes().all(|b| b.is_ascii_hexdigit())
}

impl fmt::Debug for ProtectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtectionKey")
            .field("id", &self.id)
            .field("material", &"<redacted>")
            .field("created_at", &self.created_at)
            .field("activation_at", &self.activation_at)
            .field("expiration_at", &self.expiration_at)
            .finish()
    }
}

fn encode_material<S: Serializer>(material: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&STANDARD.encode(material))
}

fn decode_material<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    let encoded = String::deserialize(deserializer)?;
    let material = STANDARD
        .decode(encoded.trim())
        .map_err(serde::de::Error::custom)?;
    if material.len() != KEY_MATERIAL_LEN {
        return Err(serde::de::Error::custom(format!(
            "key material must be {KEY_MATERIAL_LEN} bytes, got {}",
            material.len()
        )));
    }
    Ok(material)
}

/// The set of keys shared by every instance that issues the session cookie.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyRing {
    keys: Vec<ProtectionKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_keys(keys: impl IntoIterator<Item = ProtectionKey>) -> Self {
        let mut ring = Self::new();
        for key in keys {
            ring.insert(key);
        }
        ring
    }

    pub fn keys(&self) -> &[ProtectionKey] {
        &self.keys
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Adds `key` unless a key with the same id is already present.
    pub fn insert(&mut self, key: ProtectionKey) -> bool {
        if self.keys.iter().any(|k| k.id == key.id) {
            return false;
        }
        self.keys.push(key);
        true
    }

    pub fn merge(&mut self, other: &KeyRing) {
        for key in &other.keys {
            self.insert(key.clone());
        }
    }

    /// The key new cookies are encrypted with: the active key with the latest
    /// activation, ties broken by creation time and then id so every instance
    /// picks the same one from the same ring.
    pub fn current(&self, now: u64) -> Option<&ProtectionKey> {
        self.keys
            .iter()
            .filter(|k| k.is_active(now))
            .max_by(|a, b| {
                a.activation_at
                    .cmp(&b.activation_at)
                    .then(a.created_at.cmp(&b.created_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
    }

    /// Any non-expired key with this id, current or not.
    pub fn decryption_key(&self, id: &str, now: u64) -> Option<&ProtectionKey> {
        self.keys.iter().find(|k| k.id == id && !k.is_expired(now))
    }

    /// Whether a new key has to be provisioned: there is no current key, or
    /// the current one expires within `rotation_lead_secs` and nothing newer
    /// has been provisioned yet.
    pub fn needs_new_key(&self, now: u64, rotation_lead_secs: u64) -> bool {
        let Some(current) = self.current(now) else {
            return true;
        };

        if current.expiration_at.saturating_sub(now) > rotation_lead_secs {
            return false;
        }

        !self
            .keys
            .iter()
            .any(|k| k.activation_at > current.activation_at && !k.is_expired(now))
    }

    /// Ids of keys that expired more than `max_session_lifetime_secs` ago. No
    /// cookie sealed with them can still be in circulation.
    pub fn prunable(&self, now: u64, max_session_lifetime_secs: u64) -> Vec<String> {
        self.keys
            .iter()
            .filter(|k| now >= k.expiration_at.saturating_add(max_session_lifetime_secs))
            .map(|k| k.id.clone())
            .collect()
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.keys.len();
        self.keys.retain(|k| k.id != id);
        self.keys.len() != before
    }
}
