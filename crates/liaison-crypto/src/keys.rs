use aes_gcm::aead::OsRng;
use aes_gcm::aead::rand_core::RngCore;
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use hkdf::Hkdf;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::encrypt::CryptoError;

pub const KEY_SIZE: usize = 32;
pub const IV_SIZE: usize = 12;

const CONVERSATION_INFO: &[u8] = b"liaison-conversation";

/// Counsellor key material from the domain API. Held in memory only.
#[derive(Clone)]
pub struct KeyMaterial([u8; KEY_SIZE]);

impl KeyMaterial {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    /// Decode the base64 key returned by the domain API.
    pub fn from_base64(encoded: &str) -> Result<Self, CryptoError> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let key: [u8; KEY_SIZE] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidKey("expected 32 bytes".into()))?;
        Ok(Self(key))
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(self.0)
    }

    /// Short identifier safe to log.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }

    /// HKDF-SHA256(material, salt = conversation id, info = "liaison-conversation").
    pub fn derive_conversation_key(&self, conversation_id: &Uuid) -> Result<ConversationKey, CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(conversation_id.as_bytes()), &self.0);
        let mut key = [0u8; KEY_SIZE];
        hk.expand(CONVERSATION_INFO, &mut key)
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        Ok(ConversationKey(key))
    }
}

impl std::fmt::Debug for KeyMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "KeyMaterial({})", self.fingerprint())
    }
}

/// AES-256 key for one conversation.
#[derive(Clone, PartialEq, Eq)]
pub struct ConversationKey([u8; KEY_SIZE]);

impl ConversationKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }

    pub fn fingerprint(&self) -> String {
        fingerprint(&self.0)
    }
}

impl std::fmt::Debug for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ConversationKey({})", self.fingerprint())
    }
}

fn fingerprint(key: &[u8; KEY_SIZE]) -> String {
    let digest = Sha256::digest(key);
    hex::encode(&digest[..6])
}
