use std::sync::Arc;

use aes_gcm::{
    Aes256Gcm, Key, Nonce,
    aead::{Aead, KeyInit, OsRng, rand_core::RngCore},
};
use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use liaison_types::models::EncryptedPayload;
use liaison_types::report::{ErrorReport, ErrorReporter};

use crate::keys::{ConversationKey, IV_SIZE};

/// Shown in place of a message body that could not be decrypted.
pub const DECRYPTION_FAILED: &str = "decryption failed";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CryptoError {
    #[error("invalid key: {0}")]
    InvalidKey(String),
    #[error("iv must be 12 bytes")]
    InvalidIv,
    #[error("payload is not valid base64: {0}")]
    Encoding(String),
    #[error("cipher failure: {0}")]
    Cipher(String),
    #[error("plaintext is not valid UTF-8")]
    Utf8,
}

/// Where a ciphertext came from, attached to failure reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DecryptOrigin {
    pub conversation_id: Option<Uuid>,
    pub message_id: Option<Uuid>,
}

/// Outcome of a reported decryption.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Opened {
    Text(String),
    Failed,
}

impl Opened {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed)
    }

    pub fn into_text(self) -> String {
        match self {
            Self::Text(text) => text,
            Self::Failed => DECRYPTION_FAILED.to_string(),
        }
    }
}

/// Symmetric encryption of message bodies.
///
/// Keys are borrowed per call and never stored. Decryption failures on the
/// reporting paths are sent to the observability collaborator and replaced by
/// [`DECRYPTION_FAILED`], so a single garbled message cannot break a feed.
#[derive(Clone)]
pub struct CryptoEngine {
    reporter: Arc<dyn ErrorReporter>,
}

impl CryptoEngine {
    pub fn new(reporter: Arc<dyn ErrorReporter>) -> Self {
        Self { reporter }
    }

    /// Encrypt with a fresh random 12-byte IV.
    pub fn encrypt(
        &self,
        plaintext: &str,
        key: &ConversationKey,
    ) -> Result<EncryptedPayload, CryptoError> {
        let mut iv = [0u8; IV_SIZE];
        OsRng.fill_bytes(&mut iv);

        let cipher_text = seal(plaintext.as_bytes(), key, &iv)?;
        Ok(EncryptedPayload {
            cipher_text: BASE64.encode(cipher_text),
            iv: BASE64.encode(iv),
        })
    }

    /// Encrypt under a caller-chosen IV, returning base64 cipher text.
    ///
    /// Reusing an IV with the same key leaks the XOR of the plaintexts and
    /// breaks GCM authentication. Only for flows that must reproduce an exact
    /// ciphertext; everything else goes through [`CryptoEngine::encrypt`].
    pub fn encrypt_with_explicit_iv(
        &self,
        plaintext: &str,
        key: &ConversationKey,
        iv: &[u8],
    ) -> Result<String, CryptoError> {
        let iv: &[u8; IV_SIZE] = iv.try_into().map_err(|_| CryptoError::InvalidIv)?;
        let cipher_text = seal(plaintext.as_bytes(), key, iv)?;
        Ok(BASE64.encode(cipher_text))
    }

    /// Fallible decryption. Nothing is reported.
    pub fn try_decrypt(
        &self,
        payload: &EncryptedPayload,
        key: &ConversationKey,
    ) -> Result<String, CryptoError> {
        let cipher_text = BASE64
            .decode(&payload.cipher_text)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let iv = BASE64
            .decode(&payload.iv)
            .map_err(|e| CryptoError::Encoding(e.to_string()))?;
        let iv: [u8; IV_SIZE] = iv.try_into().map_err(|_| CryptoError::InvalidIv)?;

        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&iv), cipher_text.as_slice())
            .map_err(|e| CryptoError::Cipher(e.to_string()))?;

        String::from_utf8(plaintext).map_err(|_| CryptoError::Utf8)
    }

    /// Decrypt, or return [`DECRYPTION_FAILED`] after reporting the failure.
    pub fn decrypt(&self, payload: &EncryptedPayload, key: &ConversationKey) -> String {
        self.open(payload, key, DecryptOrigin::default()).into_text()
    }

    /// Decrypt with origin details for the failure report.
    pub fn open(
        &self,
        payload: &EncryptedPayload,
        key: &ConversationKey,
        origin: DecryptOrigin,
    ) -> Opened {
        match self.try_decrypt(payload, key) {
            Ok(text) => Opened::Text(text),
            Err(e) => {
                self.report_failure(origin, e.to_string());
                Opened::Failed
            }
        }
    }

    /// Report a failure that happened before any cipher work, such as a
    /// missing key or a malformed document.
    pub fn report_failure(&self, origin: DecryptOrigin, reason: String) {
        warn!(
            "Decryption failed (conversation {:?}, message {:?}): {}",
            origin.conversation_id, origin.message_id, reason
        );
        self.reporter.report(ErrorReport::DecryptFailure {
            conversation_id: origin.conversation_id,
            message_id: origin.message_id,
            reason,
        });
    }
}

fn seal(plaintext: &[u8], key: &ConversationKey, iv: &[u8; IV_SIZE]) -> Result<Vec<u8>, CryptoError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
    cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|e| CryptoError::Cipher(e.to_string()))
}
