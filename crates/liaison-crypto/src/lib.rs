//! Liaison Crypto Library
//!
//! Message bodies are sealed with AES-256-GCM under a per-conversation key.
//! Conversation keys are derived with HKDF-SHA256 from the counsellor key
//! material handed out by the domain API, so no two threads share a key.

pub mod encrypt;
pub mod keys;

pub use encrypt::{CryptoEngine, CryptoError, DECRYPTION_FAILED, DecryptOrigin, Opened};
pub use keys::{ConversationKey, IV_SIZE, KEY_SIZE, KeyMaterial};
