use std::sync::Arc;

use async_trait::async_trait;

use liaison_crypto::ConversationKey;
use liaison_types::models::ConversationRef;

use crate::credentials::CredentialBroker;
use crate::error::SyncError;

/// Source of per-conversation keys. Keys are fetched per operation and never
/// cached by callers.
#[async_trait]
pub trait KeyResolver: Send + Sync {
    async fn conversation_key(&self, conversation: &ConversationRef) -> Result<ConversationKey, SyncError>;
}

/// Derives each conversation key from the key material issued with the
/// current real-time credentials.
pub struct DerivedKeyResolver {
    broker: Arc<CredentialBroker>,
}

impl DerivedKeyResolver {
    pub fn new(broker: Arc<CredentialBroker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl KeyResolver for DerivedKeyResolver {
    async fn conversation_key(&self, conversation: &ConversationRef) -> Result<ConversationKey, SyncError> {
        let creds = self.broker.refresh_if_needed().await?;
        creds
            .key
            .derive_conversation_key(&conversation.conversation_id)
            .map_err(|e| SyncError::KeyUnavailable {
                beneficiary_id: conversation.beneficiary_id,
                reason: e.to_string(),
            })
    }
}
