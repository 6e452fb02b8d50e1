use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use liaison_types::models::{BroadcastMessage, MessageKind};
use liaison_types::store::{BroadcastDirectory, DirectoryError};

use crate::conversation::ConversationStore;
use crate::error::SyncError;
use crate::keys::KeyResolver;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutOutcome {
    pub broadcast_id: Uuid,
    pub delivered: BTreeSet<Uuid>,
    pub failed: BTreeSet<Uuid>,
}

#[derive(Debug, Clone, Copy)]
enum FanoutPhase {
    Composing,
    Encrypting(Uuid),
    Writing(Uuid),
    Recorded,
}

impl fmt::Display for FanoutPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Composing => write!(f, "composing"),
            Self::Encrypting(id) => write!(f, "encrypting for {}", id),
            Self::Writing(id) => write!(f, "writing to {}", id),
            Self::Recorded => write!(f, "recorded"),
        }
    }
}

/// Sends one message to every beneficiary of a broadcast list, each copy
/// encrypted under its own conversation key.
///
/// There is no cross-conversation transaction: every recipient succeeds or
/// fails on its own, and the audit record lists only those that received the
/// message.
pub struct BroadcastFanoutService {
    directory: Arc<dyn BroadcastDirectory>,
    conversations: Arc<ConversationStore>,
    keys: Arc<dyn KeyResolver>,
}

impl BroadcastFanoutService {
    pub fn new(
        directory: Arc<dyn BroadcastDirectory>,
        conversations: Arc<ConversationStore>,
        keys: Arc<dyn KeyResolver>,
    ) -> Self {
        Self {
            directory,
            conversations,
            keys,
        }
    }

    pub async fn send(
        &self,
        list_id: Uuid,
        author_id: Uuid,
        content: &str,
    ) -> Result<FanoutOutcome, SyncError> {
        if content.trim().is_empty() {
            return Err(SyncError::InvalidMessage("message is empty"));
        }
        let list = self.directory.get_list(list_id).await?;
        if list.owner_id != author_id {
            return Err(DirectoryError::NotOwner(list_id).into());
        }

        let broadcast_id = Uuid::new_v4();
        let mut phase = FanoutPhase::Composing;
        debug!("Broadcast {}: {}", broadcast_id, phase);

        let recipients: BTreeSet<Uuid> = list.beneficiary_ids.iter().copied().collect();
        let mut delivered = BTreeSet::new();
        let mut failed = BTreeSet::new();
        let mut aborted = None;

        for beneficiary_id in recipients {
            let conversation = self.conversations.conversation(beneficiary_id);

            phase = FanoutPhase::Encrypting(beneficiary_id);
            debug!("Broadcast {}: {}", broadcast_id, phase);
            let key = match self.keys.conversation_key(&conversation).await {
                Ok(key) => key,
                Err(e) if e.is_fatal() => {
                    aborted = Some(e);
                    break;
                }
                Err(e) => {
                    warn!("Broadcast {} skipped {}: {}", broadcast_id, beneficiary_id, e);
                    failed.insert(beneficiary_id);
                    continue;
                }
            };

            phase = FanoutPhase::Writing(beneficiary_id);
            debug!("Broadcast {}: {}", broadcast_id, phase);
            match self
                .conversations
                .deliver(&conversation, &key, content, MessageKind::Plain, Some(broadcast_id))
                .await
            {
                Ok(_) => {
                    delivered.insert(beneficiary_id);
                }
                Err(e) if e.is_fatal() => {
                    aborted = Some(e);
                    break;
                }
                Err(e) => {
                    warn!("Broadcast {} not delivered to {}: {}", broadcast_id, beneficiary_id, e);
                    failed.insert(beneficiary_id);
                }
            }
        }

        let record = BroadcastMessage {
            id: broadcast_id,
            list_id,
            author_id,
            created_at: Utc::now(),
            content: content.to_string(),
            delivered_to: delivered.clone(),
        };
        match self.directory.record_broadcast(&record).await {
            Ok(()) => {
                phase = FanoutPhase::Recorded;
                debug!("Broadcast {}: {}", broadcast_id, phase);
            }
            // Copies already sent cannot be recalled; the outcome still
            // stands without its audit record.
            Err(e) => error!("Broadcast {} sent but not recorded: {}", broadcast_id, e),
        }

        if let Some(e) = aborted {
            warn!(
                "Broadcast {} aborted after {} deliveries: {}",
                broadcast_id,
                delivered.len(),
                e
            );
            return Err(e);
        }

        info!(
            "Broadcast {} to list {}: {} delivered, {} failed",
            broadcast_id,
            list_id,
            delivered.len(),
            failed.len()
        );
        Ok(FanoutOutcome {
            broadcast_id,
            delivered,
            failed,
        })
    }
}
