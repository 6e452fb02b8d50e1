use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Namespace for deterministic conversation ids.
const CONVERSATION_NAMESPACE: Uuid = Uuid::from_u128(0x6c69_6169_736f_6e00_8000_0000_0000_0001);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    Counsellor,
    Beneficiary,
}

impl SenderRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counsellor => "counsellor",
            Self::Beneficiary => "beneficiary",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "counsellor" => Some(Self::Counsellor),
            "beneficiary" => Some(Self::Beneficiary),
            _ => None,
        }
    }
}

/// Addresses one counselor↔beneficiary thread.
///
/// The conversation id is a UUID v5 of the pair, so a listener can be attached
/// before the first message creates the conversation document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConversationRef {
    pub counsellor_id: Uuid,
    pub beneficiary_id: Uuid,
    pub conversation_id: Uuid,
}

impl ConversationRef {
    pub fn new(counsellor_id: Uuid, beneficiary_id: Uuid) -> Self {
        let mut name = [0u8; 32];
        name[..16].copy_from_slice(counsellor_id.as_bytes());
        name[16..].copy_from_slice(beneficiary_id.as_bytes());
        Self {
            counsellor_id,
            beneficiary_id,
            conversation_id: Uuid::new_v5(&CONVERSATION_NAMESPACE, &name),
        }
    }
}

/// Base64 cipher text and IV. Always travel together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptedPayload {
    pub cipher_text: String,
    pub iv: String,
}

/// What a message carries besides its text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MessageKind {
    Plain,
    OfferShare {
        offer_id: String,
        title: String,
    },
    EventShare {
        event_id: String,
        title: String,
        starts_at: DateTime<Utc>,
    },
    Attachment {
        attachment_id: String,
        file_name: String,
    },
    SystemNotice {
        notice: String,
    },
}

impl MessageKind {
    /// System notices are the only kind allowed to travel without a body.
    pub fn requires_body(&self) -> bool {
        !matches!(self, Self::SystemNotice { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: Uuid,
    pub conversation_id: Uuid,
    pub sender_role: SenderRole,
    pub author_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub body: Option<EncryptedPayload>,
    pub kind: MessageKind,
    /// Set when the message is one recipient's copy of a broadcast.
    pub broadcast_id: Option<Uuid>,
}

/// Decrypted state of one conversation summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Conversation {
    pub id: Uuid,
    pub beneficiary_id: Uuid,
    pub last_message_preview: Option<String>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sender_role: Option<SenderRole>,
    pub flagged: bool,
    pub seen_by_counsellor_at: Option<DateTime<Utc>>,
    pub seen_by_beneficiary_at: Option<DateTime<Utc>>,
}

impl Conversation {
    pub fn empty(conversation: &ConversationRef) -> Self {
        Self {
            id: conversation.conversation_id,
            beneficiary_id: conversation.beneficiary_id,
            last_message_preview: None,
            last_message_at: None,
            last_sender_role: None,
            flagged: false,
            seen_by_counsellor_at: None,
            seen_by_beneficiary_at: None,
        }
    }

    /// True only when the beneficiary spoke last and the counselor has not
    /// seen that message yet.
    pub fn has_unread(&self) -> bool {
        match (self.last_sender_role, self.last_message_at) {
            (Some(SenderRole::Beneficiary), Some(last)) => {
                self.seen_by_counsellor_at.is_none_or(|seen| last > seen)
            }
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastList {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub title: String,
    /// Display order; delivery ignores it.
    pub beneficiary_ids: Vec<Uuid>,
}

/// Plaintext audit copy of one broadcast send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BroadcastMessage {
    pub id: Uuid,
    pub list_id: Uuid,
    pub author_id: Uuid,
    pub created_at: DateTime<Utc>,
    pub content: String,
    pub delivered_to: BTreeSet<Uuid>,
}
