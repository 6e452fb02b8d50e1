use std::collections::BTreeSet;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{Conversation, MessageKind, SenderRole};

// -- Portfolio --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SyncPortfolioRequest {
    pub beneficiary_ids: BTreeSet<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct SyncPortfolioResponse {
    pub added: BTreeSet<Uuid>,
    pub removed: BTreeSet<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct PortfolioResponse {
    pub has_unread: bool,
    pub conversations: Vec<ConversationSummary>,
}

#[derive(Debug, Serialize)]
pub struct ConversationSummary {
    #[serde(flatten)]
    pub conversation: Conversation,
    pub has_unread: bool,
    pub unread_count: usize,
    pub stale: bool,
}

// -- Conversations --

#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    pub summary: ConversationSummary,
    pub days: Vec<DayResponse>,
}

#[derive(Debug, Serialize)]
pub struct DayResponse {
    pub day: NaiveDate,
    pub messages: Vec<MessageResponse>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub sender_role: SenderRole,
    pub author_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub text: Option<String>,
    pub decrypt_failed: bool,
    #[serde(flatten)]
    pub kind: MessageKind,
    pub broadcast_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SendMessageRequest {
    pub content: String,
    #[serde(default)]
    pub offer: Option<SharedOffer>,
    #[serde(default)]
    pub event: Option<SharedEvent>,
    #[serde(default)]
    pub attachment: Option<SharedAttachment>,
}

#[derive(Debug, Deserialize)]
pub struct SharedOffer {
    pub offer_id: String,
    pub title: String,
}

#[derive(Debug, Deserialize)]
pub struct SharedEvent {
    pub event_id: String,
    pub title: String,
    pub starts_at: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
pub struct SharedAttachment {
    pub attachment_id: String,
    pub file_name: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FlagRequest {
    pub flagged: bool,
}

// -- Broadcast lists --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateListRequest {
    pub title: String,
    #[serde(default)]
    pub beneficiary_ids: Vec<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AddBeneficiaryRequest {
    pub beneficiary_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BroadcastRequest {
    pub content: String,
}

#[derive(Debug, Serialize)]
pub struct BroadcastResponse {
    pub broadcast_id: Uuid,
    pub delivered: BTreeSet<Uuid>,
    pub failed: BTreeSet<Uuid>,
}
