use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use uuid::Uuid;

use liaison_types::models::{Conversation, MessageKind, SenderRole};

/// One message as shown to the counsellor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedMessage {
    pub id: Uuid,
    pub sender_role: SenderRole,
    pub author_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    /// `None` for body-less notices.
    pub text: Option<String>,
    pub decrypt_failed: bool,
    pub kind: MessageKind,
    pub broadcast_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DayGroup {
    pub day: NaiveDate,
    pub messages: Vec<DecryptedMessage>,
}

/// Snapshot of one live conversation, handed to subscribers after every
/// change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationView {
    pub conversation: Conversation,
    /// Ascending by `created_at`, ties broken by id.
    pub messages: Vec<DecryptedMessage>,
    /// A listener was lost and not yet re-attached. Data is the last good
    /// snapshot.
    pub stale: bool,
    pub session_expired: bool,
}

impl ConversationView {
    pub fn has_unread(&self) -> bool {
        self.conversation.has_unread()
    }

    /// Beneficiary messages newer than the counsellor's last visit.
    pub fn unread_count(&self) -> usize {
        if !self.has_unread() {
            return 0;
        }
        let seen = self.conversation.seen_by_counsellor_at;
        self.messages
            .iter()
            .filter(|m| m.sender_role == SenderRole::Beneficiary)
            .filter(|m| seen.is_none_or(|seen| m.created_at > seen))
            .count()
    }

    pub fn last_message(&self) -> Option<&DecryptedMessage> {
        self.messages.last()
    }

    /// Messages bucketed by calendar day in `tz`, oldest day first.
    pub fn group_by_day<Tz: TimeZone>(&self, tz: &Tz) -> Vec<DayGroup> {
        let mut groups: Vec<DayGroup> = Vec::new();
        for message in &self.messages {
            let day = message.created_at.with_timezone(tz).date_naive();
            match groups.last_mut() {
                Some(group) if group.day == day => group.messages.push(message.clone()),
                _ => groups.push(DayGroup {
                    day,
                    messages: vec![message.clone()],
                }),
            }
        }
        groups
    }
}
