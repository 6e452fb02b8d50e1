//! Persisted shapes in the real-time store.
//!
//! Field names are part of the wire contract shared with the beneficiary
//! application and must stay camelCase.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use thiserror::Error;
use uuid::Uuid;

use crate::models::{EncryptedPayload, Message, MessageKind, SenderRole};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum KindTag {
    Plain,
    OfferShare,
    EventShare,
    Attachment,
    SystemNotice,
}

impl KindTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Plain => "plain",
            Self::OfferShare => "offerShare",
            Self::EventShare => "eventShare",
            Self::Attachment => "attachment",
            Self::SystemNotice => "systemNotice",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "plain" => Some(Self::Plain),
            "offerShare" => Some(Self::OfferShare),
            "eventShare" => Some(Self::EventShare),
            "attachment" => Some(Self::Attachment),
            "systemNotice" => Some(Self::SystemNotice),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageDocument {
    pub sender_role: SenderRole,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    pub kind: KindTag,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind_payload: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub broadcast_id: Option<Uuid>,
}

#[derive(Debug, Error)]
pub enum DocumentError {
    #[error("encrypted body and iv must be present together")]
    HalfEncrypted,
    #[error("{0} message has no encrypted body")]
    MissingBody(&'static str),
    #[error("{kind} payload is malformed: {source}")]
    BadPayload {
        kind: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OfferPayload {
    offer_id: String,
    title: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventPayload {
    event_id: String,
    title: String,
    starts_at: DateTime<Utc>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AttachmentPayload {
    attachment_id: String,
    file_name: String,
}

#[derive(Deserialize)]
struct NoticePayload {
    notice: String,
}

fn payload<T: for<'de> Deserialize<'de>>(
    kind: KindTag,
    value: Option<Value>,
) -> Result<T, DocumentError> {
    serde_json::from_value(value.unwrap_or(Value::Null)).map_err(|source| {
        DocumentError::BadPayload {
            kind: kind.as_str(),
            source,
        }
    })
}

impl MessageDocument {
    pub fn from_message(message: &Message) -> Self {
        let (kind, kind_payload) = match &message.kind {
            MessageKind::Plain => (KindTag::Plain, None),
            MessageKind::OfferShare { offer_id, title } => (
                KindTag::OfferShare,
                Some(json!({ "offerId": offer_id, "title": title })),
            ),
            MessageKind::EventShare {
                event_id,
                title,
                starts_at,
            } => (
                KindTag::EventShare,
                Some(json!({ "eventId": event_id, "title": title, "startsAt": starts_at })),
            ),
            MessageKind::Attachment {
                attachment_id,
                file_name,
            } => (
                KindTag::Attachment,
                Some(json!({ "attachmentId": attachment_id, "fileName": file_name })),
            ),
            MessageKind::SystemNotice { notice } => {
                (KindTag::SystemNotice, Some(json!({ "notice": notice })))
            }
        };

        Self {
            sender_role: message.sender_role,
            author_id: message.author_id,
            created_at: message.created_at,
            encrypted_body: message.body.as_ref().map(|b| b.cipher_text.clone()),
            iv: message.body.as_ref().map(|b| b.iv.clone()),
            kind,
            kind_payload,
            broadcast_id: message.broadcast_id,
        }
    }

    pub fn into_message(self, id: Uuid, conversation_id: Uuid) -> Result<Message, DocumentError> {
        let body = match (self.encrypted_body, self.iv) {
            (Some(cipher_text), Some(iv)) => Some(EncryptedPayload { cipher_text, iv }),
            (None, None) => None,
            _ => return Err(DocumentError::HalfEncrypted),
        };

        let kind = match self.kind {
            KindTag::Plain => MessageKind::Plain,
            KindTag::OfferShare => {
                let p: OfferPayload = payload(self.kind, self.kind_payload)?;
                MessageKind::OfferShare {
                    offer_id: p.offer_id,
                    title: p.title,
                }
            }
            KindTag::EventShare => {
                let p: EventPayload = payload(self.kind, self.kind_payload)?;
                MessageKind::EventShare {
                    event_id: p.event_id,
                    title: p.title,
                    starts_at: p.starts_at,
                }
            }
            KindTag::Attachment => {
                let p: AttachmentPayload = payload(self.kind, self.kind_payload)?;
                MessageKind::Attachment {
                    attachment_id: p.attachment_id,
                    file_name: p.file_name,
                }
            }
            KindTag::SystemNotice => {
                let p: NoticePayload = payload(self.kind, self.kind_payload)?;
                MessageKind::SystemNotice { notice: p.notice }
            }
        };

        if body.is_none() && kind.requires_body() {
            return Err(DocumentError::MissingBody(self.kind.as_str()));
        }

        Ok(Message {
            id,
            conversation_id,
            sender_role: self.sender_role,
            author_id: self.author_id,
            created_at: self.created_at,
            body,
            kind,
            broadcast_id: self.broadcast_id,
        })
    }
}

/// Conversation summary document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConversationDocument {
    pub last_message_preview_encrypted: Option<EncryptedPayload>,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_sender_role: Option<SenderRole>,
    pub flagged: bool,
    pub seen_by_counsellor_at: Option<DateTime<Utc>>,
    pub seen_by_beneficiary_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessage {
    pub preview_encrypted: EncryptedPayload,
    pub at: DateTime<Utc>,
    pub sender_role: SenderRole,
}

/// Partial upsert of a conversation summary. `None` fields are left as stored.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationPatch {
    pub last_message: Option<LastMessage>,
    pub flagged: Option<bool>,
    pub seen_by_counsellor_at: Option<DateTime<Utc>>,
    pub seen_by_beneficiary_at: Option<DateTime<Utc>>,
}

impl ConversationPatch {
    pub fn flagged(flagged: bool) -> Self {
        Self {
            flagged: Some(flagged),
            ..Default::default()
        }
    }

    pub fn seen_by_counsellor(at: DateTime<Utc>) -> Self {
        Self {
            seen_by_counsellor_at: Some(at),
            ..Default::default()
        }
    }

    pub fn apply(&self, doc: &mut ConversationDocument) {
        if let Some(last) = &self.last_message {
            doc.last_message_preview_encrypted = Some(last.preview_encrypted.clone());
            doc.last_message_at = Some(last.at);
            doc.last_sender_role = Some(last.sender_role);
        }
        if let Some(flagged) = self.flagged {
            doc.flagged = flagged;
        }
        if let Some(at) = self.seen_by_counsellor_at {
            doc.seen_by_counsellor_at = Some(at);
        }
        if let Some(at) = self.seen_by_beneficiary_at {
            doc.seen_by_beneficiary_at = Some(at);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn body() -> EncryptedPayload {
        EncryptedPayload {
            cipher_text: "Y2lwaGVy".into(),
            iv: "aXY=".into(),
        }
    }

    fn message(kind: MessageKind, body: Option<EncryptedPayload>) -> Message {
        Message {
            id: Uuid::new_v4(),
            conversation_id: Uuid::new_v4(),
            sender_role: SenderRole::Counsellor,
            author_id: Some(Uuid::new_v4()),
            created_at: Utc::now(),
            body,
            kind,
            broadcast_id: None,
        }
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let msg = message(
            MessageKind::Attachment {
                attachment_id: "att-1".into(),
                file_name: "cv.pdf".into(),
            },
            Some(body()),
        );
        let value = serde_json::to_value(MessageDocument::from_message(&msg)).unwrap();
        assert_eq!(value["senderRole"], "counsellor");
        assert_eq!(value["encryptedBody"], "Y2lwaGVy");
        assert_eq!(value["iv"], "aXY=");
        assert_eq!(value["kind"], "attachment");
        assert_eq!(value["kindPayload"]["fileName"], "cv.pdf");
        assert!(value.get("broadcastId").is_none());

        let summary = serde_json::to_value(ConversationDocument::default()).unwrap();
        for field in [
            "lastMessagePreviewEncrypted",
            "lastMessageAt",
            "lastSenderRole",
            "flagged",
            "seenByCounsellorAt",
            "seenByBeneficiaryAt",
        ] {
            assert!(summary.get(field).is_some(), "missing {field}");
        }
    }

    #[test]
    fn kinds_survive_document_conversion() {
        let kinds = [
            MessageKind::Plain,
            MessageKind::OfferShare {
                offer_id: "o-42".into(),
                title: "Cuisinier".into(),
            },
            MessageKind::EventShare {
                event_id: "e-7".into(),
                title: "Atelier CV".into(),
                starts_at: Utc::now(),
            },
        ];
        for kind in kinds {
            let msg = message(kind, Some(body()));
            let doc = MessageDocument::from_message(&msg);
            let back = doc.into_message(msg.id, msg.conversation_id).unwrap();
            assert_eq!(back, msg);
        }
    }

    #[test]
    fn system_notice_may_omit_body() {
        let msg = message(
            MessageKind::SystemNotice {
                notice: "Conseiller modifié".into(),
            },
            None,
        );
        let doc = MessageDocument::from_message(&msg);
        assert!(doc.into_message(msg.id, msg.conversation_id).is_ok());
    }

    #[test]
    fn plain_message_without_body_is_rejected() {
        let msg = message(MessageKind::Plain, None);
        let doc = MessageDocument::from_message(&msg);
        assert!(matches!(
            doc.into_message(msg.id, msg.conversation_id),
            Err(DocumentError::MissingBody("plain"))
        ));
    }

    #[test]
    fn half_encrypted_document_is_rejected() {
        let mut doc = MessageDocument::from_message(&message(MessageKind::Plain, Some(body())));
        doc.iv = None;
        assert!(matches!(
            doc.into_message(Uuid::new_v4(), Uuid::new_v4()),
            Err(DocumentError::HalfEncrypted)
        ));
    }

    #[test]
    fn patch_leaves_unset_fields_alone() {
        let seen = Utc::now();
        let mut doc = ConversationDocument {
            flagged: true,
            ..Default::default()
        };
        ConversationPatch::seen_by_counsellor(seen).apply(&mut doc);
        assert!(doc.flagged);
        assert_eq!(doc.seen_by_counsellor_at, Some(seen));

        ConversationPatch::flagged(false).apply(&mut doc);
        assert!(!doc.flagged);
        assert_eq!(doc.seen_by_counsellor_at, Some(seen));
    }
}
