use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{FixedOffset, Utc};
use serde::Deserialize;
use uuid::Uuid;

use liaison_sync::{ConversationView, DecryptedMessage, OutgoingMessage};
use liaison_types::api::{
    ConversationResponse, ConversationSummary, DayResponse, FlagRequest, MessageResponse,
    SendMessageRequest,
};
use liaison_types::models::MessageKind;

use crate::error::reject;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct DayQuery {
    /// Offset of the viewer's timezone, used to cut the thread into days.
    #[serde(default)]
    pub utc_offset_minutes: i32,
}

pub async fn get_conversation(
    State(state): State<AppState>,
    Path(beneficiary_id): Path<Uuid>,
    Query(query): Query<DayQuery>,
) -> Result<impl IntoResponse, StatusCode> {
    let view = state
        .portfolio
        .conversation(beneficiary_id)
        .ok_or(StatusCode::NOT_FOUND)?;
    let tz = query
        .utc_offset_minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or(StatusCode::BAD_REQUEST)?;

    let days = view
        .group_by_day(&tz)
        .into_iter()
        .map(|group| DayResponse {
            day: group.day,
            messages: group.messages.iter().map(message_response).collect(),
        })
        .collect();

    Ok(Json(ConversationResponse {
        summary: summary(&view),
        days,
    }))
}

pub async fn send_message(
    State(state): State<AppState>,
    Path(beneficiary_id): Path<Uuid>,
    Json(mut req): Json<SendMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let kind = outgoing_kind(&mut req)?;

    let message = state
        .conversations
        .send_message(
            beneficiary_id,
            OutgoingMessage {
                kind,
                content: req.content.clone(),
            },
        )
        .await
        .map_err(reject)?;

    Ok((
        StatusCode::CREATED,
        Json(MessageResponse {
            id: message.id,
            sender_role: message.sender_role,
            author_id: message.author_id,
            created_at: message.created_at,
            text: Some(req.content),
            decrypt_failed: false,
            kind: message.kind,
            broadcast_id: None,
        }),
    ))
}

/// At most one shared item rides along with the text.
fn outgoing_kind(req: &mut SendMessageRequest) -> Result<MessageKind, StatusCode> {
    match (req.offer.take(), req.event.take(), req.attachment.take()) {
        (None, None, None) => Ok(MessageKind::Plain),
        (Some(offer), None, None) => Ok(MessageKind::OfferShare {
            offer_id: offer.offer_id,
            title: offer.title,
        }),
        (None, Some(event), None) => Ok(MessageKind::EventShare {
            event_id: event.event_id,
            title: event.title,
            starts_at: event.starts_at,
        }),
        (None, None, Some(attachment)) => Ok(MessageKind::Attachment {
            attachment_id: attachment.attachment_id,
            file_name: attachment.file_name,
        }),
        _ => Err(StatusCode::BAD_REQUEST),
    }
}

pub async fn mark_seen(
    State(state): State<AppState>,
    Path(beneficiary_id): Path<Uuid>,
) -> StatusCode {
    let conversation = state.conversations.conversation(beneficiary_id);
    state
        .conversations
        .mark_seen_by_counsellor(&conversation, Utc::now())
        .await;
    StatusCode::NO_CONTENT
}

pub async fn set_flag(
    State(state): State<AppState>,
    Path(beneficiary_id): Path<Uuid>,
    Json(req): Json<FlagRequest>,
) -> Result<StatusCode, StatusCode> {
    state
        .portfolio
        .set_flagged(beneficiary_id, req.flagged)
        .await
        .map_err(reject)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) fn summary(view: &ConversationView) -> ConversationSummary {
    ConversationSummary {
        conversation: view.conversation.clone(),
        has_unread: view.has_unread(),
        unread_count: view.unread_count(),
        stale: view.stale,
    }
}

fn message_response(message: &DecryptedMessage) -> MessageResponse {
    MessageResponse {
        id: message.id,
        sender_role: message.sender_role,
        author_id: message.author_id,
        created_at: message.created_at,
        text: message.text.clone(),
        decrypt_failed: message.decrypt_failed,
        kind: message.kind.clone(),
        broadcast_id: message.broadcast_id,
    }
}
