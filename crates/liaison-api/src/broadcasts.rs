use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::info;
use uuid::Uuid;

use liaison_types::api::{
    AddBeneficiaryRequest, BroadcastRequest, BroadcastResponse, CreateListRequest,
};
use liaison_types::store::DirectoryError;

use crate::error::{reject, reject_directory};
use crate::state::AppState;

pub async fn create_list(
    State(state): State<AppState>,
    Json(req): Json<CreateListRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let title = req.title.trim();
    if title.is_empty() || title.len() > 100 {
        return Err(StatusCode::BAD_REQUEST);
    }
    let list = state
        .directory
        .create_list(state.counsellor_id, title, &req.beneficiary_ids)
        .await
        .map_err(reject_directory)?;
    Ok((StatusCode::CREATED, Json(list)))
}

pub async fn get_lists(State(state): State<AppState>) -> Result<impl IntoResponse, StatusCode> {
    let lists = state
        .directory
        .lists_for(state.counsellor_id)
        .await
        .map_err(reject_directory)?;
    Ok(Json(lists))
}

pub async fn add_beneficiary(
    State(state): State<AppState>,
    Path(list_id): Path<Uuid>,
    Json(req): Json<AddBeneficiaryRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let list = state
        .directory
        .add_beneficiary(state.counsellor_id, list_id, req.beneficiary_id)
        .await
        .map_err(reject_directory)?;
    Ok(Json(list))
}

pub async fn remove_beneficiary(
    State(state): State<AppState>,
    Path((list_id, beneficiary_id)): Path<(Uuid, Uuid)>,
) -> Result<impl IntoResponse, StatusCode> {
    let list = state
        .directory
        .remove_beneficiary(state.counsellor_id, list_id, beneficiary_id)
        .await
        .map_err(reject_directory)?;
    Ok(Json(list))
}

pub async fn delete_list(
    State(state): State<AppState>,
    Path(list_id): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    state
        .directory
        .delete_list(state.counsellor_id, list_id)
        .await
        .map_err(reject_directory)?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn send_broadcast(
    State(state): State<AppState>,
    Path(list_id): Path<Uuid>,
    Json(req): Json<BroadcastRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let outcome = state
        .fanout
        .send(list_id, state.counsellor_id, &req.content)
        .await
        .map_err(reject)?;
    info!(
        "Broadcast {} on list {}: {} delivered, {} failed",
        outcome.broadcast_id,
        list_id,
        outcome.delivered.len(),
        outcome.failed.len()
    );
    Ok(Json(BroadcastResponse {
        broadcast_id: outcome.broadcast_id,
        delivered: outcome.delivered,
        failed: outcome.failed,
    }))
}

pub async fn get_history(
    State(state): State<AppState>,
    Path(list_id): Path<Uuid>,
) -> Result<impl IntoResponse, StatusCode> {
    let list = state
        .directory
        .get_list(list_id)
        .await
        .map_err(reject_directory)?;
    if list.owner_id != state.counsellor_id {
        return Err(reject_directory(DirectoryError::NotOwner(list_id)));
    }
    let history = state
        .directory
        .broadcasts_for_list(list_id)
        .await
        .map_err(reject_directory)?;
    Ok(Json(history))
}
