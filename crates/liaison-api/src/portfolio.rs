use std::collections::HashSet;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};

use liaison_types::api::{PortfolioResponse, SyncPortfolioRequest, SyncPortfolioResponse};

use crate::conversations::summary;
use crate::error::reject;
use crate::state::AppState;

pub async fn sync_portfolio(
    State(state): State<AppState>,
    Json(req): Json<SyncPortfolioRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let ids: HashSet<_> = req.beneficiary_ids.into_iter().collect();
    let diff = state.portfolio.sync_portfolio(&ids).await.map_err(reject)?;
    Ok(Json(SyncPortfolioResponse {
        added: diff.added,
        removed: diff.removed,
    }))
}

pub async fn get_portfolio(State(state): State<AppState>) -> impl IntoResponse {
    let conversations = state
        .portfolio
        .conversations()
        .iter()
        .map(|view| summary(view))
        .collect();
    Json(PortfolioResponse {
        has_unread: state.portfolio.has_unread(),
        conversations,
    })
}
