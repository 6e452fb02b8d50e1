pub mod broadcasts;
pub mod conversations;
pub mod domain;
pub mod error;
pub mod portfolio;
pub mod state;

use axum::{
    Router,
    routing::{delete, get, post, put},
};

pub use domain::HttpDomainApi;
pub use state::{AppState, AppStateInner};

/// Routes of the local portal surface.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/portfolio",
            get(portfolio::get_portfolio).put(portfolio::sync_portfolio),
        )
        .route(
            "/conversations/{beneficiary_id}",
            get(conversations::get_conversation),
        )
        .route(
            "/conversations/{beneficiary_id}/messages",
            post(conversations::send_message),
        )
        .route(
            "/conversations/{beneficiary_id}/seen",
            post(conversations::mark_seen),
        )
        .route(
            "/conversations/{beneficiary_id}/flag",
            put(conversations::set_flag),
        )
        .route(
            "/broadcast-lists",
            get(broadcasts::get_lists).post(broadcasts::create_list),
        )
        .route("/broadcast-lists/{list_id}", delete(broadcasts::delete_list))
        .route(
            "/broadcast-lists/{list_id}/beneficiaries",
            post(broadcasts::add_beneficiary),
        )
        .route(
            "/broadcast-lists/{list_id}/beneficiaries/{beneficiary_id}",
            delete(broadcasts::remove_beneficiary),
        )
        .route(
            "/broadcast-lists/{list_id}/messages",
            get(broadcasts::get_history).post(broadcasts::send_broadcast),
        )
        .with_state(state)
}
