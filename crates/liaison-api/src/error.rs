use axum::http::StatusCode;
use tracing::{error, warn};

use liaison_sync::SyncError;
use liaison_types::store::{ApiError, DirectoryError};

/// Map a sync failure to the status the portal answers with.
pub fn status_for(err: &SyncError) -> StatusCode {
    match err {
        SyncError::SessionExpired(_) | SyncError::Api(ApiError::Unauthorized) => {
            StatusCode::UNAUTHORIZED
        }
        SyncError::Directory(DirectoryError::NotFound(_)) => StatusCode::NOT_FOUND,
        SyncError::Directory(DirectoryError::NotOwner(_)) => StatusCode::FORBIDDEN,
        SyncError::InvalidMessage(_) => StatusCode::BAD_REQUEST,
        SyncError::Crypto(_) => StatusCode::INTERNAL_SERVER_ERROR,
        SyncError::Store(_)
        | SyncError::Api(_)
        | SyncError::KeyUnavailable { .. }
        | SyncError::Directory(DirectoryError::Storage(_)) => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// Log and convert, for `map_err` in handlers.
pub fn reject(err: SyncError) -> StatusCode {
    let status = status_for(&err);
    if status.is_server_error() {
        error!("Request failed: {}", err);
    } else {
        warn!("Request refused ({}): {}", status, err);
    }
    status
}

pub fn reject_directory(err: DirectoryError) -> StatusCode {
    reject(err.into())
}
