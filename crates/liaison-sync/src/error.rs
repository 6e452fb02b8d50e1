use thiserror::Error;
use uuid::Uuid;

use liaison_crypto::CryptoError;
use liaison_types::store::{ApiError, DirectoryError, StoreError};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Store failure left after retries. Subscriptions stay up on stale data.
    #[error("real-time store error: {0}")]
    Store(StoreError),

    /// Credentials were rejected twice in a row. The caller must send the
    /// user back through full re-authentication.
    #[error("session expired, re-authentication required: {0}")]
    SessionExpired(String),

    #[error("domain API error: {0}")]
    Api(ApiError),

    #[error("no conversation key for beneficiary {beneficiary_id}: {reason}")]
    KeyUnavailable { beneficiary_id: Uuid, reason: String },

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("invalid message: {0}")]
    InvalidMessage(&'static str),
}

impl SyncError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SessionExpired(_))
    }
}
