//! Boundaries of the messaging core: the real-time document store, the
//! domain API that mints store credentials, and the broadcast directory.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::documents::{ConversationDocument, ConversationPatch, MessageDocument};
use crate::models::{BroadcastList, BroadcastMessage};

pub type ListenerId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenTarget {
    /// The messages sub-collection, ordered by `createdAt` ascending.
    Messages(Uuid),
    /// The conversation summary document.
    Summary(Uuid),
}

impl ListenTarget {
    pub fn conversation_id(&self) -> Uuid {
        match self {
            Self::Messages(id) | Self::Summary(id) => *id,
        }
    }
}

/// One push from the store to a listener.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Full or incremental snapshot of a messages sub-collection.
    Messages(Vec<(Uuid, MessageDocument)>),
    /// Current summary document; `None` until the conversation exists.
    Summary(Option<ConversationDocument>),
    /// The listener was dropped by the store.
    Error(StoreError),
}

pub type SnapshotHandler = Arc<dyn Fn(StoreEvent) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("real-time store unavailable: {0}")]
    Transient(String),
    #[error("real-time session rejected: {0}")]
    Unauthenticated(String),
    #[error("write rejected: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}

/// Push-subscribable hierarchical document store.
///
/// Each conversation is a summary document with a messages sub-collection.
/// Writes are plain upserts; no transaction spans two documents.
#[async_trait]
pub trait RealtimeStore: Send + Sync {
    async fn sign_in(&self, token: &str) -> Result<(), StoreError>;

    /// Attach a listener. The store pushes the current state right away and
    /// again after every change.
    async fn listen(
        &self,
        target: ListenTarget,
        handler: SnapshotHandler,
    ) -> Result<ListenerId, StoreError>;

    /// Detach a listener. Unknown ids are ignored.
    async fn detach(&self, listener: ListenerId);

    async fn append_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        document: MessageDocument,
    ) -> Result<(), StoreError>;

    async fn upsert_conversation(
        &self,
        conversation_id: Uuid,
        patch: ConversationPatch,
    ) -> Result<(), StoreError>;
}

/// Short-lived store token plus the counselor's key material (base64).
#[derive(Clone)]
pub struct RealtimeGrant {
    pub token: String,
    pub key: String,
}

impl std::fmt::Debug for RealtimeGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RealtimeGrant").finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("application session rejected by the domain API")]
    Unauthorized,
    #[error("domain API answered {0}")]
    Status(u16),
    #[error("domain API unreachable: {0}")]
    Transport(String),
    #[error("unexpected domain API response: {0}")]
    Decode(String),
}

#[async_trait]
pub trait DomainApi: Send + Sync {
    async fn mint_realtime_token(&self) -> Result<RealtimeGrant, ApiError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectoryError {
    #[error("broadcast list {0} not found")]
    NotFound(Uuid),
    #[error("broadcast list {0} belongs to another counsellor")]
    NotOwner(Uuid),
    #[error("broadcast storage failed: {0}")]
    Storage(String),
}

/// Broadcast lists and their audit records.
#[async_trait]
pub trait BroadcastDirectory: Send + Sync {
    async fn create_list(
        &self,
        owner_id: Uuid,
        title: &str,
        beneficiary_ids: &[Uuid],
    ) -> Result<BroadcastList, DirectoryError>;

    async fn get_list(&self, list_id: Uuid) -> Result<BroadcastList, DirectoryError>;

    async fn lists_for(&self, owner_id: Uuid) -> Result<Vec<BroadcastList>, DirectoryError>;

    async fn add_beneficiary(
        &self,
        owner_id: Uuid,
        list_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<BroadcastList, DirectoryError>;

    async fn remove_beneficiary(
        &self,
        owner_id: Uuid,
        list_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<BroadcastList, DirectoryError>;

    async fn delete_list(&self, owner_id: Uuid, list_id: Uuid) -> Result<(), DirectoryError>;

    async fn record_broadcast(&self, message: &BroadcastMessage) -> Result<(), DirectoryError>;

    async fn broadcasts_for_list(
        &self,
        list_id: Uuid,
    ) -> Result<Vec<BroadcastMessage>, DirectoryError>;
}
