use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info};
use uuid::Uuid;

use liaison_types::models::{BroadcastList, BroadcastMessage};
use liaison_types::store::{BroadcastDirectory, DirectoryError};

use crate::Database;
use crate::models::{BroadcastListRow, BroadcastMessageRow};
use crate::queries::{format_ts, parse_ts};

/// Broadcast lists and audit records kept in SQLite.
#[derive(Clone)]
pub struct SqliteDirectory {
    db: Arc<Database>,
}

impl SqliteDirectory {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Run `f` on the blocking pool so SQLite never stalls a runtime worker.
    async fn blocking<T, F>(&self, f: F) -> Result<T, DirectoryError>
    where
        F: FnOnce(&SqliteDirectory) -> Result<T, DirectoryError> + Send + 'static,
        T: Send + 'static,
    {
        let dir = self.clone();
        tokio::task::spawn_blocking(move || f(&dir))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                DirectoryError::Storage(e.to_string())
            })?
    }

    fn owned_list(&self, owner_id: Uuid, list_id: Uuid) -> Result<BroadcastList, DirectoryError> {
        let list = self.load(list_id)?;
        if list.owner_id != owner_id {
            return Err(DirectoryError::NotOwner(list_id));
        }
        Ok(list)
    }

    fn load(&self, list_id: Uuid) -> Result<BroadcastList, DirectoryError> {
        let (row, members) = self
            .db
            .get_list(&list_id.to_string())
            .map_err(storage)?
            .ok_or(DirectoryError::NotFound(list_id))?;
        list_from_row(row, members)
    }
}

#[async_trait]
impl BroadcastDirectory for SqliteDirectory {
    async fn create_list(
        &self,
        owner_id: Uuid,
        title: &str,
        beneficiary_ids: &[Uuid],
    ) -> Result<BroadcastList, DirectoryError> {
        let id = Uuid::new_v4();
        let row = BroadcastListRow {
            id: id.to_string(),
            owner_id: owner_id.to_string(),
            title: title.to_string(),
        };
        let members: Vec<String> = beneficiary_ids.iter().map(Uuid::to_string).collect();

        self.blocking(move |dir| {
            dir.db.insert_list(&row, &members).map_err(storage)?;
            info!("Broadcast list {} created with {} members", id, members.len());
            dir.load(id)
        })
        .await
    }

    async fn get_list(&self, list_id: Uuid) -> Result<BroadcastList, DirectoryError> {
        self.blocking(move |dir| dir.load(list_id)).await
    }

    async fn lists_for(&self, owner_id: Uuid) -> Result<Vec<BroadcastList>, DirectoryError> {
        self.blocking(move |dir| {
            dir.db
                .get_lists_for_owner(&owner_id.to_string())
                .map_err(storage)?
                .into_iter()
                .map(|(row, members)| list_from_row(row, members))
                .collect()
        })
        .await
    }

    async fn add_beneficiary(
        &self,
        owner_id: Uuid,
        list_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<BroadcastList, DirectoryError> {
        self.blocking(move |dir| {
            dir.owned_list(owner_id, list_id)?;
            dir.db
                .add_member(&list_id.to_string(), &beneficiary_id.to_string())
                .map_err(storage)?;
            dir.load(list_id)
        })
        .await
    }

    async fn remove_beneficiary(
        &self,
        owner_id: Uuid,
        list_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<BroadcastList, DirectoryError> {
        self.blocking(move |dir| {
            dir.owned_list(owner_id, list_id)?;
            dir.db
                .remove_member(&list_id.to_string(), &beneficiary_id.to_string())
                .map_err(storage)?;
            dir.load(list_id)
        })
        .await
    }

    async fn delete_list(&self, owner_id: Uuid, list_id: Uuid) -> Result<(), DirectoryError> {
        self.blocking(move |dir| {
            dir.owned_list(owner_id, list_id)?;
            dir.db.delete_list(&list_id.to_string()).map_err(storage)?;
            info!("Broadcast list {} deleted", list_id);
            Ok(())
        })
        .await
    }

    async fn record_broadcast(&self, message: &BroadcastMessage) -> Result<(), DirectoryError> {
        let row = BroadcastMessageRow {
            id: message.id.to_string(),
            list_id: message.list_id.to_string(),
            author_id: message.author_id.to_string(),
            created_at: format_ts(&message.created_at),
            content: message.content.clone(),
        };
        let recipients: Vec<String> = message.delivered_to.iter().map(Uuid::to_string).collect();

        self.blocking(move |dir| {
            dir.db
                .insert_broadcast_message(&row, &recipients)
                .map_err(storage)
        })
        .await
    }

    async fn broadcasts_for_list(
        &self,
        list_id: Uuid,
    ) -> Result<Vec<BroadcastMessage>, DirectoryError> {
        let rows = self
            .blocking(move |dir| {
                dir.db
                    .get_broadcast_messages(&list_id.to_string())
                    .map_err(storage)
            })
            .await?;

        rows.into_iter()
            .map(|(row, recipients)| {
                Ok(BroadcastMessage {
                    id: parse_id(&row.id)?,
                    list_id: parse_id(&row.list_id)?,
                    author_id: parse_id(&row.author_id)?,
                    created_at: parse_ts(&row.created_at).map_err(storage)?,
                    content: row.content,
                    delivered_to: recipients
                        .iter()
                        .map(|id| parse_id(id))
                        .collect::<Result<_, _>>()?,
                })
            })
            .collect()
    }
}

fn storage(e: anyhow::Error) -> DirectoryError {
    DirectoryError::Storage(e.to_string())
}

fn parse_id(raw: &str) -> Result<Uuid, DirectoryError> {
    raw.parse()
        .map_err(|e| DirectoryError::Storage(format!("corrupt id '{}': {}", raw, e)))
}

fn list_from_row(row: BroadcastListRow, members: Vec<String>) -> Result<BroadcastList, DirectoryError> {
    Ok(BroadcastList {
        id: parse_id(&row.id)?,
        owner_id: parse_id(&row.owner_id)?,
        title: row.title,
        beneficiary_ids: members
            .iter()
            .map(|id| parse_id(id))
            .collect::<Result<_, _>>()?,
    })
}
