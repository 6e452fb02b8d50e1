//! SQLite-backed real-time document store with in-process push listeners.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use liaison_types::claims::RealtimeClaims;
use liaison_types::documents::{ConversationDocument, ConversationPatch, KindTag, MessageDocument};
use liaison_types::models::{EncryptedPayload, SenderRole};
use liaison_types::store::{
    ListenTarget, ListenerId, RealtimeStore, SnapshotHandler, StoreError, StoreEvent,
};

use crate::Database;
use crate::models::{ConversationRow, MessageRow};
use crate::queries::{format_ts, parse_ts};

struct Listener {
    target: ListenTarget,
    handler: SnapshotHandler,
}

struct Session {
    expires_at: Option<DateTime<Utc>>,
}

/// State touched from the blocking pool.
struct Documents {
    db: Arc<Database>,
    listeners: RwLock<HashMap<ListenerId, Listener>>,
    /// Held from a write until its snapshot has been pushed, so listeners
    /// see snapshots in commit order.
    publish: Mutex<()>,
}

/// Local stand-in for the hosted real-time store.
///
/// Every listener receives the full current snapshot on attach and after each
/// write to its document or collection.
pub struct LocalStore {
    docs: Arc<Documents>,
    verifier: Option<DecodingKey>,
    session: RwLock<Option<Session>>,
}

impl LocalStore {
    /// Accepts any token on sign-in.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            docs: Arc::new(Documents {
                db,
                listeners: RwLock::new(HashMap::new()),
                publish: Mutex::new(()),
            }),
            verifier: None,
            session: RwLock::new(None),
        }
    }

    /// Verifies HS256 session tokens against `secret` on sign-in.
    pub fn with_secret(db: Arc<Database>, secret: &str) -> Self {
        Self {
            verifier: Some(DecodingKey::from_secret(secret.as_bytes())),
            ..Self::new(db)
        }
    }

    /// Drop the current session and every listener, the way a hosted store
    /// behaves when it revokes a token.
    pub fn revoke_session(&self, reason: &str) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = None;

        let dropped: Vec<Listener> = self
            .docs
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, l)| l)
            .collect();

        info!("Session revoked ({}), dropping {} listeners", reason, dropped.len());
        for listener in dropped {
            (listener.handler)(StoreEvent::Error(StoreError::Unauthenticated(reason.to_string())));
        }
    }

    pub fn listener_count(&self) -> usize {
        self.docs
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    fn ensure_session(&self) -> Result<(), StoreError> {
        let session = self.session.read().unwrap_or_else(|e| e.into_inner());
        match session.as_ref() {
            None => Err(StoreError::Unauthenticated("not signed in".into())),
            Some(Session {
                expires_at: Some(exp),
            }) if *exp <= Utc::now() => Err(StoreError::Unauthenticated("session expired".into())),
            Some(_) => Ok(()),
        }
    }

    /// Run `f` on the blocking pool so SQLite never stalls a runtime worker.
    async fn blocking<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Documents) -> Result<T, StoreError> + Send + 'static,
        T: Send + 'static,
    {
        let docs = self.docs.clone();
        tokio::task::spawn_blocking(move || f(&docs))
            .await
            .map_err(|e| {
                error!("spawn_blocking join error: {}", e);
                StoreError::Transient(e.to_string())
            })?
    }
}

impl Documents {
    fn snapshot(&self, target: ListenTarget) -> Result<StoreEvent, StoreError> {
        match target {
            ListenTarget::Messages(conversation_id) => {
                let rows = self
                    .db
                    .get_messages(&conversation_id.to_string())
                    .map_err(io_error)?;
                let docs = rows
                    .into_iter()
                    .filter_map(|row| match message_from_row(&row) {
                        Ok(pair) => Some(pair),
                        Err(e) => {
                            warn!("Skipping corrupt message row '{}': {}", row.id, e);
                            None
                        }
                    })
                    .collect();
                Ok(StoreEvent::Messages(docs))
            }
            ListenTarget::Summary(conversation_id) => {
                let row = self
                    .db
                    .get_conversation(&conversation_id.to_string())
                    .map_err(io_error)?;
                Ok(StoreEvent::Summary(row.map(|r| summary_from_row(&r))))
            }
        }
    }

    fn lock_publish(&self) -> std::sync::MutexGuard<'_, ()> {
        self.publish.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Push the current snapshot of `target` to its listeners. Callers hold
    /// the publish lock.
    fn notify(&self, target: ListenTarget) {
        let handlers: Vec<SnapshotHandler> = self
            .listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|l| l.target == target)
            .map(|l| l.handler.clone())
            .collect();

        if handlers.is_empty() {
            return;
        }

        match self.snapshot(target) {
            Ok(event) => {
                for handler in handlers {
                    handler(event.clone());
                }
            }
            Err(e) => warn!("Failed to build snapshot for {:?}: {}", target, e),
        }
    }
}

#[async_trait]
impl RealtimeStore for LocalStore {
    async fn sign_in(&self, token: &str) -> Result<(), StoreError> {
        let expires_at = match &self.verifier {
            Some(key) => {
                let data = decode::<RealtimeClaims>(token, key, &Validation::new(Algorithm::HS256))
                    .map_err(|e| StoreError::Unauthenticated(e.to_string()))?;
                Utc.timestamp_opt(data.claims.exp as i64, 0).single()
            }
            None => None,
        };

        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(Session { expires_at });
        debug!("Real-time session opened (expires {:?})", expires_at);
        Ok(())
    }

    async fn listen(
        &self,
        target: ListenTarget,
        handler: SnapshotHandler,
    ) -> Result<ListenerId, StoreError> {
        self.ensure_session()?;

        self.blocking(move |docs| {
            let _publish = docs.lock_publish();

            // Registered before the first snapshot so no write falls between them.
            let id = Uuid::new_v4();
            docs.listeners
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(
                    id,
                    Listener {
                        target,
                        handler: handler.clone(),
                    },
                );

            match docs.snapshot(target) {
                Ok(initial) => {
                    handler(initial);
                    Ok(id)
                }
                Err(e) => {
                    docs.listeners
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .remove(&id);
                    Err(e)
                }
            }
        })
        .await
    }

    async fn detach(&self, listener: ListenerId) {
        self.docs
            .listeners
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&listener);
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        document: MessageDocument,
    ) -> Result<(), StoreError> {
        self.ensure_session()?;
        let row = row_from_message(conversation_id, message_id, &document)?;

        self.blocking(move |docs| {
            let _publish = docs.lock_publish();
            let inserted = docs.db.insert_message(&row).map_err(io_error)?;
            if inserted {
                docs.notify(ListenTarget::Messages(conversation_id));
            }
            Ok(())
        })
        .await
    }

    async fn upsert_conversation(
        &self,
        conversation_id: Uuid,
        patch: ConversationPatch,
    ) -> Result<(), StoreError> {
        self.ensure_session()?;

        self.blocking(move |docs| {
            let _publish = docs.lock_publish();
            docs.db
                .update_conversation(&conversation_id.to_string(), |row| {
                    let mut doc = summary_from_row(row);
                    patch.apply(&mut doc);
                    write_summary(row, &doc);
                })
                .map_err(io_error)?;
            docs.notify(ListenTarget::Summary(conversation_id));
            Ok(())
        })
        .await
    }
}

fn io_error(e: anyhow::Error) -> StoreError {
    StoreError::Transient(e.to_string())
}

fn row_from_message(
    conversation_id: Uuid,
    message_id: Uuid,
    doc: &MessageDocument,
) -> Result<MessageRow, StoreError> {
    let kind_payload = doc
        .kind_payload
        .as_ref()
        .map(serde_json::to_string)
        .transpose()
        .map_err(|e| StoreError::Rejected(e.to_string()))?;

    Ok(MessageRow {
        id: message_id.to_string(),
        conversation_id: conversation_id.to_string(),
        sender_role: doc.sender_role.as_str().to_string(),
        author_id: doc.author_id.map(|id| id.to_string()),
        created_at: format_ts(&doc.created_at),
        encrypted_body: doc.encrypted_body.clone(),
        iv: doc.iv.clone(),
        kind: doc.kind.as_str().to_string(),
        kind_payload,
        broadcast_id: doc.broadcast_id.map(|id| id.to_string()),
    })
}

fn message_from_row(row: &MessageRow) -> anyhow::Result<(Uuid, MessageDocument)> {
    let id: Uuid = row.id.parse()?;
    let sender_role = SenderRole::parse(&row.sender_role)
        .ok_or_else(|| anyhow::anyhow!("unknown sender role '{}'", row.sender_role))?;
    let kind = KindTag::parse(&row.kind)
        .ok_or_else(|| anyhow::anyhow!("unknown kind '{}'", row.kind))?;

    let doc = MessageDocument {
        sender_role,
        author_id: row.author_id.as_deref().map(str::parse).transpose()?,
        created_at: parse_ts(&row.created_at)?,
        encrypted_body: row.encrypted_body.clone(),
        iv: row.iv.clone(),
        kind,
        kind_payload: row
            .kind_payload
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?,
        broadcast_id: row.broadcast_id.as_deref().map(str::parse).transpose()?,
    };
    Ok((id, doc))
}

fn summary_from_row(row: &ConversationRow) -> ConversationDocument {
    let ts = |raw: &Option<String>| raw.as_deref().and_then(|r| parse_ts(r).ok());
    ConversationDocument {
        last_message_preview_encrypted: match (&row.preview_cipher_text, &row.preview_iv) {
            (Some(cipher_text), Some(iv)) => Some(EncryptedPayload {
                cipher_text: cipher_text.clone(),
                iv: iv.clone(),
            }),
            _ => None,
        },
        last_message_at: ts(&row.last_message_at),
        last_sender_role: row.last_sender_role.as_deref().and_then(SenderRole::parse),
        flagged: row.flagged,
        seen_by_counsellor_at: ts(&row.seen_by_counsellor_at),
        seen_by_beneficiary_at: ts(&row.seen_by_beneficiary_at),
    }
}

fn write_summary(row: &mut ConversationRow, doc: &ConversationDocument) {
    row.preview_cipher_text = doc
        .last_message_preview_encrypted
        .as_ref()
        .map(|p| p.cipher_text.clone());
    row.preview_iv = doc.last_message_preview_encrypted.as_ref().map(|p| p.iv.clone());
    row.last_message_at = doc.last_message_at.as_ref().map(format_ts);
    row.last_sender_role = doc.last_sender_role.map(|r| r.as_str().to_string());
    row.flagged = doc.flagged;
    row.seen_by_counsellor_at = doc.seen_by_counsellor_at.as_ref().map(format_ts);
    row.seen_by_beneficiary_at = doc.seen_by_beneficiary_at.as_ref().map(format_ts);
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use jsonwebtoken::{EncodingKey, Header, encode};

    use super::*;

    fn store() -> LocalStore {
        LocalStore::new(Arc::new(Database::open_in_memory().unwrap()))
    }

    fn recorder() -> (SnapshotHandler, Arc<Mutex<Vec<StoreEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let handler: SnapshotHandler = Arc::new(move |event: StoreEvent| sink.lock().unwrap().push(event));
        (handler, events)
    }

    fn doc(role: SenderRole, at: DateTime<Utc>) -> MessageDocument {
        MessageDocument {
            sender_role: role,
            author_id: None,
            created_at: at,
            encrypted_body: Some("Ym9keQ==".into()),
            iv: Some("aXY=".into()),
            kind: KindTag::Plain,
            kind_payload: None,
            broadcast_id: None,
        }
    }

    fn token(secret: &str, exp: i64) -> String {
        let claims = RealtimeClaims {
            sub: Uuid::new_v4(),
            exp: exp as usize,
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes())).unwrap()
    }

    #[tokio::test]
    async fn listen_requires_session() {
        let store = store();
        let (handler, _) = recorder();
        let err = store
            .listen(ListenTarget::Messages(Uuid::new_v4()), handler)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Unauthenticated(_)));
    }

    #[tokio::test]
    async fn listener_gets_initial_and_pushed_snapshots() {
        let store = store();
        store.sign_in("any").await.unwrap();
        let conversation = Uuid::new_v4();
        let (handler, events) = recorder();

        store
            .listen(ListenTarget::Messages(conversation), handler)
            .await
            .unwrap();
        store
            .append_message(conversation, Uuid::new_v4(), doc(SenderRole::Beneficiary, Utc::now()))
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert_eq!(events.len(), 2);
        match &events[1] {
            StoreEvent::Messages(docs) => assert_eq!(docs.len(), 1),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn detached_listener_is_silent() {
        let store = store();
        store.sign_in("any").await.unwrap();
        let conversation = Uuid::new_v4();
        let (handler, events) = recorder();

        let id = store
            .listen(ListenTarget::Summary(conversation), handler)
            .await
            .unwrap();
        store.detach(id).await;
        store
            .upsert_conversation(conversation, ConversationPatch::flagged(true))
            .await
            .unwrap();

        assert_eq!(events.lock().unwrap().len(), 1);
        assert_eq!(store.listener_count(), 0);
    }

    #[tokio::test]
    async fn summary_patch_roundtrips() {
        let store = store();
        store.sign_in("any").await.unwrap();
        let conversation = Uuid::new_v4();
        let seen = Utc::now();

        store
            .upsert_conversation(conversation, ConversationPatch::flagged(true))
            .await
            .unwrap();
        store
            .upsert_conversation(conversation, ConversationPatch::seen_by_counsellor(seen))
            .await
            .unwrap();

        match store.docs.snapshot(ListenTarget::Summary(conversation)).unwrap() {
            StoreEvent::Summary(Some(doc)) => {
                assert!(doc.flagged);
                assert_eq!(
                    doc.seen_by_counsellor_at.map(|t| t.timestamp_micros()),
                    Some(seen.timestamp_micros())
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    fn message_counts(events: &[StoreEvent]) -> Vec<usize> {
        events
            .iter()
            .filter_map(|e| match e {
                StoreEvent::Messages(docs) => Some(docs.len()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn listeners_attached_during_writes_end_on_the_full_snapshot() {
        let store = Arc::new(store());
        store.sign_in("any").await.unwrap();
        let conversation = Uuid::new_v4();
        let writes = 20;

        let mut tasks = Vec::new();
        for i in 0..writes {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .append_message(
                        conversation,
                        Uuid::new_v4(),
                        doc(SenderRole::Beneficiary, Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap()),
                    )
                    .await
                    .unwrap();
            }));
        }
        let mut recorders = Vec::new();
        for _ in 0..8 {
            let (handler, events) = recorder();
            recorders.push(events);
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .listen(ListenTarget::Messages(conversation), handler)
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        for events in recorders {
            let counts = message_counts(&events.lock().unwrap());
            assert_eq!(counts.last(), Some(&(writes as usize)));
            assert!(counts.windows(2).all(|w| w[0] <= w[1]), "went backwards: {:?}", counts);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn summary_snapshots_arrive_in_commit_order() {
        let store = Arc::new(store());
        store.sign_in("any").await.unwrap();
        let conversation = Uuid::new_v4();
        let (handler, events) = recorder();
        store
            .listen(ListenTarget::Summary(conversation), handler)
            .await
            .unwrap();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .upsert_conversation(conversation, ConversationPatch::flagged(i % 2 == 0))
                    .await
                    .unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let stored = match store.docs.snapshot(ListenTarget::Summary(conversation)).unwrap() {
            StoreEvent::Summary(doc) => doc,
            other => panic!("unexpected event {:?}", other),
        };
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 21);
        match events.last() {
            Some(StoreEvent::Summary(doc)) => assert_eq!(doc, &stored),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn verified_sign_in_rejects_bad_and_expired_tokens() {
        let store = LocalStore::with_secret(Arc::new(Database::open_in_memory().unwrap()), "s3cret");
        let future = Utc::now().timestamp() + 3600;
        let past = Utc::now().timestamp() - 3600;

        assert!(matches!(
            store.sign_in(&token("other", future)).await,
            Err(StoreError::Unauthenticated(_))
        ));
        assert!(matches!(
            store.sign_in(&token("s3cret", past)).await,
            Err(StoreError::Unauthenticated(_))
        ));
        assert!(store.sign_in(&token("s3cret", future)).await.is_ok());
    }

    #[tokio::test]
    async fn revoke_pushes_error_and_drops_listeners() {
        let store = store();
        store.sign_in("any").await.unwrap();
        let (handler, events) = recorder();
        store
            .listen(ListenTarget::Messages(Uuid::new_v4()), handler)
            .await
            .unwrap();

        store.revoke_session("token revoked");

        assert_eq!(store.listener_count(), 0);
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(StoreEvent::Error(StoreError::Unauthenticated(_)))
        ));
        assert!(
            store
                .append_message(Uuid::new_v4(), Uuid::new_v4(), doc(SenderRole::Counsellor, Utc::now()))
                .await
                .is_err()
        );
    }
}
