//! In-memory collaborators for the sync tests.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use liaison_crypto::{ConversationKey, CryptoEngine, KeyMaterial};
use liaison_types::documents::{
    ConversationDocument, ConversationPatch, LastMessage, MessageDocument,
};
use liaison_types::models::{
    BroadcastList, BroadcastMessage, ConversationRef, Message, MessageKind, SenderRole,
};
use liaison_types::report::{ErrorReport, ErrorReporter};
use liaison_types::store::{
    ApiError, BroadcastDirectory, DirectoryError, DomainApi, ListenTarget, ListenerId,
    RealtimeGrant, RealtimeStore, SnapshotHandler, StoreError, StoreEvent,
};

use crate::config::SyncConfig;
use crate::conversation::ConversationStore;
use crate::credentials::CredentialBroker;
use crate::keys::DerivedKeyResolver;
use crate::view::ConversationView;

pub fn quick_config() -> SyncConfig {
    SyncConfig {
        retry_delay: Duration::from_millis(1),
        reattach_interval: Duration::from_millis(20),
        ..Default::default()
    }
}

pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

// -- Real-time store --

#[derive(Default)]
pub struct FakeStore {
    pub sign_ins: AtomicU32,
    pub detaches: AtomicU32,
    listeners: Mutex<HashMap<ListenerId, (ListenTarget, SnapshotHandler)>>,
    messages: Mutex<HashMap<Uuid, Vec<(Uuid, MessageDocument)>>>,
    summaries: Mutex<HashMap<Uuid, ConversationDocument>>,
    /// Errors returned by the next `listen` calls, in order.
    pub listen_failures: Mutex<VecDeque<StoreError>>,
    /// Errors returned by the next `append_message` calls, in order.
    pub append_failures: Mutex<VecDeque<StoreError>>,
    /// Errors returned by the next `upsert_conversation` calls, in order.
    pub upsert_failures: Mutex<VecDeque<StoreError>>,
    /// Conversations whose appends are always rejected.
    pub rejected_conversations: Mutex<HashSet<Uuid>>,
    /// Every operation fails as unauthenticated.
    pub revoked: AtomicBool,
}

impl FakeStore {
    pub fn listener_count(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    pub fn messages_in(&self, conversation_id: Uuid) -> Vec<MessageDocument> {
        self.messages
            .lock()
            .unwrap()
            .get(&conversation_id)
            .map(|docs| docs.iter().map(|(_, doc)| doc.clone()).collect())
            .unwrap_or_default()
    }

    pub fn summary_of(&self, conversation_id: Uuid) -> Option<ConversationDocument> {
        self.summaries.lock().unwrap().get(&conversation_id).cloned()
    }

    /// Re-push the current state to every listener of a conversation.
    pub fn redeliver(&self, conversation_id: Uuid) {
        self.notify(ListenTarget::Messages(conversation_id));
        self.notify(ListenTarget::Summary(conversation_id));
    }

    /// Drop every listener on `target` with an error, as the store does when
    /// a session lapses.
    pub fn drop_listeners(&self, target: ListenTarget, error: StoreError) {
        let dropped: Vec<SnapshotHandler> = {
            let mut listeners = self.listeners.lock().unwrap();
            let ids: Vec<ListenerId> = listeners
                .iter()
                .filter(|(_, (t, _))| *t == target)
                .map(|(id, _)| *id)
                .collect();
            ids.into_iter()
                .filter_map(|id| listeners.remove(&id).map(|(_, h)| h))
                .collect()
        };
        for handler in dropped {
            handler(StoreEvent::Error(error.clone()));
        }
    }

    fn snapshot(&self, target: ListenTarget) -> StoreEvent {
        match target {
            ListenTarget::Messages(id) => {
                let mut docs = self
                    .messages
                    .lock()
                    .unwrap()
                    .get(&id)
                    .cloned()
                    .unwrap_or_default();
                docs.sort_by_key(|(id, doc)| (doc.created_at, *id));
                StoreEvent::Messages(docs)
            }
            ListenTarget::Summary(id) => StoreEvent::Summary(self.summary_of(id)),
        }
    }

    fn notify(&self, target: ListenTarget) {
        let handlers: Vec<SnapshotHandler> = self
            .listeners
            .lock()
            .unwrap()
            .values()
            .filter(|(t, _)| *t == target)
            .map(|(_, h)| h.clone())
            .collect();
        for handler in handlers {
            handler(self.snapshot(target));
        }
    }

    fn check_session(&self) -> Result<(), StoreError> {
        if self.revoked.load(Ordering::SeqCst) {
            return Err(StoreError::Unauthenticated("token revoked".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RealtimeStore for FakeStore {
    async fn sign_in(&self, _token: &str) -> Result<(), StoreError> {
        self.check_session()?;
        self.sign_ins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn listen(
        &self,
        target: ListenTarget,
        handler: SnapshotHandler,
    ) -> Result<ListenerId, StoreError> {
        self.check_session()?;
        if let Some(e) = self.listen_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        let id = Uuid::new_v4();
        self.listeners
            .lock()
            .unwrap()
            .insert(id, (target, handler.clone()));
        handler(self.snapshot(target));
        Ok(id)
    }

    async fn detach(&self, listener: ListenerId) {
        if self.listeners.lock().unwrap().remove(&listener).is_some() {
            self.detaches.fetch_add(1, Ordering::SeqCst);
        }
    }

    async fn append_message(
        &self,
        conversation_id: Uuid,
        message_id: Uuid,
        document: MessageDocument,
    ) -> Result<(), StoreError> {
        self.check_session()?;
        if let Some(e) = self.append_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        if self
            .rejected_conversations
            .lock()
            .unwrap()
            .contains(&conversation_id)
        {
            return Err(StoreError::Rejected("permission denied".into()));
        }
        {
            let mut messages = self.messages.lock().unwrap();
            let docs = messages.entry(conversation_id).or_default();
            if docs.iter().any(|(id, _)| *id == message_id) {
                return Ok(());
            }
            docs.push((message_id, document));
        }
        self.notify(ListenTarget::Messages(conversation_id));
        Ok(())
    }

    async fn upsert_conversation(
        &self,
        conversation_id: Uuid,
        patch: ConversationPatch,
    ) -> Result<(), StoreError> {
        self.check_session()?;
        if let Some(e) = self.upsert_failures.lock().unwrap().pop_front() {
            return Err(e);
        }
        patch.apply(
            self.summaries
                .lock()
                .unwrap()
                .entry(conversation_id)
                .or_default(),
        );
        self.notify(ListenTarget::Summary(conversation_id));
        Ok(())
    }
}

// -- Domain API --

pub struct FakeApi {
    pub mints: AtomicU32,
    pub unauthorized: AtomicBool,
    /// Tokens handed out before falling back to opaque ones.
    pub next_tokens: Mutex<Vec<String>>,
    pub material: KeyMaterial,
}

impl Default for FakeApi {
    fn default() -> Self {
        Self {
            mints: AtomicU32::new(0),
            unauthorized: AtomicBool::new(false),
            next_tokens: Mutex::new(Vec::new()),
            material: KeyMaterial::generate(),
        }
    }
}

#[async_trait]
impl DomainApi for FakeApi {
    async fn mint_realtime_token(&self) -> Result<RealtimeGrant, ApiError> {
        let n = self.mints.fetch_add(1, Ordering::SeqCst) + 1;
        if self.unauthorized.load(Ordering::SeqCst) {
            return Err(ApiError::Unauthorized);
        }
        let token = self
            .next_tokens
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| format!("opaque-token-{}", n));
        Ok(RealtimeGrant {
            token,
            key: self.material.to_base64(),
        })
    }
}

// -- Broadcast directory --

#[derive(Default)]
pub struct MemoryDirectory {
    lists: Mutex<HashMap<Uuid, BroadcastList>>,
    pub records: Mutex<Vec<BroadcastMessage>>,
}

impl MemoryDirectory {
    fn owned(&self, owner_id: Uuid, list_id: Uuid) -> Result<(), DirectoryError> {
        match self.lists.lock().unwrap().get(&list_id) {
            None => Err(DirectoryError::NotFound(list_id)),
            Some(list) if list.owner_id != owner_id => Err(DirectoryError::NotOwner(list_id)),
            Some(_) => Ok(()),
        }
    }

    fn edit(
        &self,
        owner_id: Uuid,
        list_id: Uuid,
        change: impl FnOnce(&mut BroadcastList),
    ) -> Result<BroadcastList, DirectoryError> {
        self.owned(owner_id, list_id)?;
        let mut lists = self.lists.lock().unwrap();
        let list = lists
            .get_mut(&list_id)
            .ok_or(DirectoryError::NotFound(list_id))?;
        change(list);
        Ok(list.clone())
    }
}

#[async_trait]
impl BroadcastDirectory for MemoryDirectory {
    async fn create_list(
        &self,
        owner_id: Uuid,
        title: &str,
        beneficiary_ids: &[Uuid],
    ) -> Result<BroadcastList, DirectoryError> {
        let list = BroadcastList {
            id: Uuid::new_v4(),
            owner_id,
            title: title.to_string(),
            beneficiary_ids: beneficiary_ids.to_vec(),
        };
        self.lists.lock().unwrap().insert(list.id, list.clone());
        Ok(list)
    }

    async fn get_list(&self, list_id: Uuid) -> Result<BroadcastList, DirectoryError> {
        self.lists
            .lock()
            .unwrap()
            .get(&list_id)
            .cloned()
            .ok_or(DirectoryError::NotFound(list_id))
    }

    async fn lists_for(&self, owner_id: Uuid) -> Result<Vec<BroadcastList>, DirectoryError> {
        Ok(self
            .lists
            .lock()
            .unwrap()
            .values()
            .filter(|l| l.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn add_beneficiary(
        &self,
        owner_id: Uuid,
        list_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<BroadcastList, DirectoryError> {
        self.edit(owner_id, list_id, |list| {
            if !list.beneficiary_ids.contains(&beneficiary_id) {
                list.beneficiary_ids.push(beneficiary_id);
            }
        })
    }

    async fn remove_beneficiary(
        &self,
        owner_id: Uuid,
        list_id: Uuid,
        beneficiary_id: Uuid,
    ) -> Result<BroadcastList, DirectoryError> {
        self.edit(owner_id, list_id, |list| {
            list.beneficiary_ids.retain(|id| *id != beneficiary_id)
        })
    }

    async fn delete_list(&self, owner_id: Uuid, list_id: Uuid) -> Result<(), DirectoryError> {
        self.owned(owner_id, list_id)?;
        self.lists.lock().unwrap().remove(&list_id);
        Ok(())
    }

    async fn record_broadcast(&self, message: &BroadcastMessage) -> Result<(), DirectoryError> {
        self.records.lock().unwrap().push(message.clone());
        Ok(())
    }

    async fn broadcasts_for_list(
        &self,
        list_id: Uuid,
    ) -> Result<Vec<BroadcastMessage>, DirectoryError> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.list_id == list_id)
            .cloned()
            .collect())
    }
}

// -- Observability --

#[derive(Default)]
pub struct RecordingReporter(Mutex<Vec<ErrorReport>>);

impl RecordingReporter {
    pub fn reports(&self) -> Vec<ErrorReport> {
        self.0.lock().unwrap().clone()
    }

    pub fn fatal_count(&self) -> usize {
        self.reports()
            .iter()
            .filter(|r| matches!(r, ErrorReport::FatalSession { .. }))
            .count()
    }

    pub fn decrypt_failures(&self) -> usize {
        self.reports()
            .iter()
            .filter(|r| matches!(r, ErrorReport::DecryptFailure { .. }))
            .count()
    }
}

impl ErrorReporter for RecordingReporter {
    fn report(&self, report: ErrorReport) {
        self.0.lock().unwrap().push(report);
    }
}

// -- Wiring --

/// A conversation store over fakes, plus handles to poke them.
pub struct Harness {
    pub store: Arc<FakeStore>,
    pub api: Arc<FakeApi>,
    pub reporter: Arc<RecordingReporter>,
    pub broker: Arc<CredentialBroker>,
    pub crypto: CryptoEngine,
    pub conversations: Arc<ConversationStore>,
    pub counsellor_id: Uuid,
}

impl Harness {
    pub fn new() -> Self {
        let store = Arc::new(FakeStore::default());
        let api = Arc::new(FakeApi::default());
        let reporter = Arc::new(RecordingReporter::default());
        let broker = Arc::new(CredentialBroker::new(
            api.clone(),
            store.clone(),
            reporter.clone(),
            quick_config(),
        ));
        let crypto = CryptoEngine::new(reporter.clone());
        let counsellor_id = Uuid::new_v4();
        let conversations = Arc::new(ConversationStore::new(
            store.clone(),
            broker.clone(),
            crypto.clone(),
            Arc::new(DerivedKeyResolver::new(broker.clone())),
            counsellor_id,
        ));
        Self {
            store,
            api,
            reporter,
            broker,
            crypto,
            conversations,
            counsellor_id,
        }
    }

    pub fn key_for(&self, conversation: &ConversationRef) -> ConversationKey {
        self.api
            .material
            .derive_conversation_key(&conversation.conversation_id)
            .unwrap()
    }

    /// Write a message as the beneficiary application would, summary included.
    pub async fn beneficiary_writes(
        &self,
        conversation: &ConversationRef,
        text: &str,
        created_at: DateTime<Utc>,
    ) -> Uuid {
        let key = self.key_for(conversation);
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.conversation_id,
            sender_role: SenderRole::Beneficiary,
            author_id: Some(conversation.beneficiary_id),
            created_at,
            body: Some(self.crypto.encrypt(text, &key).unwrap()),
            kind: MessageKind::Plain,
            broadcast_id: None,
        };
        self.store
            .append_message(
                conversation.conversation_id,
                message.id,
                MessageDocument::from_message(&message),
            )
            .await
            .unwrap();
        self.store
            .upsert_conversation(
                conversation.conversation_id,
                ConversationPatch {
                    last_message: Some(LastMessage {
                        preview_encrypted: self.crypto.encrypt(text, &key).unwrap(),
                        at: created_at,
                        sender_role: SenderRole::Beneficiary,
                    }),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        message.id
    }
}

// -- Views --

pub type ViewSink = mpsc::UnboundedReceiver<Arc<ConversationView>>;

/// Callback that forwards every view to a channel.
pub fn view_sink() -> (impl Fn(Arc<ConversationView>) + Send + Sync + 'static, ViewSink) {
    let (tx, rx) = mpsc::unbounded_channel();
    (
        move |view: Arc<ConversationView>| {
            let _ = tx.send(view);
        },
        rx,
    )
}

/// Wait for the first view matching `predicate`.
pub async fn wait_for(
    sink: &mut ViewSink,
    predicate: impl Fn(&ConversationView) -> bool,
) -> Arc<ConversationView> {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let view = sink.recv().await.expect("view channel closed");
            if predicate(&view) {
                return view;
            }
        }
    })
    .await
    .expect("timed out waiting for view")
}

/// Let spawned feed tasks drain their queues.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}
