use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use liaison_crypto::{ConversationKey, CryptoEngine, DECRYPTION_FAILED, DecryptOrigin, Opened};
use liaison_types::documents::{
    ConversationDocument, ConversationPatch, LastMessage, MessageDocument,
};
use liaison_types::models::{
    Conversation, ConversationRef, EncryptedPayload, Message, MessageKind, SenderRole,
};
use liaison_types::store::{
    ListenTarget, ListenerId, RealtimeStore, SnapshotHandler, StoreError, StoreEvent,
};

use crate::credentials::CredentialBroker;
use crate::error::SyncError;
use crate::keys::KeyResolver;
use crate::view::{ConversationView, DecryptedMessage};

type ViewCallback = Arc<dyn Fn(Arc<ConversationView>) + Send + Sync>;
type FeedSender = mpsc::UnboundedSender<(ListenTarget, StoreEvent)>;

/// Text plus what it carries, ready to be encrypted and sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub kind: MessageKind,
    pub content: String,
}

impl OutgoingMessage {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: MessageKind::Plain,
            content: content.into(),
        }
    }
}

/// Live, decrypted access to the conversations of one counsellor.
pub struct ConversationStore {
    store: Arc<dyn RealtimeStore>,
    broker: Arc<CredentialBroker>,
    crypto: CryptoEngine,
    keys: Arc<dyn KeyResolver>,
    counsellor_id: Uuid,
}

impl ConversationStore {
    pub fn new(
        store: Arc<dyn RealtimeStore>,
        broker: Arc<CredentialBroker>,
        crypto: CryptoEngine,
        keys: Arc<dyn KeyResolver>,
        counsellor_id: Uuid,
    ) -> Self {
        Self {
            store,
            broker,
            crypto,
            keys,
            counsellor_id,
        }
    }

    pub fn counsellor_id(&self) -> Uuid {
        self.counsellor_id
    }

    pub fn conversation(&self, beneficiary_id: Uuid) -> ConversationRef {
        ConversationRef::new(self.counsellor_id, beneficiary_id)
    }

    /// Attach to a conversation and call `on_change` with a fresh view after
    /// every change, on a dedicated task. Views arrive in order and never
    /// after [`Subscription::unsubscribe`] has returned.
    ///
    /// Listeners stay attached until the subscription is unsubscribed or
    /// dropped.
    pub async fn subscribe<F>(
        &self,
        conversation: ConversationRef,
        on_change: F,
    ) -> Result<Subscription, SyncError>
    where
        F: Fn(Arc<ConversationView>) + Send + Sync + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = conversation.conversation_id;

        let mut attached = HashMap::new();
        for target in [ListenTarget::Messages(id), ListenTarget::Summary(id)] {
            match attach(&self.store, &self.broker, target, &tx).await {
                Ok(listener) => {
                    attached.insert(target, listener);
                }
                Err(e) => {
                    for listener in attached.into_values() {
                        self.store.detach(listener).await;
                    }
                    return Err(e);
                }
            }
        }

        let inner = Arc::new(SubscriptionInner {
            conversation,
            store: self.store.clone(),
            closed: AtomicBool::new(false),
            gate: Mutex::new(()),
            shutdown: Notify::new(),
            listeners: tokio::sync::Mutex::new(attached),
        });

        let feed = Feed {
            conversation,
            store: self.store.clone(),
            broker: self.broker.clone(),
            crypto: self.crypto.clone(),
            keys: self.keys.clone(),
            inner: inner.clone(),
            on_change: Arc::new(on_change),
            tx,
            messages: BTreeMap::new(),
            known: HashSet::new(),
            summary: None,
            preview_source: None,
            preview: None,
            lost: HashSet::new(),
            session_expired: false,
        };
        tokio::spawn(feed.run(rx));

        debug!("Subscribed to conversation {}", id);
        Ok(Subscription { inner })
    }

    /// Record that the counsellor has seen the conversation up to `at`.
    /// Failures are logged and otherwise ignored.
    pub async fn mark_seen_by_counsellor(&self, conversation: &ConversationRef, at: DateTime<Utc>) {
        let result = self
            .upsert(conversation, "mark seen", ConversationPatch::seen_by_counsellor(at))
            .await;
        if let Err(e) = result {
            warn!(
                "Failed to mark conversation {} as seen: {}",
                conversation.conversation_id, e
            );
        }
    }

    pub async fn set_flagged(
        &self,
        conversation: &ConversationRef,
        flagged: bool,
    ) -> Result<(), SyncError> {
        self.upsert(conversation, "flag", ConversationPatch::flagged(flagged))
            .await?;
        info!(
            "Conversation {} {}",
            conversation.conversation_id,
            if flagged { "flagged" } else { "unflagged" }
        );
        Ok(())
    }

    /// Encrypt and send a message to one beneficiary.
    pub async fn send_message(
        &self,
        beneficiary_id: Uuid,
        message: OutgoingMessage,
    ) -> Result<Message, SyncError> {
        if matches!(message.kind, MessageKind::SystemNotice { .. }) {
            return Err(SyncError::InvalidMessage("system notices are not authored by counsellors"));
        }
        if message.content.trim().is_empty() {
            return Err(SyncError::InvalidMessage("message is empty"));
        }
        let conversation = self.conversation(beneficiary_id);
        let key = self.keys.conversation_key(&conversation).await?;
        self.deliver(&conversation, &key, &message.content, message.kind, None)
            .await
    }

    /// Append an encrypted message, then point the summary at it.
    ///
    /// The two writes are independent. A failed summary update is logged and
    /// the message still counts as sent.
    pub(crate) async fn deliver(
        &self,
        conversation: &ConversationRef,
        key: &ConversationKey,
        content: &str,
        kind: MessageKind,
        broadcast_id: Option<Uuid>,
    ) -> Result<Message, SyncError> {
        let message = Message {
            id: Uuid::new_v4(),
            conversation_id: conversation.conversation_id,
            sender_role: SenderRole::Counsellor,
            author_id: Some(self.counsellor_id),
            created_at: Utc::now(),
            body: Some(self.crypto.encrypt(content, key)?),
            kind,
            broadcast_id,
        };
        let document = MessageDocument::from_message(&message);

        let store = self.store.clone();
        let (conversation_id, message_id) = (message.conversation_id, message.id);
        self.broker
            .run("append message", |_| {
                let store = store.clone();
                let document = document.clone();
                async move {
                    store
                        .append_message(conversation_id, message_id, document)
                        .await
                }
            })
            .await?;

        let preview = truncate_preview(content, self.broker.config().preview_chars);
        let patch = ConversationPatch {
            last_message: Some(LastMessage {
                preview_encrypted: self.crypto.encrypt(&preview, key)?,
                at: message.created_at,
                sender_role: SenderRole::Counsellor,
            }),
            ..Default::default()
        };
        if let Err(e) = self.upsert(conversation, "update summary", patch).await {
            warn!(
                "Message {} sent but summary of {} not updated: {}",
                message.id, conversation.conversation_id, e
            );
        }

        debug!(
            "Message {} sent to conversation {}",
            message.id, conversation.conversation_id
        );
        Ok(message)
    }

    async fn upsert(
        &self,
        conversation: &ConversationRef,
        what: &str,
        patch: ConversationPatch,
    ) -> Result<(), SyncError> {
        let store = self.store.clone();
        let id = conversation.conversation_id;
        self.broker
            .run(what, |_| {
                let store = store.clone();
                let patch = patch.clone();
                async move { store.upsert_conversation(id, patch).await }
            })
            .await
    }
}

/// Cut a preview to `max` characters, marking the cut with an ellipsis.
pub fn truncate_preview(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(max).collect();
    cut.push('…');
    cut
}

async fn attach(
    store: &Arc<dyn RealtimeStore>,
    broker: &CredentialBroker,
    target: ListenTarget,
    tx: &FeedSender,
) -> Result<ListenerId, SyncError> {
    let handler: SnapshotHandler = {
        let tx = tx.clone();
        Arc::new(move |event: StoreEvent| {
            let _ = tx.send((target, event));
        })
    };
    broker
        .run("listen", |_| {
            let store = store.clone();
            let handler = handler.clone();
            async move { store.listen(target, handler).await }
        })
        .await
}

// -- Subscription --

struct SubscriptionInner {
    conversation: ConversationRef,
    store: Arc<dyn RealtimeStore>,
    closed: AtomicBool,
    /// Held while a callback runs.
    gate: Mutex<()>,
    shutdown: Notify,
    listeners: tokio::sync::Mutex<HashMap<ListenTarget, ListenerId>>,
}

/// Handle on a live conversation.
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
}

impl Subscription {
    pub fn conversation(&self) -> ConversationRef {
        self.inner.conversation
    }

    pub fn is_active(&self) -> bool {
        !self.inner.closed.load(Ordering::SeqCst)
    }

    /// Detach from the store. Idempotent. Once this returns the callback is
    /// never invoked again, even for snapshots already queued.
    pub async fn unsubscribe(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        // Wait out a callback that is already running.
        drop(self.inner.gate.lock().unwrap_or_else(|e| e.into_inner()));
        self.inner.shutdown.notify_one();

        let listeners: Vec<ListenerId> = self
            .inner
            .listeners
            .lock()
            .await
            .drain()
            .map(|(_, id)| id)
            .collect();
        for id in listeners {
            self.inner.store.detach(id).await;
        }
        debug!(
            "Unsubscribed from conversation {}",
            self.inner.conversation.conversation_id
        );
    }
}

impl Drop for Subscription {
    /// A dropped handle stops the feed, which then detaches the listeners.
    fn drop(&mut self) {
        if !self.inner.closed.swap(true, Ordering::SeqCst) {
            self.inner.shutdown.notify_one();
        }
    }
}

// -- Feed --

/// Owns the decrypted state of one subscription. Runs on its own task and
/// folds store pushes into views.
struct Feed {
    conversation: ConversationRef,
    store: Arc<dyn RealtimeStore>,
    broker: Arc<CredentialBroker>,
    crypto: CryptoEngine,
    keys: Arc<dyn KeyResolver>,
    inner: Arc<SubscriptionInner>,
    on_change: ViewCallback,
    tx: FeedSender,
    messages: BTreeMap<(DateTime<Utc>, Uuid), DecryptedMessage>,
    /// Every id ever seen, including malformed documents.
    known: HashSet<Uuid>,
    summary: Option<ConversationDocument>,
    preview_source: Option<EncryptedPayload>,
    preview: Option<String>,
    lost: HashSet<ListenTarget>,
    session_expired: bool,
}

impl Feed {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<(ListenTarget, StoreEvent)>) {
        loop {
            let (target, event) = tokio::select! {
                _ = self.inner.shutdown.notified() => break,
                next = rx.recv() => match next {
                    Some(next) => next,
                    None => break,
                },
            };
            if self.inner.closed.load(Ordering::SeqCst) {
                break;
            }

            match event {
                StoreEvent::Messages(docs) => self.merge_messages(docs).await,
                StoreEvent::Summary(doc) => self.apply_summary(doc).await,
                StoreEvent::Error(e) => {
                    warn!("Listener on {:?} lost: {}", target, e);
                    self.lost.insert(target);
                    self.emit();
                    self.reattach(target, e).await;
                    continue;
                }
            }
            self.emit();
        }

        let leftover: Vec<ListenerId> = self
            .inner
            .listeners
            .lock()
            .await
            .drain()
            .map(|(_, id)| id)
            .collect();
        for id in leftover {
            self.store.detach(id).await;
        }
        debug!(
            "Feed for conversation {} stopped",
            self.conversation.conversation_id
        );
    }

    async fn merge_messages(&mut self, docs: Vec<(Uuid, MessageDocument)>) {
        let fresh: Vec<(Uuid, MessageDocument)> = docs
            .into_iter()
            .filter(|(id, _)| !self.known.contains(id))
            .collect();
        if fresh.is_empty() {
            return;
        }

        let key = if fresh.iter().any(|(_, doc)| doc.encrypted_body.is_some()) {
            Some(self.resolve_key().await)
        } else {
            None
        };

        for (id, doc) in fresh {
            self.known.insert(id);
            let origin = DecryptOrigin {
                conversation_id: Some(self.conversation.conversation_id),
                message_id: Some(id),
            };
            let message = match doc.into_message(id, self.conversation.conversation_id) {
                Ok(message) => message,
                Err(e) => {
                    self.crypto.report_failure(origin, e.to_string());
                    continue;
                }
            };

            let (text, decrypt_failed) = match &message.body {
                None => (None, false),
                Some(body) => match key.as_ref() {
                    Some(Ok(key)) => match self.crypto.open(body, key, origin) {
                        Opened::Text(text) => (Some(text), false),
                        Opened::Failed => (Some(DECRYPTION_FAILED.to_string()), true),
                    },
                    Some(Err(reason)) => {
                        self.crypto.report_failure(origin, reason.clone());
                        (Some(DECRYPTION_FAILED.to_string()), true)
                    }
                    None => {
                        self.crypto.report_failure(origin, "no key resolved".into());
                        (Some(DECRYPTION_FAILED.to_string()), true)
                    }
                },
            };

            self.messages.insert(
                (message.created_at, message.id),
                DecryptedMessage {
                    id: message.id,
                    sender_role: message.sender_role,
                    author_id: message.author_id,
                    created_at: message.created_at,
                    text,
                    decrypt_failed,
                    kind: message.kind,
                    broadcast_id: message.broadcast_id,
                },
            );
        }
    }

    async fn apply_summary(&mut self, doc: Option<ConversationDocument>) {
        let payload = doc
            .as_ref()
            .and_then(|d| d.last_message_preview_encrypted.clone());

        // Decrypt only when the preview changed, so a bad preview is reported
        // once and not on every push.
        if payload != self.preview_source {
            self.preview = match &payload {
                None => None,
                Some(payload) => Some(self.open_preview(payload).await),
            };
            self.preview_source = payload;
        }
        self.summary = doc;
    }

    async fn open_preview(&mut self, payload: &EncryptedPayload) -> String {
        let origin = DecryptOrigin {
            conversation_id: Some(self.conversation.conversation_id),
            message_id: None,
        };
        let text = match self.resolve_key().await {
            Ok(key) => self.crypto.open(payload, &key, origin).into_text(),
            Err(reason) => {
                self.crypto.report_failure(origin, reason);
                DECRYPTION_FAILED.to_string()
            }
        };
        truncate_preview(&text, self.broker.config().preview_chars)
    }

    async fn resolve_key(&mut self) -> Result<ConversationKey, String> {
        match self.keys.conversation_key(&self.conversation).await {
            Ok(key) => Ok(key),
            Err(e) => {
                if e.is_fatal() {
                    self.session_expired = true;
                }
                Err(e.to_string())
            }
        }
    }

    async fn reattach(&mut self, target: ListenTarget, cause: StoreError) {
        let old = self.inner.listeners.lock().await.remove(&target);
        if let Some(old) = old {
            self.store.detach(old).await;
        }

        match attach(&self.store, &self.broker, target, &self.tx).await {
            Ok(id) => {
                let mut listeners = self.inner.listeners.lock().await;
                if self.inner.closed.load(Ordering::SeqCst) {
                    drop(listeners);
                    self.store.detach(id).await;
                    return;
                }
                listeners.insert(target, id);
                self.lost.remove(&target);
                info!("Listener on {:?} re-attached after: {}", target, cause);
            }
            Err(e) if e.is_fatal() => {
                self.session_expired = true;
                self.emit();
            }
            Err(e) => {
                warn!(
                    "Could not re-attach listener on {:?}, retrying in {:?}: {}",
                    target,
                    self.broker.config().reattach_interval,
                    e
                );
                let tx = self.tx.clone();
                let delay = self.broker.config().reattach_interval;
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = tx.send((target, StoreEvent::Error(cause)));
                });
            }
        }
    }

    fn view(&self) -> ConversationView {
        let doc = self.summary.clone().unwrap_or_default();
        ConversationView {
            conversation: Conversation {
                id: self.conversation.conversation_id,
                beneficiary_id: self.conversation.beneficiary_id,
                last_message_preview: self.preview.clone(),
                last_message_at: doc.last_message_at,
                last_sender_role: doc.last_sender_role,
                flagged: doc.flagged,
                seen_by_counsellor_at: doc.seen_by_counsellor_at,
                seen_by_beneficiary_at: doc.seen_by_beneficiary_at,
            },
            messages: self.messages.values().cloned().collect(),
            stale: !self.lost.is_empty(),
            session_expired: self.session_expired,
        }
    }

    fn emit(&self) {
        let view = Arc::new(self.view());
        let _gate = self.inner.gate.lock().unwrap_or_else(|e| e.into_inner());
        if self.inner.closed.load(Ordering::SeqCst) {
            return;
        }
        (self.on_change)(view);
    }
}
