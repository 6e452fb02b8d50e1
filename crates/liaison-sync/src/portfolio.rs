use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::sync::{broadcast, watch};
use tracing::{info, warn};
use uuid::Uuid;

use crate::conversation::{ConversationStore, Subscription};
use crate::error::SyncError;
use crate::view::ConversationView;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PortfolioDiff {
    pub added: BTreeSet<Uuid>,
    pub removed: BTreeSet<Uuid>,
}

#[derive(Debug, Clone)]
pub enum PortfolioEvent {
    Updated {
        beneficiary_id: Uuid,
        view: Arc<ConversationView>,
    },
    /// The real-time session is gone; the user must sign in again.
    SessionExpired,
}

#[derive(Default)]
struct PortfolioState {
    views: HashMap<Uuid, Arc<ConversationView>>,
    /// Beneficiaries whose conversation currently has unread messages.
    unread: HashSet<Uuid>,
}

/// Keeps one live subscription per beneficiary of the counsellor's
/// portfolio and an aggregate unread flag over all of them.
pub struct PortfolioSyncCoordinator {
    conversations: Arc<ConversationStore>,
    state: Arc<Mutex<PortfolioState>>,
    /// Also serializes portfolio syncs.
    tracked: tokio::sync::Mutex<HashMap<Uuid, Subscription>>,
    unread_tx: Arc<watch::Sender<bool>>,
    events: broadcast::Sender<PortfolioEvent>,
}

impl PortfolioSyncCoordinator {
    pub fn new(conversations: Arc<ConversationStore>) -> Self {
        let (unread_tx, _) = watch::channel(false);
        let (events, _) = broadcast::channel(256);
        Self {
            conversations,
            state: Arc::new(Mutex::new(PortfolioState::default())),
            tracked: tokio::sync::Mutex::new(HashMap::new()),
            unread_tx: Arc::new(unread_tx),
            events,
        }
    }

    /// Make the tracked set equal to `beneficiary_ids`.
    ///
    /// Beneficiaries that left are unsubscribed exactly once. A beneficiary
    /// whose subscription fails for a non-fatal reason is left out of the diff
    /// and picked up by the next sync. A lost session aborts the sync.
    pub async fn sync_portfolio(
        &self,
        beneficiary_ids: &HashSet<Uuid>,
    ) -> Result<PortfolioDiff, SyncError> {
        let mut tracked = self.tracked.lock().await;
        let mut diff = PortfolioDiff::default();

        let leaving: Vec<Uuid> = tracked
            .keys()
            .filter(|id| !beneficiary_ids.contains(id))
            .copied()
            .collect();
        for beneficiary_id in leaving {
            if let Some(subscription) = tracked.remove(&beneficiary_id) {
                subscription.unsubscribe().await;
            }
            self.forget(beneficiary_id);
            diff.removed.insert(beneficiary_id);
        }

        let joining: Vec<Uuid> = beneficiary_ids
            .iter()
            .filter(|id| !tracked.contains_key(id))
            .copied()
            .collect();
        for beneficiary_id in joining {
            let conversation = self.conversations.conversation(beneficiary_id);
            match self
                .conversations
                .subscribe(conversation, self.on_view(beneficiary_id))
                .await
            {
                Ok(subscription) => {
                    tracked.insert(beneficiary_id, subscription);
                    diff.added.insert(beneficiary_id);
                }
                Err(e) if e.is_fatal() => {
                    let _ = self.events.send(PortfolioEvent::SessionExpired);
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        "Could not track conversation with beneficiary {}: {}",
                        beneficiary_id, e
                    );
                }
            }
        }

        info!(
            "Portfolio synced: {} tracked, {} added, {} removed",
            tracked.len(),
            diff.added.len(),
            diff.removed.len()
        );
        Ok(diff)
    }

    /// True when any tracked conversation has unread messages.
    pub fn has_unread(&self) -> bool {
        !self.lock_state().unread.is_empty()
    }

    pub fn watch_unread(&self) -> watch::Receiver<bool> {
        self.unread_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<PortfolioEvent> {
        self.events.subscribe()
    }

    pub fn conversation(&self, beneficiary_id: Uuid) -> Option<Arc<ConversationView>> {
        self.lock_state().views.get(&beneficiary_id).cloned()
    }

    /// Latest view of every tracked conversation, most recent activity first.
    pub fn conversations(&self) -> Vec<Arc<ConversationView>> {
        let mut views: Vec<_> = self.lock_state().views.values().cloned().collect();
        views.sort_by(|a, b| {
            b.conversation
                .last_message_at
                .cmp(&a.conversation.last_message_at)
                .then(a.conversation.beneficiary_id.cmp(&b.conversation.beneficiary_id))
        });
        views
    }

    pub async fn tracked_ids(&self) -> BTreeSet<Uuid> {
        self.tracked.lock().await.keys().copied().collect()
    }

    pub async fn mark_seen(&self, beneficiary_id: Uuid) {
        let conversation = self.conversations.conversation(beneficiary_id);
        self.conversations
            .mark_seen_by_counsellor(&conversation, Utc::now())
            .await;
    }

    pub async fn set_flagged(&self, beneficiary_id: Uuid, flagged: bool) -> Result<(), SyncError> {
        let conversation = self.conversations.conversation(beneficiary_id);
        self.conversations.set_flagged(&conversation, flagged).await
    }

    /// Unsubscribe everything, on logout.
    pub async fn shutdown(&self) {
        let mut tracked = self.tracked.lock().await;
        for (_, subscription) in tracked.drain() {
            subscription.unsubscribe().await;
        }
        {
            let mut state = self.lock_state();
            state.views.clear();
            state.unread.clear();
        }
        self.unread_tx.send_replace(false);
        info!("Portfolio sync stopped");
    }

    fn on_view(&self, beneficiary_id: Uuid) -> impl Fn(Arc<ConversationView>) + Send + Sync + 'static {
        let state = self.state.clone();
        let unread_tx = self.unread_tx.clone();
        let events = self.events.clone();
        move |view: Arc<ConversationView>| {
            let any_unread = {
                let mut state = state.lock().unwrap_or_else(|e| e.into_inner());
                if view.has_unread() {
                    state.unread.insert(beneficiary_id);
                } else {
                    state.unread.remove(&beneficiary_id);
                }
                state.views.insert(beneficiary_id, view.clone());
                !state.unread.is_empty()
            };
            publish_unread(&unread_tx, any_unread);

            let expired = view.session_expired;
            let _ = events.send(PortfolioEvent::Updated {
                beneficiary_id,
                view,
            });
            if expired {
                let _ = events.send(PortfolioEvent::SessionExpired);
            }
        }
    }

    fn forget(&self, beneficiary_id: Uuid) {
        let any_unread = {
            let mut state = self.lock_state();
            state.views.remove(&beneficiary_id);
            state.unread.remove(&beneficiary_id);
            !state.unread.is_empty()
        };
        publish_unread(&self.unread_tx, any_unread);
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PortfolioState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn publish_unread(tx: &watch::Sender<bool>, any_unread: bool) {
    tx.send_if_modified(|current| {
        if *current == any_unread {
            return false;
        }
        *current = any_unread;
        true
    });
}
