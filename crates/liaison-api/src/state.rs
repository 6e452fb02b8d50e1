use std::sync::Arc;

use uuid::Uuid;

use liaison_sync::{BroadcastFanoutService, ConversationStore, PortfolioSyncCoordinator};
use liaison_types::store::BroadcastDirectory;

pub type AppState = Arc<AppStateInner>;

/// Everything the portal handlers reach. The surface acts for a single
/// counsellor, fixed at startup.
pub struct AppStateInner {
    pub counsellor_id: Uuid,
    pub conversations: Arc<ConversationStore>,
    pub portfolio: Arc<PortfolioSyncCoordinator>,
    pub directory: Arc<dyn BroadcastDirectory>,
    pub fanout: Arc<BroadcastFanoutService>,
}
