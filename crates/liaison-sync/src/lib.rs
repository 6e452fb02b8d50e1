//! Encrypted real-time conversation layer.
//!
//! [`CredentialBroker`] opens the real-time session, [`ConversationStore`]
//! keeps one live decrypted view per conversation,
//! [`PortfolioSyncCoordinator`] tracks every conversation of a counsellor's
//! portfolio and [`BroadcastFanoutService`] sends one message to a whole list.

pub mod broadcast;
pub mod config;
pub mod conversation;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod observability;
pub mod portfolio;
mod retry;
pub mod view;

#[cfg(test)]
mod testing;

pub use broadcast::{BroadcastFanoutService, FanoutOutcome};
pub use config::SyncConfig;
pub use conversation::{ConversationStore, OutgoingMessage, Subscription};
pub use credentials::{CredentialBroker, Credentials};
pub use error::SyncError;
pub use keys::{DerivedKeyResolver, KeyResolver};
pub use observability::TracingReporter;
pub use portfolio::{PortfolioDiff, PortfolioEvent, PortfolioSyncCoordinator};
pub use view::{ConversationView, DayGroup, DecryptedMessage};
