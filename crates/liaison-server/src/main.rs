mod config;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use liaison_api::{AppStateInner, HttpDomainApi};
use liaison_crypto::CryptoEngine;
use liaison_db::{Database, LocalStore, SqliteDirectory};
use liaison_sync::{
    BroadcastFanoutService, ConversationStore, CredentialBroker, DerivedKeyResolver,
    PortfolioEvent, PortfolioSyncCoordinator, SyncConfig, TracingReporter,
};

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "liaison=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Storage
    let db = Arc::new(Database::open(&config.db_path)?);
    let store = Arc::new(match &config.store_secret {
        Some(secret) => LocalStore::with_secret(db.clone(), secret),
        None => {
            warn!("LIAISON_STORE_SECRET not set, the local store accepts any token");
            LocalStore::new(db.clone())
        }
    });
    let directory = Arc::new(SqliteDirectory::new(db));

    // Messaging core
    let reporter = Arc::new(TracingReporter);
    let api = Arc::new(HttpDomainApi::new(&config.api_url, &config.session_token)?);
    let broker = Arc::new(CredentialBroker::new(
        api,
        store.clone(),
        reporter.clone(),
        SyncConfig::default(),
    ));
    let keys = Arc::new(DerivedKeyResolver::new(broker.clone()));
    let conversations = Arc::new(ConversationStore::new(
        store,
        broker.clone(),
        CryptoEngine::new(reporter),
        keys.clone(),
        config.counsellor_id,
    ));
    let portfolio = Arc::new(PortfolioSyncCoordinator::new(conversations.clone()));
    let fanout = Arc::new(BroadcastFanoutService::new(
        directory.clone(),
        conversations.clone(),
        keys,
    ));

    spawn_session_watch(&portfolio);

    if !config.portfolio.is_empty() {
        match portfolio.sync_portfolio(&config.portfolio).await {
            Ok(diff) => info!("Tracking {} conversations", diff.added.len()),
            Err(e) => error!("Initial portfolio sync failed: {}", e),
        }
    }

    let state = Arc::new(AppStateInner {
        counsellor_id: config.counsellor_id,
        conversations,
        portfolio: portfolio.clone(),
        directory,
        fanout,
    });

    let app = liaison_api::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http());

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    info!(
        "Liaison portal for counsellor {} listening on {}",
        config.counsellor_id, addr
    );

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    portfolio.shutdown().await;
    broker.discard();
    Ok(())
}

/// Surface session loss in the logs; the portal answers 401 until restarted
/// with a fresh application session.
fn spawn_session_watch(portfolio: &PortfolioSyncCoordinator) {
    let mut events = portfolio.subscribe_events();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(PortfolioEvent::SessionExpired) => {
                    error!("Real-time session expired, sign in again and restart the portal");
                }
                Ok(PortfolioEvent::Updated { .. }) => {}
                Err(RecvError::Lagged(n)) => warn!("Portfolio event watcher lagged by {} events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        let mut sigterm =
            match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
                Ok(sigterm) => sigterm,
                Err(e) => {
                    warn!("SIGTERM handler unavailable: {}", e);
                    ctrl_c.await.ok();
                    info!("Received Ctrl+C, shutting down...");
                    return;
                }
            };
        tokio::select! {
            _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
            _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
}
