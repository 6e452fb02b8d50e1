use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{DecodingKey, Validation, decode, decode_header};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use liaison_crypto::KeyMaterial;
use liaison_types::claims::RealtimeClaims;
use liaison_types::report::{ErrorReport, ErrorReporter};
use liaison_types::store::{ApiError, DomainApi, RealtimeStore, StoreError};

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::retry::with_transient_retry;

/// Real-time store session plus the key material that opens its payloads.
/// Shared read-only; only the broker replaces it.
#[derive(Debug)]
pub struct Credentials {
    pub token: String,
    pub key: KeyMaterial,
    pub expires_at: DateTime<Utc>,
    /// Bumped on every acquisition.
    pub generation: u64,
}

impl Credentials {
    pub fn expires_within(&self, skew: chrono::Duration) -> bool {
        self.expires_at - skew <= Utc::now()
    }
}

/// Exchanges the application session for real-time store credentials and
/// keeps exactly one set alive per session.
///
/// Concurrent refreshes are coalesced behind `in_flight`: a caller that finds
/// a newer generation than the one it saw fail reuses it instead of minting
/// again.
pub struct CredentialBroker {
    api: Arc<dyn DomainApi>,
    store: Arc<dyn RealtimeStore>,
    reporter: Arc<dyn ErrorReporter>,
    config: SyncConfig,
    current: RwLock<Option<Arc<Credentials>>>,
    /// Last generation issued. Held for the whole acquisition.
    in_flight: Mutex<u64>,
    fatal_reported: AtomicBool,
}

impl CredentialBroker {
    pub fn new(
        api: Arc<dyn DomainApi>,
        store: Arc<dyn RealtimeStore>,
        reporter: Arc<dyn ErrorReporter>,
        config: SyncConfig,
    ) -> Self {
        Self {
            api,
            store,
            reporter,
            config,
            current: RwLock::new(None),
            in_flight: Mutex::new(0),
            fatal_reported: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Cached credentials, or a fresh acquisition when there are none.
    pub async fn acquire(&self) -> Result<Arc<Credentials>, SyncError> {
        match self.current() {
            Some(creds) => Ok(creds),
            None => self.reacquire(None).await,
        }
    }

    /// Like [`acquire`](Self::acquire), but replaces credentials that are
    /// about to expire.
    pub async fn refresh_if_needed(&self) -> Result<Arc<Credentials>, SyncError> {
        match self.current() {
            Some(creds) if !creds.expires_within(self.skew()) => Ok(creds),
            Some(creds) => self.reacquire(Some(creds.generation)).await,
            None => self.reacquire(None).await,
        }
    }

    pub fn current(&self) -> Option<Arc<Credentials>> {
        self.current.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Forget the credentials, on logout.
    pub fn discard(&self) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
        info!("Real-time credentials discarded");
    }

    /// Run a store operation with valid credentials.
    ///
    /// Transient failures are retried per [`SyncConfig::transient_retries`].
    /// A rejected session triggers one re-acquisition and one more run; a
    /// second rejection is fatal and reported.
    pub async fn run<T, F, Fut>(&self, what: &str, op: F) -> Result<T, SyncError>
    where
        F: Fn(Arc<Credentials>) -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let creds = self.refresh_if_needed().await?;
        let reason = match with_transient_retry(&self.config, what, || op(creds.clone())).await {
            Ok(value) => return Ok(value),
            Err(StoreError::Unauthenticated(reason)) => reason,
            Err(e) => return Err(SyncError::Store(e)),
        };

        warn!("{} rejected by the real-time store ({}), re-acquiring credentials", what, reason);
        let fresh = self.reacquire(Some(creds.generation)).await?;
        match with_transient_retry(&self.config, what, || op(fresh.clone())).await {
            Ok(value) => Ok(value),
            Err(StoreError::Unauthenticated(reason)) => Err(self.fatal(reason)),
            Err(e) => Err(SyncError::Store(e)),
        }
    }

    /// Treat a rejection seen outside [`run`](Self::run), such as a listener
    /// dropped by the store, as a hint to re-acquire.
    pub async fn recover_from_rejection(&self, seen_generation: u64) -> Result<Arc<Credentials>, SyncError> {
        self.reacquire(Some(seen_generation)).await
    }

    /// Report a session loss and build the error for the caller.
    pub fn fatal(&self, reason: String) -> SyncError {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
        if !self.fatal_reported.swap(true, Ordering::SeqCst) {
            error!("Real-time credentials rejected twice: {}", reason);
            self.reporter.report(ErrorReport::FatalSession {
                reason: reason.clone(),
            });
        }
        SyncError::SessionExpired(reason)
    }

    fn skew(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.refresh_skew).unwrap_or(chrono::Duration::zero())
    }

    async fn reacquire(&self, stale_generation: Option<u64>) -> Result<Arc<Credentials>, SyncError> {
        let mut last_generation = self.in_flight.lock().await;

        // Someone else refreshed while we were waiting.
        if let Some(creds) = self.current() {
            let newer = stale_generation.is_none_or(|stale| creds.generation > stale);
            if newer && !creds.expires_within(self.skew()) {
                return Ok(creds);
            }
        }

        let grant = match self.api.mint_realtime_token().await {
            Ok(grant) => grant,
            Err(ApiError::Unauthorized) => {
                return Err(self.fatal("application session rejected by the domain API".into()));
            }
            Err(e) => return Err(SyncError::Api(e)),
        };
        let key = KeyMaterial::from_base64(&grant.key)?;

        match with_transient_retry(&self.config, "sign-in", || self.store.sign_in(&grant.token)).await {
            Ok(()) => {}
            Err(StoreError::Unauthenticated(reason)) => return Err(self.fatal(reason)),
            Err(e) => return Err(SyncError::Store(e)),
        }

        let expires_at = token_expiry(&grant.token).unwrap_or_else(|| {
            Utc::now()
                + chrono::Duration::from_std(self.config.default_credential_ttl)
                    .unwrap_or(chrono::Duration::zero())
        });

        *last_generation += 1;
        let creds = Arc::new(Credentials {
            token: grant.token,
            key,
            expires_at,
            generation: *last_generation,
        });
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(creds.clone());
        self.fatal_reported.store(false, Ordering::SeqCst);

        info!(
            "Real-time credentials acquired (generation {}, key {}, expires {})",
            creds.generation,
            creds.key.fingerprint(),
            creds.expires_at
        );
        Ok(creds)
    }
}

/// Read `exp` from a JWT without checking its signature. The store verifies
/// the token; the broker only needs to know when to refresh it.
pub fn token_expiry(token: &str) -> Option<DateTime<Utc>> {
    let header = decode_header(token).ok()?;
    let mut validation = Validation::new(header.alg);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.required_spec_claims.clear();

    let data = decode::<RealtimeClaims>(token, &DecodingKey::from_secret(&[]), &validation).ok()?;
    Utc.timestamp_opt(data.claims.exp as i64, 0).single()
}
