use std::future::Future;

use tracing::warn;

use liaison_types::store::StoreError;

use crate::config::SyncConfig;

/// Run `op`, retrying transient store failures up to
/// `config.transient_retries` extra times. Other errors return immediately.
pub(crate) async fn with_transient_retry<T, F, Fut>(
    config: &SyncConfig,
    what: &str,
    mut op: F,
) -> Result<T, StoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, StoreError>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < config.transient_retries => {
                attempt += 1;
                warn!("{} failed ({}), retry {}/{}", what, e, attempt, config.transient_retries);
                tokio::time::sleep(config.retry_delay).await;
            }
            result => return result,
        }
    }
}
