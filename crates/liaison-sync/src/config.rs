use std::time::Duration;

/// Tuning knobs for the conversation layer.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Extra attempts after a transient store failure.
    pub transient_retries: u32,
    pub retry_delay: Duration,
    /// Pause before a lost listener is attached again after the retries ran
    /// out.
    pub reattach_interval: Duration,
    /// Longest decrypted preview kept on a conversation summary.
    pub preview_chars: usize,
    /// Credentials this close to expiry are refreshed before use.
    pub refresh_skew: Duration,
    /// Lifetime assumed when the store token carries no readable expiry.
    pub default_credential_ttl: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            transient_retries: 1,
            retry_delay: Duration::from_millis(250),
            reattach_interval: Duration::from_secs(5),
            preview_chars: 60,
            refresh_skew: Duration::from_secs(60),
            default_credential_ttl: Duration::from_secs(55 * 60),
        }
    }
}
