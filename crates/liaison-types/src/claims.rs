use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Claims carried by a real-time store session token. Minted by the domain
/// API, verified by the store on sign-in, read by the credential broker for
/// the expiry marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeClaims {
    pub sub: Uuid,
    pub exp: usize,
}
