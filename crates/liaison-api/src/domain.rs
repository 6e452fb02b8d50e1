use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};

use liaison_types::store::{ApiError, DomainApi, RealtimeGrant};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Deserialize)]
struct TokenResponse {
    token: String,
    key: String,
}

/// Domain API client. Exchanges the application session for real-time
/// store credentials.
pub struct HttpDomainApi {
    client: Client,
    base_url: String,
    session_token: String,
}

impl HttpDomainApi {
    pub fn new(base_url: impl Into<String>, session_token: impl Into<String>) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session_token: session_token.into(),
        })
    }
}

#[async_trait]
impl DomainApi for HttpDomainApi {
    async fn mint_realtime_token(&self) -> Result<RealtimeGrant, ApiError> {
        let url = format!("{}/auth/realtime/token", self.base_url);
        let resp = self
            .client
            .post(&url)
            .bearer_auth(&self.session_token)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;

        match resp.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                warn!("Domain API rejected the application session");
                return Err(ApiError::Unauthorized);
            }
            status if !status.is_success() => return Err(ApiError::Status(status.as_u16())),
            _ => {}
        }

        let body: TokenResponse = resp
            .json()
            .await
            .map_err(|e| ApiError::Decode(e.to_string()))?;
        debug!("Real-time token minted by {}", self.base_url);
        Ok(RealtimeGrant {
            token: body.token,
            key: body.key,
        })
    }
}

#[cfg(test)]
mod tests {
    use axum::{Json, Router, http::HeaderMap, response::IntoResponse, routing::post};
    use serde_json::json;

    use super::*;

    async fn fake_domain_api(status: axum::http::StatusCode) -> String {
        let app = Router::new().route(
            "/auth/realtime/token",
            post(move |headers: HeaderMap| async move {
                let authorized = headers
                    .get("authorization")
                    .and_then(|v| v.to_str().ok())
                    == Some("Bearer app-session");
                if !authorized {
                    return axum::http::StatusCode::UNAUTHORIZED.into_response();
                }
                if status != axum::http::StatusCode::OK {
                    return status.into_response();
                }
                Json(json!({ "token": "store-token", "key": "a2V5" })).into_response()
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/", addr)
    }

    #[tokio::test]
    async fn mints_token_with_session_bearer() {
        let base = fake_domain_api(axum::http::StatusCode::OK).await;
        let api = HttpDomainApi::new(base, "app-session").unwrap();

        let grant = api.mint_realtime_token().await.unwrap();
        assert_eq!(grant.token, "store-token");
        assert_eq!(grant.key, "a2V5");
    }

    #[tokio::test]
    async fn rejected_session_is_unauthorized() {
        let base = fake_domain_api(axum::http::StatusCode::OK).await;
        let api = HttpDomainApi::new(base, "stale-session").unwrap();
        assert_eq!(api.mint_realtime_token().await.unwrap_err(), ApiError::Unauthorized);
    }

    #[tokio::test]
    async fn server_errors_keep_their_status() {
        let base = fake_domain_api(axum::http::StatusCode::BAD_GATEWAY).await;
        let api = HttpDomainApi::new(base, "app-session").unwrap();
        assert_eq!(api.mint_realtime_token().await.unwrap_err(), ApiError::Status(502));
    }

    #[tokio::test]
    async fn unreachable_api_is_a_transport_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let api = HttpDomainApi::new(format!("http://{}", addr), "app-session").unwrap();
        assert!(matches!(
            api.mint_realtime_token().await,
            Err(ApiError::Transport(_))
        ));
    }
}
