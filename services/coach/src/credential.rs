//! Ephemeral session credentials.
//!
//! A credential authorises exactly one streaming session. It must be used to
//! open the session before its start deadline, and the open session stays
//! authorised only until the credential expires.

use crate::config::CredentialConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Errors that can occur while obtaining a credential.
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Token service not configured")]
    NotConfigured,

    #[error("Token request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Token service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Malformed token response: {0}")]
    Malformed(String),
}

/// A short-lived token for one streaming session.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionCredential {
    /// Opaque token value
    pub token: String,

    /// Instant after which an open session is no longer authorised
    pub expires_at: DateTime<Utc>,

    /// Instant after which the token can no longer open a session
    pub session_start_deadline: DateTime<Utc>,
}

impl SessionCredential {
    /// Whether a new session may be opened with this credential at `now`.
    pub fn can_start_session(&self, now: DateTime<Utc>) -> bool {
        now < self.session_start_deadline && now < self.expires_at
    }

    /// Whether an already-open session is still authorised at `now`.
    pub fn is_valid(&self, now: DateTime<Utc>) -> bool {
        now < self.expires_at
    }
}

// Tokens stay out of logs.
impl std::fmt::Debug for SessionCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCredential")
            .field("token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .field("session_start_deadline", &self.session_start_deadline)
            .finish()
    }
}

/// Source of session credentials.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    /// Request a fresh credential.
    async fn fetch(&self) -> Result<SessionCredential, CredentialError>;
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TokenRequest<'a> {
    device_id: &'a str,
    user_id: &'a str,
}

/// HTTP client for the token issuance service.
pub struct CredentialClient {
    client: Client,
    endpoint: String,
    device_id: String,
    user_id: String,
}

impl CredentialClient {
    /// Create a client, or `None` when no token service is configured.
    pub fn from_config(config: &CredentialConfig) -> Result<Option<Self>, CredentialError> {
        let Some(base) = config.token_service_url.as_deref() else {
            return Ok(None);
        };

        let client = Client::builder().timeout(config.request_timeout()).build()?;

        Ok(Some(Self {
            client,
            endpoint: format!("{}/auth/request-token", base.trim_end_matches('/')),
            device_id: config.device_id.clone(),
            user_id: config.user_id.clone(),
        }))
    }
}

#[async_trait]
impl CredentialProvider for CredentialClient {
    async fn fetch(&self) -> Result<SessionCredential, CredentialError> {
        debug!(endpoint = %self.endpoint, device_id = %self.device_id, "Requesting session token");

        let response = self
            .client
            .post(&self.endpoint)
            .json(&TokenRequest {
                device_id: &self.device_id,
                user_id: &self.user_id,
            })
            .send()
            .await?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Token service rejected request");
            return Err(CredentialError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body = response.text().await?;
        let credential: SessionCredential =
            serde_json::from_str(&body).map_err(|e| CredentialError::Malformed(e.to_string()))?;

        if credential.token.is_empty() {
            return Err(CredentialError::Malformed("empty token".to_string()));
        }

        info!(
            expires_at = %credential.expires_at,
            start_deadline = %credential.session_start_deadline,
            "Session token issued"
        );
        Ok(credential)
    }
}
