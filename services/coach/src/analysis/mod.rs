//! Shot analysis against the remote coaching service.
//!
//! [`controller::AnalysisSessionController`] owns the streaming session
//! ([`live`]) and the stateless fallback ([`fallback`]). Both speak the wire
//! types in [`protocol`], send prompts from [`prompt`] and hand the service's
//! text to [`response`] for parsing.

pub mod controller;
pub mod fallback;
pub mod live;
pub mod prompt;
pub mod protocol;
pub mod response;

use crate::config::AuthMode;
use reqwest::Url;

pub use controller::{AnalysisSessionController, ConnectionState, ConnectivityObserver, SessionError};
pub use response::{AnalysisRequest, AnalysisResult, ShotOutcome, ShotType};

/// Credential attached to a request to the analysis service.
#[derive(Clone, PartialEq, Eq)]
pub enum ServiceAuth {
    /// Long-lived developer key
    ApiKey(String),
    /// Ephemeral session token
    Ephemeral(String),
}

impl ServiceAuth {
    /// Append the credential as a query parameter when `mode` asks for it.
    pub fn apply_to_url(&self, url: &mut Url, mode: AuthMode) {
        if mode != AuthMode::Query {
            return;
        }
        match self {
            ServiceAuth::ApiKey(key) => url.query_pairs_mut().append_pair("key", key),
            ServiceAuth::Ephemeral(token) => url.query_pairs_mut().append_pair("access_token", token),
        };
    }

    /// Headers carrying the credential when `mode` asks for them.
    pub fn headers(&self, mode: AuthMode) -> Vec<(&'static str, String)> {
        if mode != AuthMode::Header {
            return Vec::new();
        }
        match self {
            ServiceAuth::ApiKey(key) => vec![("x-goog-api-key", key.clone())],
            ServiceAuth::Ephemeral(token) => vec![("authorization", format!("Token {}", token))],
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ServiceAuth::ApiKey(_) => "api_key",
            ServiceAuth::Ephemeral(_) => "ephemeral",
        }
    }
}

impl std::fmt::Debug for ServiceAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ServiceAuth::{}(<redacted>)", self.kind())
    }
}
