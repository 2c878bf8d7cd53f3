//! Stateless per-request analysis.
//!
//! Used whenever the streaming session is not `Ready`. One request carries the
//! prompt and the selected frames inline and returns the generated text.

use super::protocol::{Content, GenerateContentRequest, GenerateContentResponse, GenerationConfig, Part};
use super::ServiceAuth;
use crate::config::{AuthMode, FallbackConfig};
use async_trait::async_trait;
use reqwest::{Client, Url};
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur on the fallback channel.
#[derive(Debug, Error)]
pub enum FallbackError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("No content in response")]
    EmptyResponse,
}

/// One stateless analysis request.
#[derive(Debug, Clone)]
pub struct FallbackRequest {
    pub prompt: String,
    /// Base64 JPEG frames, release first
    pub images: Vec<String>,
    pub auth: ServiceAuth,
}

/// Stateless analysis channel.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait FallbackAnalyzer: Send + Sync {
    /// Returns the generated text for the request.
    async fn analyze(&self, request: FallbackRequest) -> Result<String, FallbackError>;
}

/// Generate-content REST client.
pub struct FallbackClient {
    client: Client,
    config: FallbackConfig,
    auth_mode: AuthMode,
}

impl FallbackClient {
    pub fn new(config: FallbackConfig, auth_mode: AuthMode) -> Result<Self, FallbackError> {
        let client = Client::builder().timeout(config.request_timeout()).build()?;
        Ok(Self {
            client,
            config,
            auth_mode,
        })
    }

    fn endpoint(&self, auth: &ServiceAuth) -> Result<Url, FallbackError> {
        let model = self.config.model.trim_start_matches("models/");
        let raw = format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            model
        );
        let mut url = Url::parse(&raw).map_err(|e| FallbackError::InvalidEndpoint(e.to_string()))?;
        auth.apply_to_url(&mut url, self.auth_mode);
        Ok(url)
    }

    fn body(&self, request: FallbackRequest) -> GenerateContentRequest {
        let mut parts = Vec::with_capacity(request.images.len() + 1);
        parts.push(Part::text(request.prompt));
        parts.extend(request.images.into_iter().map(Part::jpeg));

        GenerateContentRequest {
            contents: vec![Content::user(parts)],
            generation_config: GenerationConfig::json(
                self.config.temperature,
                self.config.max_output_tokens,
            ),
        }
    }
}

#[async_trait]
impl FallbackAnalyzer for FallbackClient {
    async fn analyze(&self, request: FallbackRequest) -> Result<String, FallbackError> {
        let url = self.endpoint(&request.auth)?;
        let headers = request.auth.headers(self.auth_mode);
        let images = request.images.len();
        let body = self.body(request);

        debug!(model = %self.config.model, images, "Sending stateless analysis request");

        let mut builder = self.client.post(url).json(&body);
        for (name, value) in headers {
            builder = builder.header(name, value);
        }
        let response = builder.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Stateless analysis request rejected");
            return Err(FallbackError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: GenerateContentResponse = response.json().await?;
        parsed
            .first_text()
            .map(str::to_string)
            .ok_or(FallbackError::EmptyResponse)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, Request, ResponseTemplate};

    fn create_test_config(base_url: &str) -> FallbackConfig {
        FallbackConfig {
            base_url: base_url.to_string(),
            model: "test-model".to_string(),
            request_timeout_secs: 5,
            temperature: 0.4,
            max_output_tokens: 100,
        }
    }

    fn request(auth: ServiceAuth) -> FallbackRequest {
        FallbackRequest {
            prompt: "analyse".to_string(),
            images: vec!["AAAA".to_string(), "BBBB".to_string()],
            auth,
        }
    }

    fn answer(text: &str) -> serde_json::Value {
        json!({"candidates": [{"content": {"role": "model", "parts": [{"text": text}]}}]})
    }

    #[tokio::test]
    async fn test_query_auth_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/models/test-model:generateContent"))
            .and(query_param("key", "dev-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer(r#"{"outcome":"make"}"#)))
            .expect(1)
            .mount(&server)
            .await;

        let client = FallbackClient::new(create_test_config(&server.uri()), AuthMode::Query).unwrap();
        let text = client
            .analyze(request(ServiceAuth::ApiKey("dev-key".to_string())))
            .await
            .unwrap();
        assert_eq!(text, r#"{"outcome":"make"}"#);

        let received: Vec<Request> = server.received_requests().await.unwrap();
        let body: serde_json::Value = received[0].body_json().unwrap();
        let parts = &body["contents"][0]["parts"];
        assert_eq!(parts[0]["text"], "analyse");
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");
        assert_eq!(parts[2]["inlineData"]["data"], "BBBB");
        assert_eq!(body["generationConfig"]["responseMimeType"], "application/json");
    }

    #[tokio::test]
    async fn test_header_auth_request() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(header("authorization", "Token eph"))
            .respond_with(ResponseTemplate::new(200).set_body_json(answer("ok")))
            .expect(1)
            .mount(&server)
            .await;

        let client = FallbackClient::new(create_test_config(&server.uri()), AuthMode::Header).unwrap();
        let text = client
            .analyze(request(ServiceAuth::Ephemeral("eph".to_string())))
            .await
            .unwrap();
        assert_eq!(text, "ok");

        let received = server.received_requests().await.unwrap();
        assert_eq!(received[0].url.query(), None);
    }

    #[tokio::test]
    async fn test_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = FallbackClient::new(create_test_config(&server.uri()), AuthMode::Query).unwrap();
        match client.analyze(request(ServiceAuth::ApiKey("k".to_string()))).await {
            Err(FallbackError::Status { status, body }) => {
                assert_eq!(status, 503);
                assert_eq!(body, "overloaded");
            }
            other => panic!("Expected status error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_empty_candidates() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"candidates": []})))
            .mount(&server)
            .await;

        let client = FallbackClient::new(create_test_config(&server.uri()), AuthMode::Query).unwrap();
        assert!(matches!(
            client.analyze(request(ServiceAuth::ApiKey("k".to_string()))).await,
            Err(FallbackError::EmptyResponse)
        ));
    }

    #[test]
    fn test_model_prefix_stripped() {
        let mut config = create_test_config("https://example.test/v1beta/");
        config.model = "models/gemini".to_string();
        let client = FallbackClient::new(config, AuthMode::Query).unwrap();
        let url = client.endpoint(&ServiceAuth::ApiKey("k".to_string())).unwrap();
        assert_eq!(
            url.as_str(),
            "https://example.test/v1beta/models/gemini:generateContent?key=k"
        );
    }
}
