//! Streaming session transport.
//!
//! A [`LiveConnector`] opens one bidirectional text channel to the analysis
//! service and exposes it as a pair of tokio channels. The session logic in
//! the controller only ever sees [`LiveConnection`], so the WebSocket can be
//! replaced by an in-memory fake in tests.

use super::ServiceAuth;
use crate::config::AuthMode;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, trace, warn};

/// Outbound/inbound channel capacity.
const CHANNEL_CAPACITY: usize = 32;

/// Errors that can occur on the streaming transport.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Connection timed out")]
    Timeout,

    #[error("Connection closed")]
    Closed,
}

/// Resolved connection target: URL plus any auth headers.
#[derive(Clone, PartialEq, Eq)]
pub struct LiveEndpoint {
    pub url: Url,
    pub headers: Vec<(&'static str, String)>,
}

impl LiveEndpoint {
    /// Build the endpoint for `auth` using the configured auth mode.
    pub fn new(base_url: &str, auth: &ServiceAuth, mode: AuthMode) -> Result<Self, TransportError> {
        let mut url =
            Url::parse(base_url).map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(TransportError::InvalidEndpoint(format!(
                "unsupported scheme '{}'",
                url.scheme()
            )));
        }
        auth.apply_to_url(&mut url, mode);

        Ok(Self {
            url,
            headers: auth.headers(mode),
        })
    }

    /// URL with credentials removed, for logging.
    pub fn redacted(&self) -> String {
        let mut url = self.url.clone();
        url.set_query(None);
        url.to_string()
    }
}

impl std::fmt::Debug for LiveEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveEndpoint")
            .field("url", &self.redacted())
            .field("headers", &self.headers.len())
            .finish()
    }
}

/// Something that happened on an open connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Inbound text message
    Text(String),
    /// Connection closed by the peer
    Closed { reason: Option<String> },
    /// Transport failure; the connection is unusable afterwards
    Error(String),
}

/// An open streaming connection.
///
/// Dropping it closes the underlying transport.
#[derive(Debug)]
pub struct LiveConnection {
    pub outbound: mpsc::Sender<String>,
    pub inbound: mpsc::Receiver<TransportEvent>,
}

/// Opens streaming connections.
#[async_trait]
pub trait LiveConnector: Send + Sync {
    async fn connect(&self, endpoint: &LiveEndpoint) -> Result<LiveConnection, TransportError>;
}

/// WebSocket connector.
#[derive(Debug, Default, Clone)]
pub struct WebSocketConnector;

impl WebSocketConnector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LiveConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &LiveEndpoint) -> Result<LiveConnection, TransportError> {
        let mut request = endpoint.url.as_str().into_client_request()?;
        for (name, value) in &endpoint.headers {
            let name = HeaderName::from_static(name);
            let value = HeaderValue::from_str(value)
                .map_err(|e| TransportError::InvalidEndpoint(e.to_string()))?;
            request.headers_mut().insert(name, value);
        }

        debug!(url = %endpoint.redacted(), "Opening WebSocket");
        let (socket, _response) = tokio_tungstenite::connect_async(request).await?;
        let (mut sink, mut stream) = socket.split();

        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    outbound = out_rx.recv() => match outbound {
                        Some(text) => {
                            if let Err(e) = sink.send(Message::Text(text)).await {
                                let _ = in_tx.send(TransportEvent::Error(e.to_string())).await;
                                break;
                            }
                        }
                        None => {
                            // Connection handle dropped
                            let _ = sink.close().await;
                            break;
                        }
                    },
                    inbound = stream.next() => {
                        let event = match inbound {
                            Some(Ok(Message::Text(text))) => TransportEvent::Text(text),
                            // The service may deliver JSON in binary frames
                            Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                                Ok(text) => TransportEvent::Text(text),
                                Err(_) => {
                                    warn!("Dropping non-UTF-8 binary message");
                                    continue;
                                }
                            },
                            Some(Ok(Message::Close(frame))) => TransportEvent::Closed {
                                reason: frame.map(|f| format!("{} {}", u16::from(f.code), f.reason)),
                            },
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => TransportEvent::Error(e.to_string()),
                            None => TransportEvent::Closed { reason: None },
                        };

                        let terminal = !matches!(event, TransportEvent::Text(_));
                        if in_tx.send(event).await.is_err() || terminal {
                            break;
                        }
                    }
                }
            }
            trace!("WebSocket pump finished");
        });

        Ok(LiveConnection {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// How the fake connector answers one connection attempt.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FakeOutcome {
        Accept,
        Refuse,
        Hang,
    }

    /// Server side of an accepted fake connection.
    pub struct FakeServer {
        pub endpoint: LiveEndpoint,
        pub from_client: mpsc::Receiver<String>,
        pub to_client: mpsc::Sender<TransportEvent>,
    }

    impl FakeServer {
        pub async fn send_text(&self, text: &str) {
            let _ = self.to_client.send(TransportEvent::Text(text.to_string())).await;
        }

        pub async fn ack_setup(&self) {
            self.send_text(r#"{"setupComplete":{}}"#).await;
        }

        pub async fn reply(&self, answer: &str) {
            let message = serde_json::json!({
                "serverContent": {
                    "modelTurn": {"parts": [{"text": answer}]},
                    "turnComplete": true
                }
            });
            self.send_text(&message.to_string()).await;
        }

        pub async fn close(&self) {
            let _ = self
                .to_client
                .send(TransportEvent::Closed { reason: Some("test".to_string()) })
                .await;
        }
    }

    /// In-memory connector driven by a script of outcomes.
    pub struct FakeConnector {
        script: Mutex<VecDeque<FakeOutcome>>,
        attempts: Arc<Mutex<Vec<LiveEndpoint>>>,
        servers: mpsc::UnboundedSender<FakeServer>,
    }

    impl FakeConnector {
        /// Attempts past the end of the script are refused.
        pub fn new(script: Vec<FakeOutcome>) -> (Self, mpsc::UnboundedReceiver<FakeServer>) {
            let (servers, accepted) = mpsc::unbounded_channel();
            (
                Self {
                    script: Mutex::new(script.into()),
                    attempts: Arc::new(Mutex::new(Vec::new())),
                    servers,
                },
                accepted,
            )
        }

        pub fn attempts(&self) -> Arc<Mutex<Vec<LiveEndpoint>>> {
            Arc::clone(&self.attempts)
        }
    }

    #[async_trait]
    impl LiveConnector for FakeConnector {
        async fn connect(&self, endpoint: &LiveEndpoint) -> Result<LiveConnection, TransportError> {
            self.attempts.lock().push(endpoint.clone());
            let outcome = self.script.lock().pop_front().unwrap_or(FakeOutcome::Refuse);

            match outcome {
                FakeOutcome::Refuse => Err(TransportError::Closed),
                FakeOutcome::Hang => futures::future::pending().await,
                FakeOutcome::Accept => {
                    let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
                    let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
                    let _ = self.servers.send(FakeServer {
                        endpoint: endpoint.clone(),
                        from_client: out_rx,
                        to_client: in_tx,
                    });
                    Ok(LiveConnection {
                        outbound: out_tx,
                        inbound: in_rx,
                    })
                }
            }
        }
    }
}
