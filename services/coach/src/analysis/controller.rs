//! Streaming-first shot analysis with transparent stateless fallback.
//!
//! The controller keeps one streaming session alive in a supervisor task:
//! connect with a timeout, send the setup, wait for the acknowledgement,
//! reconnect with exponential backoff when the session drops, refresh the
//! credential when it can no longer open a session. `analyze` uses the session
//! when it is `Ready` and the fallback channel otherwise, and never fails a
//! shot because of the service: the worst case is a default result.

use super::fallback::{FallbackAnalyzer, FallbackRequest};
use super::live::{LiveConnection, LiveConnector, LiveEndpoint, TransportEvent};
use super::prompt::{shot_prompt, SYSTEM_INSTRUCTION};
use super::protocol::{
    ClientContent, ClientMessage, Content, GenerationConfig, Part, ServerContent, ServerMessage,
    SessionResumption, Setup,
};
use super::response::{is_complete_json, parse_analysis_text, AnalysisRequest, AnalysisResult};
use super::ServiceAuth;
use crate::config::{AuthMode, LiveConfig};
use crate::credential::{CredentialProvider, SessionCredential};
use crate::frame::Frame;
use backoff::{backoff::Backoff, ExponentialBackoff};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Floor for the setup resend period; `tokio::time::interval` rejects zero.
const MIN_SETUP_RETRY: Duration = Duration::from_millis(100);

/// Errors surfaced by the session controller and orchestrator.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("No session credential or developer key available")]
    NoCredentials,

    #[error("An analysis is already in flight")]
    AnalysisInFlight,

    #[error("Session initialisation failed: {0}")]
    Init(String),
}

/// State of the streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    AwaitingSetupAck,
    Ready,
    Degraded,
}

impl ConnectionState {
    /// Whether shots currently go over the streaming session.
    pub fn is_live(&self) -> bool {
        matches!(self, ConnectionState::Ready)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::AwaitingSetupAck => "awaiting_setup_ack",
            ConnectionState::Ready => "ready",
            ConnectionState::Degraded => "degraded",
        };
        f.write_str(name)
    }
}

/// Receives every connection state change ("Live" vs "Fallback" indicator).
pub trait ConnectivityObserver: Send + Sync {
    fn on_connectivity_change(&self, state: ConnectionState, live: bool);
}

/// Controller settings.
#[derive(Debug, Clone)]
pub struct ControllerSettings {
    pub live: LiveConfig,
    pub auth_mode: AuthMode,
    /// Long-lived developer key
    pub api_key: Option<String>,
}

/// Credential used for one streaming session.
#[derive(Debug, Clone)]
struct SessionAuth {
    auth: ServiceAuth,
    expires_at: Option<DateTime<Utc>>,
}

impl SessionAuth {
    fn ephemeral(credential: &SessionCredential) -> Self {
        Self {
            auth: ServiceAuth::Ephemeral(credential.token.clone()),
            expires_at: Some(credential.expires_at),
        }
    }

    fn api_key(key: String) -> Self {
        Self {
            auth: ServiceAuth::ApiKey(key),
            expires_at: None,
        }
    }

    fn remaining(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| (at - Utc::now()).to_std().unwrap_or(Duration::ZERO))
    }
}

/// Answer slot for the single in-flight streamed request.
struct PendingTurn {
    id: Uuid,
    text: String,
    /// `None` when the session was lost before the answer
    reply: oneshot::Sender<Option<String>>,
}

/// Send half of a `Ready` session plus the request waiting on it.
#[derive(Default)]
struct LiveSlot {
    outbound: Option<mpsc::Sender<String>>,
    pending: Option<PendingTurn>,
    /// Sent turns whose requests gave up; their answers are still owed
    abandoned: usize,
}

/// How one streaming session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    Cancelled,
    CredentialExpired,
    Lost { was_ready: bool },
    Fatal,
}

/// State shared between the controller and its supervisor task.
struct Inner {
    settings: ControllerSettings,
    connector: Arc<dyn LiveConnector>,
    credentials: Option<Arc<dyn CredentialProvider>>,
    observer: Arc<dyn ConnectivityObserver>,
    state: RwLock<ConnectionState>,
    slot: Mutex<LiveSlot>,
    credential: Mutex<Option<SessionCredential>>,
}

impl Inner {
    fn set_state(&self, new: ConnectionState) {
        let old = {
            let mut state = self.state.write();
            if *state == new {
                return;
            }
            std::mem::replace(&mut *state, new)
        };
        info!(from = %old, to = %new, "Connection state changed");
        self.observer.on_connectivity_change(new, new.is_live());
    }

    /// Drop the send half and fail any waiting request.
    fn drop_live(&self) {
        let pending = {
            let mut slot = self.slot.lock();
            slot.outbound = None;
            slot.abandoned = 0;
            slot.pending.take()
        };
        if let Some(turn) = pending {
            debug!(request_id = %turn.id, "Failing pending streamed request");
            let _ = turn.reply.send(None);
        }
    }

    fn clear_pending(&self, id: Uuid) {
        let mut slot = self.slot.lock();
        if slot.pending.as_ref().map(|p| p.id) == Some(id) {
            slot.pending = None;
        }
    }

    /// Give up on a sent turn. The server still answers it, so that answer
    /// must be skipped before anything is routed to a later request.
    fn abandon_pending(&self, id: Uuid) {
        let mut slot = self.slot.lock();
        if slot.pending.as_ref().map(|p| p.id) == Some(id) {
            slot.pending = None;
            slot.abandoned += 1;
        }
    }

    /// Credential for the next session, refreshing it when needed.
    async fn session_auth(&self) -> Option<SessionAuth> {
        let current = self.credential.lock().clone();
        if let Some(credential) = current {
            if credential.can_start_session(Utc::now()) {
                return Some(SessionAuth::ephemeral(&credential));
            }
        }

        if let Some(provider) = &self.credentials {
            match provider.fetch().await {
                Ok(credential) if credential.can_start_session(Utc::now()) => {
                    info!(expires_at = %credential.expires_at, "Session credential refreshed");
                    let auth = SessionAuth::ephemeral(&credential);
                    *self.credential.lock() = Some(credential);
                    return Some(auth);
                }
                Ok(credential) => warn!(
                    start_deadline = %credential.session_start_deadline,
                    "Refreshed credential cannot start a session"
                ),
                Err(e) => warn!(error = %e, "Credential refresh failed"),
            }
        }

        self.settings.api_key.clone().map(SessionAuth::api_key)
    }

    /// Credential for a stateless request.
    fn fallback_auth(&self) -> Option<ServiceAuth> {
        if let Some(key) = &self.settings.api_key {
            return Some(ServiceAuth::ApiKey(key.clone()));
        }
        self.credential
            .lock()
            .as_ref()
            .filter(|c| c.is_valid(Utc::now()))
            .map(|c| ServiceAuth::Ephemeral(c.token.clone()))
    }

    /// Route streamed content to the pending request.
    ///
    /// Once a request resolves early (complete JSON before `turnComplete`),
    /// the rest of that turn is drained so it cannot leak into the next one.
    fn accept_content(&self, content: ServerContent, draining: &mut bool) {
        if *draining {
            if content.turn_complete {
                *draining = false;
            }
            return;
        }

        let finished = {
            let mut slot = self.slot.lock();
            if slot.abandoned > 0 {
                if content.turn_complete || content.interrupted {
                    slot.abandoned -= 1;
                    debug!(remaining = slot.abandoned, "Skipped answer of an abandoned turn");
                }
                return;
            }

            let Some(turn) = slot.pending.as_mut() else {
                debug!("Ignoring streamed content with no pending request");
                *draining = !content.turn_complete;
                return;
            };

            if let Some(model_turn) = &content.model_turn {
                turn.text.push_str(&model_turn.joined_text());
            }

            let resolved = content.turn_complete
                || content.generation_complete
                || content.interrupted
                || is_complete_json(&turn.text);
            if !resolved {
                return;
            }
            slot.pending.take()
        };

        if let Some(turn) = finished {
            *draining = !content.turn_complete;
            debug!(request_id = %turn.id, chars = turn.text.len(), "Streamed answer received");
            let answer = (!turn.text.trim().is_empty()).then_some(turn.text);
            let _ = turn.reply.send(answer);
        }
    }
}

fn setup_message(live: &LiveConfig, resume_handle: Option<String>) -> ClientMessage {
    ClientMessage::Setup(Setup {
        model: live.model.clone(),
        generation_config: GenerationConfig::streaming(live.temperature, live.max_output_tokens),
        system_instruction: Content {
            role: None,
            parts: vec![Part::text(SYSTEM_INSTRUCTION)],
        },
        session_resumption: resume_handle.map(|handle| SessionResumption { handle }),
    })
}

/// Handle one inbound text message.
fn handle_server_text(
    inner: &Inner,
    text: &str,
    connection: &LiveConnection,
    ready: &mut bool,
    draining: &mut bool,
    resume_handle: &mut Option<String>,
) {
    let message = match ServerMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(error = %e, "Ignoring unparseable server message");
            return;
        }
    };

    if message.is_setup_complete() && !*ready {
        *ready = true;
        inner.slot.lock().outbound = Some(connection.outbound.clone());
        inner.set_state(ConnectionState::Ready);
    }

    if let Some(update) = message.session_resumption_update {
        if let Some(handle) = update.new_handle.filter(|h| !h.is_empty()) {
            debug!("Session resumption handle updated");
            *resume_handle = Some(handle);
        }
    }

    if let Some(go_away) = message.go_away {
        warn!(
            time_left = go_away.time_left.as_deref().unwrap_or("unknown"),
            "Server is ending the streaming session"
        );
    }

    if let Some(content) = message.server_content {
        inner.accept_content(content, draining);
    }
}

/// Run one streaming session until it ends.
async fn run_session(
    inner: &Inner,
    auth: &SessionAuth,
    resume_handle: &mut Option<String>,
    cancel: &CancellationToken,
) -> SessionEnd {
    let live = &inner.settings.live;

    let endpoint = match LiveEndpoint::new(&live.url, &auth.auth, inner.settings.auth_mode) {
        Ok(endpoint) => endpoint,
        Err(e) => {
            error!(error = %e, "Invalid streaming endpoint");
            return SessionEnd::Fatal;
        }
    };

    inner.set_state(ConnectionState::Connecting);
    info!(url = %endpoint.redacted(), auth = auth.auth.kind(), "Connecting streaming session");

    let connect = tokio::time::timeout(live.connection_timeout(), inner.connector.connect(&endpoint));
    let mut connection = tokio::select! {
        _ = cancel.cancelled() => return SessionEnd::Cancelled,
        result = connect => match result {
            Ok(Ok(connection)) => connection,
            Ok(Err(e)) => {
                warn!(error = %e, "Streaming connection failed");
                inner.set_state(ConnectionState::Disconnected);
                return SessionEnd::Lost { was_ready: false };
            }
            Err(_) => {
                warn!(timeout_secs = live.connection_timeout_secs, "Streaming connection timed out");
                inner.set_state(ConnectionState::Disconnected);
                return SessionEnd::Lost { was_ready: false };
            }
        }
    };

    inner.set_state(ConnectionState::AwaitingSetupAck);

    let setup = match setup_message(live, resume_handle.clone()).to_json() {
        Ok(json) => json,
        Err(e) => {
            error!(error = %e, "Failed to serialise setup message");
            return SessionEnd::Fatal;
        }
    };
    if connection.outbound.send(setup.clone()).await.is_err() {
        inner.set_state(ConnectionState::Degraded);
        return SessionEnd::Lost { was_ready: false };
    }

    let handshake_deadline = tokio::time::sleep(live.connection_timeout());
    tokio::pin!(handshake_deadline);

    let retry_period = live.setup_retry().max(MIN_SETUP_RETRY);
    let mut setup_retry =
        tokio::time::interval_at(tokio::time::Instant::now() + retry_period, retry_period);

    let expires_in = auth.remaining();
    let expiry = tokio::time::sleep(expires_in.unwrap_or(Duration::MAX));
    tokio::pin!(expiry);

    let mut ready = false;
    let mut draining = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                inner.drop_live();
                return SessionEnd::Cancelled;
            }
            _ = &mut handshake_deadline, if !ready => {
                warn!(timeout_secs = live.connection_timeout_secs, "Setup not acknowledged in time");
                inner.drop_live();
                inner.set_state(ConnectionState::Degraded);
                return SessionEnd::Lost { was_ready: false };
            }
            _ = setup_retry.tick(), if !ready => {
                debug!("Setup still unacknowledged, resending");
                if connection.outbound.send(setup.clone()).await.is_err() {
                    inner.set_state(ConnectionState::Degraded);
                    return SessionEnd::Lost { was_ready: false };
                }
            }
            _ = &mut expiry, if expires_in.is_some() => {
                info!("Session credential expired, reconnecting");
                inner.drop_live();
                inner.set_state(ConnectionState::Degraded);
                return SessionEnd::CredentialExpired;
            }
            event = connection.inbound.recv() => match event {
                Some(TransportEvent::Text(text)) => handle_server_text(
                    inner,
                    &text,
                    &connection,
                    &mut ready,
                    &mut draining,
                    resume_handle,
                ),
                Some(TransportEvent::Closed { reason }) => {
                    warn!(reason = reason.as_deref().unwrap_or("none"), "Streaming session closed by server");
                    inner.drop_live();
                    inner.set_state(ConnectionState::Degraded);
                    return SessionEnd::Lost { was_ready: ready };
                }
                Some(TransportEvent::Error(e)) => {
                    warn!(error = %e, "Streaming transport error");
                    inner.drop_live();
                    inner.set_state(ConnectionState::Degraded);
                    return SessionEnd::Lost { was_ready: ready };
                }
                None => {
                    warn!("Streaming transport ended");
                    inner.drop_live();
                    inner.set_state(ConnectionState::Degraded);
                    return SessionEnd::Lost { was_ready: ready };
                }
            }
        }
    }
}

/// Keep a streaming session alive until cancelled or out of options.
async fn run_supervisor(inner: Arc<Inner>, initial: SessionAuth, cancel: CancellationToken) {
    let live = inner.settings.live.clone();
    let mut backoff = ExponentialBackoff {
        initial_interval: live.reconnect_base_delay(),
        max_interval: live.reconnect_max_delay(),
        multiplier: 2.0,
        randomization_factor: 0.0,
        max_elapsed_time: None,
        ..Default::default()
    };
    backoff.reset();

    let mut failures = 0u32;
    let mut resume_handle: Option<String> = None;
    let mut next_auth = Some(initial);

    loop {
        let auth = match next_auth.take() {
            Some(auth) => auth,
            None => {
                let resolved = tokio::select! {
                    _ = cancel.cancelled() => break,
                    auth = inner.session_auth() => auth,
                };
                match resolved {
                    Some(auth) => auth,
                    None => {
                        warn!("No usable credential left, continuing in fallback-only mode");
                        break;
                    }
                }
            }
        };

        match run_session(&inner, &auth, &mut resume_handle, &cancel).await {
            SessionEnd::Cancelled | SessionEnd::Fatal => break,
            SessionEnd::CredentialExpired => {
                failures = 0;
                backoff.reset();
            }
            SessionEnd::Lost { was_ready } => {
                if was_ready {
                    failures = 0;
                    backoff.reset();
                }
                failures += 1;

                let max_attempts = live.max_reconnect_attempts;
                if max_attempts > 0 && failures > max_attempts {
                    error!(
                        attempts = failures - 1,
                        "Max reconnection attempts exceeded, continuing in fallback-only mode"
                    );
                    break;
                }

                let delay = backoff.next_backoff().unwrap_or(live.reconnect_max_delay());
                warn!(
                    attempt = failures,
                    delay_ms = delay.as_millis() as u64,
                    "Streaming session unavailable, reconnecting"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    inner.drop_live();
    inner.set_state(ConnectionState::Disconnected);
    debug!("Session supervisor stopped");
}

struct Supervisor {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// Resets the in-flight latch when the analysis finishes or is dropped.
struct InFlightGuard<'a>(&'a AtomicBool);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Encode frames for inline transport on the blocking pool.
async fn encode_frames(frames: Vec<Frame>) -> Vec<String> {
    let encoded = tokio::task::spawn_blocking(move || {
        frames
            .iter()
            .filter_map(|frame| match frame.to_base64_jpeg() {
                Ok(data) => Some(data),
                Err(e) => {
                    warn!(sequence = frame.sequence, error = %e, "Failed to encode frame");
                    None
                }
            })
            .collect::<Vec<_>>()
    })
    .await;

    encoded.unwrap_or_else(|e| {
        error!(error = %e, "Frame encoding task failed");
        Vec::new()
    })
}

/// Turns selected frames into analysis results.
pub struct AnalysisSessionController {
    inner: Arc<Inner>,
    fallback: Arc<dyn FallbackAnalyzer>,
    in_flight: AtomicBool,
    supervisor: Mutex<Option<Supervisor>>,
}

impl AnalysisSessionController {
    pub fn new(
        settings: ControllerSettings,
        connector: Arc<dyn LiveConnector>,
        fallback: Arc<dyn FallbackAnalyzer>,
        credentials: Option<Arc<dyn CredentialProvider>>,
        observer: Arc<dyn ConnectivityObserver>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                credentials,
                observer,
                state: RwLock::new(ConnectionState::Disconnected),
                slot: Mutex::new(LiveSlot::default()),
                credential: Mutex::new(None),
            }),
            fallback,
            in_flight: AtomicBool::new(false),
            supervisor: Mutex::new(None),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    pub fn is_live(&self) -> bool {
        self.state().is_live()
    }

    /// Whether an `analyze` call is outstanding.
    pub fn is_analyzing(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Start the streaming session.
    ///
    /// A credential past its start deadline is rejected and the developer key
    /// is used instead. With neither, the session cannot analyse anything and
    /// `SessionError::NoCredentials` is returned. Calling `start` while a
    /// session is already running is a no-op.
    pub fn start(&self, credential: Option<SessionCredential>) -> Result<(), SessionError> {
        let mut supervisor = self.supervisor.lock();
        if supervisor.as_ref().is_some_and(|s| !s.handle.is_finished()) {
            debug!("Analysis session already started");
            return Ok(());
        }

        let now = Utc::now();
        let credential = credential.filter(|c| {
            let usable = c.can_start_session(now);
            if !usable {
                warn!(
                    start_deadline = %c.session_start_deadline,
                    "Credential past its start deadline, rejecting"
                );
            }
            usable
        });

        let initial = match (&credential, &self.inner.settings.api_key) {
            (Some(credential), _) => SessionAuth::ephemeral(credential),
            (None, Some(key)) => SessionAuth::api_key(key.clone()),
            (None, None) => {
                error!("No credential or developer key, analysis unavailable");
                return Err(SessionError::NoCredentials);
            }
        };
        *self.inner.credential.lock() = credential;

        info!(auth = initial.auth.kind(), "Starting analysis session");
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(run_supervisor(
            Arc::clone(&self.inner),
            initial,
            cancel.clone(),
        ));
        *supervisor = Some(Supervisor { cancel, handle });
        Ok(())
    }

    /// Close the streaming session. Repeated calls are no-ops.
    pub async fn disconnect(&self) {
        let supervisor = self.supervisor.lock().take();
        let Some(supervisor) = supervisor else {
            debug!("Disconnect requested while already disconnected");
            return;
        };

        supervisor.cancel.cancel();
        if let Err(e) = supervisor.handle.await {
            warn!(error = %e, "Session supervisor ended abnormally");
        }
        self.inner.drop_live();
        self.inner.set_state(ConnectionState::Disconnected);
        *self.inner.credential.lock() = None;
    }

    /// Analyse one shot.
    ///
    /// Only one call may be outstanding; a concurrent call is rejected with
    /// `SessionError::AnalysisInFlight`. Service failures never surface as
    /// errors and degrade to [`AnalysisResult::unavailable`].
    pub async fn analyze(&self, request: AnalysisRequest) -> Result<AnalysisResult, SessionError> {
        if self.in_flight.swap(true, Ordering::AcqRel) {
            warn!(request_id = %request.id, "Analysis already in flight, rejecting request");
            return Err(SessionError::AnalysisInFlight);
        }
        let _guard = InFlightGuard(&self.in_flight);

        let prompt = shot_prompt(&request.last_tip);
        let images = encode_frames(request.frames).await;
        if images.is_empty() {
            warn!(request_id = %request.id, "No frame could be encoded");
            return Ok(AnalysisResult::unavailable());
        }

        if let Some(text) = self.analyze_live(request.id, &prompt, &images).await {
            let result = parse_analysis_text(&text);
            info!(request_id = %request.id, channel = "live", outcome = %result.outcome, "Shot analysed");
            return Ok(result);
        }

        Ok(self.analyze_fallback(request.id, prompt, images).await)
    }

    /// Send on the streaming session; `None` means use the fallback.
    async fn analyze_live(&self, id: Uuid, prompt: &str, images: &[String]) -> Option<String> {
        let mut parts = Vec::with_capacity(images.len() + 1);
        parts.push(Part::text(prompt));
        parts.extend(images.iter().cloned().map(Part::jpeg));

        let message = ClientMessage::ClientContent(ClientContent {
            turns: vec![Content::user(parts)],
            turn_complete: true,
        });
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!(request_id = %id, error = %e, "Failed to serialise shot message");
                return None;
            }
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let outbound = {
            let mut slot = self.inner.slot.lock();
            let outbound = slot.outbound.clone()?;
            slot.pending = Some(PendingTurn {
                id,
                text: String::new(),
                reply: reply_tx,
            });
            outbound
        };

        if outbound.send(json).await.is_err() {
            warn!(request_id = %id, "Streaming send failed");
            self.inner.clear_pending(id);
            return None;
        }
        debug!(request_id = %id, frames = images.len(), "Shot sent on streaming session");

        let reply = match self.inner.settings.live.response_timeout() {
            Some(limit) => match tokio::time::timeout(limit, reply_rx).await {
                Ok(reply) => reply,
                Err(_) => {
                    warn!(request_id = %id, timeout_secs = limit.as_secs(), "Streamed answer timed out");
                    self.inner.abandon_pending(id);
                    return None;
                }
            },
            None => reply_rx.await,
        };

        match reply {
            Ok(Some(text)) => Some(text),
            Ok(None) | Err(_) => {
                warn!(request_id = %id, "Streaming session lost before the answer arrived");
                None
            }
        }
    }

    async fn analyze_fallback(&self, id: Uuid, prompt: String, images: Vec<String>) -> AnalysisResult {
        let Some(auth) = self.inner.fallback_auth() else {
            warn!(request_id = %id, "No credential for stateless analysis");
            return AnalysisResult::unavailable();
        };

        match self.fallback.analyze(FallbackRequest { prompt, images, auth }).await {
            Ok(text) => {
                let result = parse_analysis_text(&text);
                info!(request_id = %id, channel = "fallback", outcome = %result.outcome, "Shot analysed");
                result
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "Stateless analysis failed");
                AnalysisResult::unavailable()
            }
        }
    }
}

impl Drop for AnalysisSessionController {
    fn drop(&mut self) {
        if let Some(supervisor) = self.supervisor.get_mut().take() {
            supervisor.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::fallback::{FallbackError, MockFallbackAnalyzer};
    use crate::analysis::live::test_support::{FakeConnector, FakeOutcome, FakeServer};
    use crate::analysis::response::ShotOutcome;
    use crate::credential::MockCredentialProvider;
    use crate::frame::test_support::solid_frame;
    use serde_json::Value;

    #[derive(Default)]
    struct RecordingObserver {
        events: Mutex<Vec<(ConnectionState, bool)>>,
    }

    impl ConnectivityObserver for RecordingObserver {
        fn on_connectivity_change(&self, state: ConnectionState, live: bool) {
            self.events.lock().push((state, live));
        }
    }

    struct Harness {
        controller: Arc<AnalysisSessionController>,
        servers: mpsc::UnboundedReceiver<FakeServer>,
        attempts: Arc<Mutex<Vec<LiveEndpoint>>>,
        observer: Arc<RecordingObserver>,
    }

    fn create_test_config() -> LiveConfig {
        LiveConfig {
            url: "wss://live.test/ws".to_string(),
            connection_timeout_secs: 10,
            setup_retry_secs: 2,
            reconnect_base_delay_ms: 3000,
            reconnect_max_delay_ms: 30000,
            max_reconnect_attempts: 0,
            response_timeout_secs: 20,
            ..LiveConfig::default()
        }
    }

    fn harness_with(
        live: LiveConfig,
        script: Vec<FakeOutcome>,
        fallback: MockFallbackAnalyzer,
        api_key: Option<&str>,
        credentials: Option<MockCredentialProvider>,
    ) -> Harness {
        let (connector, servers) = FakeConnector::new(script);
        let attempts = connector.attempts();
        let observer = Arc::new(RecordingObserver::default());
        let controller = AnalysisSessionController::new(
            ControllerSettings {
                live,
                auth_mode: AuthMode::Query,
                api_key: api_key.map(str::to_string),
            },
            Arc::new(connector),
            Arc::new(fallback),
            credentials.map(|c| Arc::new(c) as Arc<dyn CredentialProvider>),
            observer.clone(),
        );
        Harness {
            controller: Arc::new(controller),
            servers,
            attempts,
            observer,
        }
    }

    fn harness(script: Vec<FakeOutcome>, fallback: MockFallbackAnalyzer) -> Harness {
        harness_with(create_test_config(), script, fallback, Some("dev-key"), None)
    }

    fn credential(start_in_ms: i64, expire_in_secs: i64, token: &str) -> SessionCredential {
        let now = Utc::now();
        SessionCredential {
            token: token.to_string(),
            expires_at: now + chrono::Duration::seconds(expire_in_secs),
            session_start_deadline: now + chrono::Duration::milliseconds(start_in_ms),
        }
    }

    fn request(last_tip: &str) -> AnalysisRequest {
        AnalysisRequest::new(vec![solid_frame(16, 16, 120, 1)], last_tip)
    }

    async fn wait_for_state(controller: &AnalysisSessionController, state: ConnectionState) {
        for _ in 0..5000 {
            if controller.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("state never became {:?}, stuck at {:?}", state, controller.state());
    }

    /// Accept the next connection and complete the handshake.
    async fn accept_ready(harness: &mut Harness) -> FakeServer {
        let mut server = harness.servers.recv().await.unwrap();
        let setup: Value = serde_json::from_str(&server.from_client.recv().await.unwrap()).unwrap();
        assert!(setup.get("setup").is_some());
        server.ack_setup().await;
        wait_for_state(&harness.controller, ConnectionState::Ready).await;
        server
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_without_credentials_fails() {
        let h = harness_with(create_test_config(), vec![], MockFallbackAnalyzer::new(), None, None);
        assert!(matches!(h.controller.start(None), Err(SessionError::NoCredentials)));
        assert_eq!(h.controller.state(), ConnectionState::Disconnected);
        assert!(h.attempts.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_credential_rejected_without_key() {
        let h = harness_with(create_test_config(), vec![], MockFallbackAnalyzer::new(), None, None);
        let stale = credential(-1000, 1800, "stale");
        assert!(matches!(h.controller.start(Some(stale)), Err(SessionError::NoCredentials)));
        assert!(h.attempts.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_credential_uses_developer_key() {
        let mut h = harness(vec![FakeOutcome::Accept], MockFallbackAnalyzer::new());
        h.controller.start(Some(credential(-1000, 1800, "stale"))).unwrap();

        let server = h.servers.recv().await.unwrap();
        assert_eq!(server.endpoint.url.query(), Some("key=dev-key"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_analysis_round_trip() {
        let mut h = harness(vec![FakeOutcome::Accept], MockFallbackAnalyzer::new());
        h.controller.start(Some(credential(60_000, 1800, "eph"))).unwrap();

        let mut server = accept_ready(&mut h).await;
        assert_eq!(server.endpoint.url.query(), Some("access_token=eph"));

        let controller = Arc::clone(&h.controller);
        let task = tokio::spawn(async move { controller.analyze(request("Elbow in")).await });

        let sent: Value = serde_json::from_str(&server.from_client.recv().await.unwrap()).unwrap();
        let parts = &sent["clientContent"]["turns"][0]["parts"];
        assert!(parts[0]["text"].as_str().unwrap().contains("'Elbow in'"));
        assert_eq!(parts[1]["inlineData"]["mimeType"], "image/jpeg");

        server.reply(r#"{"outcome":"MAKE","tip":"Hold the follow-through"}"#).await;
        let result = task.await.unwrap().unwrap();
        assert_eq!(result, AnalysisResult::new(ShotOutcome::Make, "Hold the follow-through"));
        assert!(!h.controller.is_analyzing());

        let events = h.observer.events.lock().clone();
        assert_eq!(
            events,
            vec![
                (ConnectionState::Connecting, false),
                (ConnectionState::AwaitingSetupAck, false),
                (ConnectionState::Ready, true),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_streamed_parts_accumulate() {
        let mut h = harness(vec![FakeOutcome::Accept], MockFallbackAnalyzer::new());
        h.controller.start(None).unwrap();
        let mut server = accept_ready(&mut h).await;

        let controller = Arc::clone(&h.controller);
        let task = tokio::spawn(async move { controller.analyze(request("")).await });
        server.from_client.recv().await.unwrap();

        server
            .send_text(r#"{"serverContent":{"modelTurn":{"parts":[{"text":"{\"outcome\":\"miss\","}]}}}"#)
            .await;
        server
            .send_text(r#"{"serverContent":{"modelTurn":{"parts":[{"text":"\"tip\":\"More arc\"}"}]}}}"#)
            .await;

        // Resolved on complete JSON, before turnComplete
        let result = task.await.unwrap().unwrap();
        assert_eq!(result, AnalysisResult::new(ShotOutcome::Miss, "More arc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_analyze_rejected_while_in_flight() {
        let mut h = harness(vec![FakeOutcome::Accept], MockFallbackAnalyzer::new());
        h.controller.start(None).unwrap();
        let mut server = accept_ready(&mut h).await;

        let controller = Arc::clone(&h.controller);
        let first = tokio::spawn(async move { controller.analyze(request("")).await });
        server.from_client.recv().await.unwrap();
        assert!(h.controller.is_analyzing());

        assert!(matches!(
            h.controller.analyze(request("")).await,
            Err(SessionError::AnalysisInFlight)
        ));

        server.reply(r#"{"outcome":"make","tip":"Nice"}"#).await;
        assert_eq!(first.await.unwrap().unwrap().outcome, ShotOutcome::Make);
        assert!(!h.controller.is_analyzing());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_when_not_ready() {
        let mut fallback = MockFallbackAnalyzer::new();
        fallback
            .expect_analyze()
            .withf(|r| r.auth == ServiceAuth::ApiKey("dev-key".to_string()) && r.images.len() == 1)
            .times(1)
            .returning(|_| Ok(r#"{"outcome":"miss","tip":"Bend your knees"}"#.to_string()));

        let h = harness(vec![], fallback);
        let result = h.controller.analyze(request("")).await.unwrap();
        assert_eq!(result, AnalysisResult::new(ShotOutcome::Miss, "Bend your knees"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fallback_failure_yields_default() {
        let mut fallback = MockFallbackAnalyzer::new();
        fallback
            .expect_analyze()
            .times(1)
            .returning(|_| Err(FallbackError::EmptyResponse));

        let h = harness(vec![], fallback);
        let result = h.controller.analyze(request("")).await.unwrap();
        assert_eq!(result, AnalysisResult::unavailable());
    }

    #[tokio::test(start_paused = true)]
    async fn test_session_lost_mid_request_falls_back() {
        let mut fallback = MockFallbackAnalyzer::new();
        fallback
            .expect_analyze()
            .times(1)
            .returning(|_| Ok("You make it look easy. Try a higher arc".to_string()));

        let mut h = harness(vec![FakeOutcome::Accept], fallback);
        h.controller.start(None).unwrap();
        let mut server = accept_ready(&mut h).await;

        let controller = Arc::clone(&h.controller);
        let task = tokio::spawn(async move { controller.analyze(request("")).await });
        server.from_client.recv().await.unwrap();
        server.close().await;

        let result = task.await.unwrap().unwrap();
        assert_eq!(result.outcome, ShotOutcome::Make);
        assert_eq!(result.tip, "Try a higher arc");
    }

    #[tokio::test(start_paused = true)]
    async fn test_response_timeout_falls_back() {
        let mut fallback = MockFallbackAnalyzer::new();
        fallback
            .expect_analyze()
            .times(1)
            .returning(|_| Ok(r#"{"outcome":"make","tip":"Good"}"#.to_string()));

        let mut h = harness(vec![FakeOutcome::Accept], fallback);
        h.controller.start(None).unwrap();
        let mut server = accept_ready(&mut h).await;

        let controller = Arc::clone(&h.controller);
        let task = tokio::spawn(async move { controller.analyze(request("")).await });
        server.from_client.recv().await.unwrap();

        // Server never answers
        let result = task.await.unwrap().unwrap();
        assert_eq!(result.tip, "Good");
        assert_eq!(h.controller.state(), ConnectionState::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_answer_not_credited_to_next_request() {
        let mut fallback = MockFallbackAnalyzer::new();
        fallback
            .expect_analyze()
            .times(1)
            .returning(|_| Ok(r#"{"outcome":"miss","tip":"From fallback"}"#.to_string()));

        let mut h = harness(vec![FakeOutcome::Accept], fallback);
        h.controller.start(None).unwrap();
        let mut server = accept_ready(&mut h).await;

        let controller = Arc::clone(&h.controller);
        let first = tokio::spawn(async move { controller.analyze(request("")).await });
        server.from_client.recv().await.unwrap();
        let first = first.await.unwrap().unwrap();
        assert_eq!(first, AnalysisResult::new(ShotOutcome::Miss, "From fallback"));

        let controller = Arc::clone(&h.controller);
        let second = tokio::spawn(async move { controller.analyze(request("From fallback")).await });
        server.from_client.recv().await.unwrap();

        // Answer to the timed-out turn arrives first, then the real one
        server.reply(r#"{"outcome":"make","tip":"Late answer"}"#).await;
        server.reply(r#"{"outcome":"miss","tip":"Elbow under the ball"}"#).await;

        let second = second.await.unwrap().unwrap();
        assert_eq!(second, AnalysisResult::new(ShotOutcome::Miss, "Elbow under the ball"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_turns_reset_on_reconnect() {
        let mut fallback = MockFallbackAnalyzer::new();
        fallback
            .expect_analyze()
            .times(1)
            .returning(|_| Ok(r#"{"outcome":"miss","tip":"From fallback"}"#.to_string()));

        let mut h = harness(vec![FakeOutcome::Accept, FakeOutcome::Accept], fallback);
        h.controller.start(None).unwrap();
        let mut server = accept_ready(&mut h).await;

        let controller = Arc::clone(&h.controller);
        let first = tokio::spawn(async move { controller.analyze(request("")).await });
        server.from_client.recv().await.unwrap();
        first.await.unwrap().unwrap();

        // The old session never answers; the new one owes nothing
        server.close().await;
        let mut server = accept_ready(&mut h).await;

        let controller = Arc::clone(&h.controller);
        let second = tokio::spawn(async move { controller.analyze(request("")).await });
        server.from_client.recv().await.unwrap();
        server.reply(r#"{"outcome":"make","tip":"Same again"}"#).await;

        let second = second.await.unwrap().unwrap();
        assert_eq!(second, AnalysisResult::new(ShotOutcome::Make, "Same again"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnects_with_backoff() {
        let mut h = harness(
            vec![FakeOutcome::Refuse, FakeOutcome::Refuse, FakeOutcome::Accept],
            MockFallbackAnalyzer::new(),
        );
        let started = tokio::time::Instant::now();
        h.controller.start(None).unwrap();

        accept_ready(&mut h).await;
        assert_eq!(h.attempts.lock().len(), 3);
        // Two waits: 3s then 6s
        assert!(started.elapsed() >= Duration::from_secs(9));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_attempts() {
        let mut live = create_test_config();
        live.max_reconnect_attempts = 2;
        let h = harness_with(live, vec![], MockFallbackAnalyzer::new(), Some("dev-key"), None);
        h.controller.start(None).unwrap();

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(h.attempts.lock().len(), 3);
        assert_eq!(h.controller.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connection_timeout_then_retry() {
        let mut h = harness(
            vec![FakeOutcome::Hang, FakeOutcome::Accept],
            MockFallbackAnalyzer::new(),
        );
        h.controller.start(None).unwrap();

        accept_ready(&mut h).await;
        assert_eq!(h.attempts.lock().len(), 2);
        let events = h.observer.events.lock().clone();
        assert!(events.contains(&(ConnectionState::Disconnected, false)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_setup_resent_while_unacknowledged() {
        let mut h = harness(vec![FakeOutcome::Accept], MockFallbackAnalyzer::new());
        h.controller.start(None).unwrap();

        let mut server = h.servers.recv().await.unwrap();
        let first = server.from_client.recv().await.unwrap();
        let second = server.from_client.recv().await.unwrap();
        assert_eq!(first, second);
        assert_eq!(h.controller.state(), ConnectionState::AwaitingSetupAck);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resumption_handle_replayed_after_reconnect() {
        let mut h = harness(
            vec![FakeOutcome::Accept, FakeOutcome::Accept],
            MockFallbackAnalyzer::new(),
        );
        h.controller.start(None).unwrap();

        let server = accept_ready(&mut h).await;
        server
            .send_text(r#"{"sessionResumptionUpdate":{"newHandle":"resume-1","resumable":true}}"#)
            .await;
        server.send_text(r#"{"goAway":{"timeLeft":"5s"}}"#).await;
        server.close().await;

        let mut second = h.servers.recv().await.unwrap();
        let setup: Value = serde_json::from_str(&second.from_client.recv().await.unwrap()).unwrap();
        assert_eq!(setup["setup"]["sessionResumption"]["handle"], "resume-1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_credential_refreshed_on_reconnect() {
        let mut provider = MockCredentialProvider::new();
        provider
            .expect_fetch()
            .times(1)
            .returning(|| Ok(credential(60_000, 1800, "fresh")));

        let mut h = harness_with(
            create_test_config(),
            vec![FakeOutcome::Accept, FakeOutcome::Accept],
            MockFallbackAnalyzer::new(),
            None,
            Some(provider),
        );
        h.controller.start(Some(credential(150, 1800, "first"))).unwrap();

        let server = accept_ready(&mut h).await;
        assert_eq!(server.endpoint.url.query(), Some("access_token=first"));

        // Let the start deadline pass in wall-clock time
        std::thread::sleep(std::time::Duration::from_millis(200));
        server.close().await;

        let second = h.servers.recv().await.unwrap();
        assert_eq!(second.endpoint.url.query(), Some("access_token=fresh"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_is_idempotent() {
        let mut h = harness(vec![FakeOutcome::Accept], MockFallbackAnalyzer::new());
        h.controller.start(None).unwrap();
        accept_ready(&mut h).await;

        h.controller.disconnect().await;
        assert_eq!(h.controller.state(), ConnectionState::Disconnected);
        let notifications = h.observer.events.lock().len();

        h.controller.disconnect().await;
        assert_eq!(h.observer.events.lock().len(), notifications);
        assert_eq!(
            h.observer.events.lock().last().copied(),
            Some((ConnectionState::Disconnected, false))
        );
    }
}
