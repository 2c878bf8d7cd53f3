//! Training session orchestration.
//!
//! Wires the pipeline together for one training session:
//!
//! ```text
//! push_frame -> [queue] -> detection worker -> coordinator -> controller
//!                           (buffer+detector)   (latch, stats)  (live/fallback)
//!                                                    |
//!                                                    v
//!                                              FeedbackSink
//! ```
//!
//! Detection runs on blocking workers so the capture side never waits on it.
//! All result handling goes through the coordinator task, which owns the
//! analysing latch and is the only writer of the session statistics.

use crate::analysis::controller::ControllerSettings;
use crate::analysis::fallback::{FallbackAnalyzer, FallbackClient};
use crate::analysis::live::{LiveConnector, WebSocketConnector};
use crate::analysis::{
    AnalysisRequest, AnalysisResult, AnalysisSessionController, ConnectionState, SessionError,
};
use crate::config::CoachConfig;
use crate::credential::{CredentialClient, CredentialProvider};
use crate::detector::{ShotEvent, TrajectoryShotDetector};
use crate::feedback::{DisplayEvent, FeedbackSequencer, SessionStats, TipPools};
use crate::frame::Frame;
use crate::frame_buffer::FrameBuffer;
use crate::motion::{FrameDiffEstimator, TrajectoryEstimator};
use crate::selector::FrameQualitySelector;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

pub use crate::analysis::ConnectivityObserver;

/// Receives one event per analysed shot.
pub trait FeedbackSink: Send + Sync {
    fn on_display_event(&self, event: DisplayEvent);
}

/// Outbound collaborators of a session.
#[derive(Clone)]
pub struct SessionCollaborators {
    pub feedback: Arc<dyn FeedbackSink>,
    pub connectivity: Arc<dyn ConnectivityObserver>,
}

/// Pluggable pieces of the pipeline.
pub struct SessionComponents {
    pub estimator: Box<dyn TrajectoryEstimator>,
    pub connector: Arc<dyn LiveConnector>,
    pub fallback: Arc<dyn FallbackAnalyzer>,
    pub credentials: Option<Arc<dyn CredentialProvider>>,
    pub tips: TipPools,
}

impl SessionComponents {
    /// Production components built from configuration.
    pub fn from_config(config: &CoachConfig) -> Result<Self, SessionError> {
        let fallback = FallbackClient::new(config.fallback.clone(), config.service.auth_mode)
            .map_err(|e| SessionError::Init(e.to_string()))?;
        let credentials = CredentialClient::from_config(&config.credentials)
            .map_err(|e| SessionError::Init(e.to_string()))?
            .map(|client| Arc::new(client) as Arc<dyn CredentialProvider>);

        Ok(Self {
            estimator: Box::new(FrameDiffEstimator::new(config.detector.motion.clone())),
            connector: Arc::new(WebSocketConnector::new()),
            fallback: Arc::new(fallback),
            credentials,
            tips: TipPools::load_or_default(config.feedback.tips_path.as_deref()),
        })
    }
}

/// Pipeline counters.
#[derive(Debug, Clone, Default)]
pub struct PipelineStats {
    pub frames_received: u64,
    pub frames_dropped_backpressure: u64,
    pub frames_processed: u64,
    pub shots_detected: u64,
    /// Shots that arrived while an analysis was in flight
    pub shots_ignored: u64,
    pub analyses_completed: u64,
    /// Results dropped because the session had ended
    pub results_discarded: u64,
}

enum SessionEvent {
    ShotDetected {
        event: ShotEvent,
        current: Frame,
    },
    AnalysisFinished {
        generation: u64,
        result: Option<AnalysisResult>,
    },
}

/// State that moves between the detection worker and the blocking pool.
struct DetectionState {
    buffer: FrameBuffer,
    detector: TrajectoryShotDetector,
}

impl DetectionState {
    fn observe(&mut self, frame: Frame) -> Option<(ShotEvent, Frame)> {
        self.buffer.push(frame.clone());
        let buffer = &self.buffer;
        self.detector
            .observe(&frame, Instant::now(), || buffer.snapshot())
            .map(|event| (event, frame))
    }
}

/// Handle to a running training session.
pub struct TrainingSession {
    frames: mpsc::Sender<Frame>,
    controller: Arc<AnalysisSessionController>,
    sequencer: Arc<Mutex<FeedbackSequencer>>,
    pipeline: Arc<RwLock<PipelineStats>>,
    generation: Arc<AtomicU64>,
    active: AtomicBool,
    cancel: CancellationToken,
    started_at: Instant,
}

impl TrainingSession {
    /// Start a session with production components.
    pub async fn start(
        config: CoachConfig,
        collaborators: SessionCollaborators,
    ) -> Result<Self, SessionError> {
        let components = SessionComponents::from_config(&config)?;
        Self::start_with(config, components, collaborators).await
    }

    /// Start a session with the given components.
    ///
    /// The credential is fetched once here. A failed fetch is not fatal: the
    /// controller falls back to the developer key, and only with neither does
    /// the start fail with `SessionError::NoCredentials`.
    pub async fn start_with(
        config: CoachConfig,
        components: SessionComponents,
        collaborators: SessionCollaborators,
    ) -> Result<Self, SessionError> {
        config
            .validate()
            .map_err(|e| SessionError::Init(e.to_string()))?;

        let credential = match &components.credentials {
            Some(provider) => match provider.fetch().await {
                Ok(credential) => Some(credential),
                Err(e) => {
                    warn!(error = %e, "Credential fetch failed, continuing without ephemeral token");
                    None
                }
            },
            None => None,
        };

        let controller = Arc::new(AnalysisSessionController::new(
            ControllerSettings {
                live: config.live.clone(),
                auth_mode: config.service.auth_mode,
                api_key: config.api_key().map(str::to_string),
            },
            components.connector,
            components.fallback,
            components.credentials,
            collaborators.connectivity,
        ));
        controller.start(credential)?;

        let mut sequencer = FeedbackSequencer::new(components.tips);
        sequencer.start();
        let sequencer = Arc::new(Mutex::new(sequencer));

        let cancel = CancellationToken::new();
        let pipeline = Arc::new(RwLock::new(PipelineStats::default()));
        let generation = Arc::new(AtomicU64::new(0));
        let analyzing = Arc::new(AtomicBool::new(false));
        let permits = Arc::new(Semaphore::new(config.capture.num_workers));

        let (frames_tx, frames_rx) = mpsc::channel(config.capture.queue_size.max(1));
        let (events_tx, events_rx) = mpsc::channel(config.capture.queue_size.max(1));

        let state = DetectionState {
            buffer: FrameBuffer::new(config.capture.buffer_capacity),
            detector: TrajectoryShotDetector::new(config.detector.clone(), components.estimator),
        };
        tokio::spawn(run_detection(
            state,
            frames_rx,
            events_tx.clone(),
            Arc::clone(&analyzing),
            Arc::clone(&permits),
            Arc::clone(&pipeline),
            cancel.clone(),
        ));

        let coordinator = Coordinator {
            events_tx,
            controller: Arc::clone(&controller),
            selector: FrameQualitySelector::new(config.selection.clone()),
            sequencer: Arc::clone(&sequencer),
            feedback: collaborators.feedback,
            analyzing,
            generation: Arc::clone(&generation),
            permits,
            pipeline: Arc::clone(&pipeline),
        };
        tokio::spawn(coordinator.run(events_rx, cancel.clone()));

        info!(
            width = config.capture.width,
            height = config.capture.height,
            workers = config.capture.num_workers,
            queue_size = config.capture.queue_size,
            "Training session started"
        );

        Ok(Self {
            frames: frames_tx,
            controller,
            sequencer,
            pipeline,
            generation,
            active: AtomicBool::new(true),
            cancel,
            started_at: Instant::now(),
        })
    }

    /// Queue a frame for detection without waiting.
    ///
    /// Returns `false` when the frame was dropped because the queue is full
    /// or the session has ended.
    pub fn push_frame(&self, frame: Frame) -> bool {
        if !self.is_active() {
            return false;
        }
        self.pipeline.write().frames_received += 1;

        match self.frames.try_send(frame) {
            Ok(()) => true,
            Err(TrySendError::Full(frame)) => {
                trace!(sequence = frame.sequence, "Detection queue full, dropping frame");
                self.pipeline.write().frames_dropped_backpressure += 1;
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Detection queue closed");
                false
            }
        }
    }

    /// Queue a frame, waiting for queue space.
    pub async fn push_frame_wait(&self, frame: Frame) -> bool {
        if !self.is_active() {
            return false;
        }
        self.pipeline.write().frames_received += 1;
        self.frames.send(frame).await.is_ok()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Current shooting statistics.
    pub fn stats(&self) -> SessionStats {
        self.sequencer.lock().stats()
    }

    pub fn pipeline_stats(&self) -> PipelineStats {
        self.pipeline.read().clone()
    }

    /// Connection state and whether the streaming channel is live.
    pub fn connectivity(&self) -> (ConnectionState, bool) {
        let state = self.controller.state();
        (state, state.is_live())
    }

    /// End the session and return the final statistics.
    ///
    /// Any analysis still in flight is abandoned; its result is discarded.
    /// Repeated calls return the same statistics.
    pub async fn end(&self) -> SessionStats {
        if !self.active.swap(false, Ordering::AcqRel) {
            return self.stats();
        }

        self.generation.fetch_add(1, Ordering::AcqRel);
        self.sequencer.lock().end();
        self.cancel.cancel();
        self.controller.disconnect().await;

        let stats = self.stats();
        let pipeline = self.pipeline_stats();
        info!(
            makes = stats.makes,
            total_shots = stats.total_shots,
            percentage = format!("{:.1}", stats.shooting_percentage()),
            frames_received = pipeline.frames_received,
            frames_dropped = pipeline.frames_dropped_backpressure,
            shots_ignored = pipeline.shots_ignored,
            duration_secs = self.started_at.elapsed().as_secs(),
            "Training session ended"
        );
        stats
    }
}

impl Drop for TrainingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_detection(
    mut state: DetectionState,
    mut frames: mpsc::Receiver<Frame>,
    events: mpsc::Sender<SessionEvent>,
    analyzing: Arc<AtomicBool>,
    permits: Arc<Semaphore>,
    pipeline: Arc<RwLock<PipelineStats>>,
    cancel: CancellationToken,
) {
    debug!("Detection worker started");

    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let Ok(permit) = Arc::clone(&permits).acquire_owned().await else {
            break;
        };
        let joined = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            let detection = state.observe(frame);
            (state, detection)
        })
        .await;

        let detection = match joined {
            Ok((returned, detection)) => {
                state = returned;
                detection
            }
            Err(e) => {
                error!(error = %e, "Detection task panicked, stopping worker");
                break;
            }
        };

        {
            let mut stats = pipeline.write();
            stats.frames_processed += 1;
            stats.shots_detected = state.detector.detections();
        }
        let Some((event, current)) = detection else {
            continue;
        };

        // Shots are not queued behind an analysis in flight
        if analyzing.load(Ordering::Acquire) {
            debug!("Shot ignored, analysis in flight");
            pipeline.write().shots_ignored += 1;
            continue;
        }

        if events
            .send(SessionEvent::ShotDetected { event, current })
            .await
            .is_err()
        {
            break;
        }
    }

    debug!("Detection worker stopped");
}

struct Coordinator {
    events_tx: mpsc::Sender<SessionEvent>,
    controller: Arc<AnalysisSessionController>,
    selector: FrameQualitySelector,
    sequencer: Arc<Mutex<FeedbackSequencer>>,
    feedback: Arc<dyn FeedbackSink>,
    analyzing: Arc<AtomicBool>,
    generation: Arc<AtomicU64>,
    permits: Arc<Semaphore>,
    pipeline: Arc<RwLock<PipelineStats>>,
}

impl Coordinator {
    async fn run(self, mut events: mpsc::Receiver<SessionEvent>, cancel: CancellationToken) {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                SessionEvent::ShotDetected { event, current } => self.on_shot(event, current),
                SessionEvent::AnalysisFinished { generation, result } => {
                    self.on_analysis_finished(generation, result)
                }
            }
        }
        debug!("Session coordinator stopped");
    }

    fn on_shot(&self, event: ShotEvent, current: Frame) {
        if self.analyzing.swap(true, Ordering::AcqRel) {
            self.pipeline.write().shots_ignored += 1;
            debug!("Shot ignored, analysis in flight");
            return;
        }

        let generation = self.generation.load(Ordering::Acquire);
        let last_tip = self.sequencer.lock().last_tip().to_string();
        let selector = self.selector.clone();
        let controller = Arc::clone(&self.controller);
        let permits = Arc::clone(&self.permits);
        let events = self.events_tx.clone();

        tokio::spawn(async move {
            let frames = {
                let _permit = permits.acquire_owned().await.ok();
                selector.select_async(event, current).await
            };

            let request = AnalysisRequest::new(frames, last_tip);
            debug!(request_id = %request.id, frames = request.frames.len(), "Requesting shot analysis");
            let result = match controller.analyze(request).await {
                Ok(result) => Some(result),
                Err(e) => {
                    warn!(error = %e, "Shot analysis rejected");
                    None
                }
            };

            // The coordinator is gone once the session has ended
            let _ = events
                .send(SessionEvent::AnalysisFinished { generation, result })
                .await;
        });
    }

    fn on_analysis_finished(&self, generation: u64, result: Option<AnalysisResult>) {
        self.analyzing.store(false, Ordering::Release);
        let Some(result) = result else {
            return;
        };

        if generation != self.generation.load(Ordering::Acquire) {
            debug!(generation, "Discarding result from a previous session generation");
            self.pipeline.write().results_discarded += 1;
            return;
        }

        let shown = self.sequencer.lock().accept(&result);
        let Some(shown) = shown else {
            self.pipeline.write().results_discarded += 1;
            return;
        };

        self.pipeline.write().analyses_completed += 1;
        info!(
            outcome = %shown.outcome,
            tip = %shown.tip,
            makes = shown.makes,
            total_shots = shown.total_shots,
            "Shot feedback ready"
        );
        self.feedback.on_display_event(shown);
    }
}
