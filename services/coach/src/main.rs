//! Shot Coach
//!
//! Reads raw RGB24 frames from stdin, runs them through a training session and
//! logs the coaching feedback for every detected shot.
//!
//! # Usage
//!
//! ```text
//! ffmpeg -i rtsp://camera/stream -f rawvideo -pix_fmt rgb24 -s 640x480 - | shot-coach
//! ```
//!
//! The frame size must match `capture.width` x `capture.height`.

use shot_coach::config::{self, CoachConfig};
use shot_coach::feedback::SessionStats;
use shot_coach::frame::{Frame, PixelFormat};
use shot_coach::session::{
    ConnectivityObserver, FeedbackSink, PipelineStats, SessionCollaborators, TrainingSession,
};
use shot_coach::{ConnectionState, DisplayEvent};

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// How often pipeline statistics are logged while running.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "shot-coach",
        version = env!("CARGO_PKG_VERSION"),
        device_id = %config.credentials.device_id,
        width = config.capture.width,
        height = config.capture.height,
        "Starting shot coach"
    );

    config.validate()?;

    match run_session(config).await {
        Ok(()) => {
            info!("Shot coach completed successfully");
        }
        Err(e) => {
            error!(error = %e, "Shot coach failed");
            return Err(e);
        }
    }

    Ok(())
}

/// Load configuration.
fn load_config() -> anyhow::Result<CoachConfig> {
    // Try loading from files first, fall back to environment
    let config = CoachConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        CoachConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &config::LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("shot_coach={}", level).parse()?)
        .add_directive("tungstenite=warn".parse()?)
        .add_directive("hyper=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    }

    Ok(())
}

/// Logs every shot result.
struct LogFeedback;

impl FeedbackSink for LogFeedback {
    fn on_display_event(&self, event: DisplayEvent) {
        info!(
            outcome = %event.outcome,
            tip = %event.tip,
            makes = event.makes,
            total_shots = event.total_shots,
            shot_type = ?event.shot_type,
            "Shot result"
        );
    }
}

/// Logs connectivity changes.
struct LogConnectivity;

impl ConnectivityObserver for LogConnectivity {
    fn on_connectivity_change(&self, state: ConnectionState, live: bool) {
        info!(state = %state, live, "Analysis connectivity changed");
    }
}

/// Run one training session until Ctrl+C or end of input.
async fn run_session(config: CoachConfig) -> anyhow::Result<()> {
    let collaborators = SessionCollaborators {
        feedback: Arc::new(LogFeedback),
        connectivity: Arc::new(LogConnectivity),
    };
    let session = Arc::new(TrainingSession::start(config.clone(), collaborators).await?);

    // Spawn the frame reader task
    let reader_handle = tokio::spawn({
        let session = session.clone();
        let capture = config.capture.clone();
        async move {
            let mut reader =
                RawFrameReader::new(tokio::io::stdin(), capture.width, capture.height);
            let mut frames = 0u64;
            loop {
                let frame = match reader.next_frame().await {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(e) => {
                        error!(error = %e, "Failed to read frame from stdin");
                        break;
                    }
                };
                frames += 1;
                if capture.drop_on_backpressure {
                    session.push_frame(frame);
                } else if !session.push_frame_wait(frame).await {
                    break;
                }
            }
            info!(frames, "Frame input finished");
        }
    });

    // Spawn the stats monitoring task
    let monitor_handle = tokio::spawn({
        let session = session.clone();
        async move {
            run_stats_monitor(session, STATS_INTERVAL).await;
        }
    });

    // Wait for shutdown signal
    let shutdown_signal = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            futures::future::pending::<()>().await;
        }
        info!("Received shutdown signal");
    };

    tokio::select! {
        _ = shutdown_signal => {
            info!("Initiating graceful shutdown...");
        }
        _ = reader_handle => {
            info!("Input ended, finishing session");
        }
    }

    monitor_handle.abort();

    let stats = session.end().await;
    log_final_stats(&stats, &session.pipeline_stats());

    info!("Shutdown complete");
    Ok(())
}

/// Periodically log pipeline statistics.
async fn run_stats_monitor(session: Arc<TrainingSession>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    // First tick completes immediately
    ticker.tick().await;

    while session.is_active() {
        ticker.tick().await;

        let (state, live) = session.connectivity();
        let pipeline = session.pipeline_stats();
        let stats = session.stats();
        info!(
            frames_received = pipeline.frames_received,
            frames_dropped = pipeline.frames_dropped_backpressure,
            shots_detected = pipeline.shots_detected,
            makes = stats.makes,
            total_shots = stats.total_shots,
            state = %state,
            live,
            "Session stats"
        );
    }
}

/// Log final statistics on shutdown.
fn log_final_stats(stats: &SessionStats, pipeline: &PipelineStats) {
    info!("=== Final Statistics ===");

    info!(
        makes = stats.makes,
        total_shots = stats.total_shots,
        percentage = format!("{:.1}", stats.shooting_percentage()),
        last_tip = %stats.last_tip,
        "Shooting final stats"
    );

    info!(
        frames_received = pipeline.frames_received,
        frames_dropped = pipeline.frames_dropped_backpressure,
        frames_processed = pipeline.frames_processed,
        shots_detected = pipeline.shots_detected,
        shots_ignored = pipeline.shots_ignored,
        analyses_completed = pipeline.analyses_completed,
        results_discarded = pipeline.results_discarded,
        "Pipeline final stats"
    );
}

/// Splits a raw RGB24 byte stream into frames.
struct RawFrameReader<R> {
    reader: R,
    width: u32,
    height: u32,
    sequence: u64,
}

impl<R: AsyncRead + Unpin> RawFrameReader<R> {
    fn new(reader: R, width: u32, height: u32) -> Self {
        Self {
            reader,
            width,
            height,
            sequence: 0,
        }
    }

    fn frame_len(&self) -> usize {
        self.width as usize * self.height as usize * PixelFormat::Rgb8.bytes_per_pixel()
    }

    /// Next complete frame, or `None` at end of input.
    ///
    /// A truncated trailing frame is dropped.
    async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        let mut data = vec![0u8; self.frame_len()];
        let mut filled = 0;
        while filled < data.len() {
            let n = self.reader.read(&mut data[filled..]).await?;
            if n == 0 {
                if filled > 0 {
                    warn!(bytes = filled, expected = data.len(), "Dropping truncated trailing frame");
                }
                return Ok(None);
            }
            filled += n;
        }

        self.sequence += 1;
        Ok(Some(Frame::new(
            data,
            self.width,
            self.height,
            PixelFormat::Rgb8,
            self.sequence,
        )))
    }
}
