//! Trajectory-based shot detection.
//!
//! A shot is an upward, arcing trajectory of meaningful length. After a
//! detection the detector cools down so one physical shot produces exactly one
//! [`ShotEvent`].

use crate::config::DetectorConfig;
use crate::frame::Frame;
use crate::motion::{Trajectory, TrajectoryEstimator};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Detector state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetectorState {
    /// Waiting for candidate motion
    Idle,
    /// Candidate trajectories observed, being evaluated
    Processing,
    /// A shot was just detected; further triggers suppressed until the instant
    CooldownWait { until: Instant },
}

/// A detected shot attempt.
#[derive(Debug, Clone)]
pub struct ShotEvent {
    /// When the shot was detected
    pub detected_at: Instant,

    /// Buffer window at detection time, oldest first
    pub frames: Vec<Frame>,

    /// Estimated frame where the ball leaves the hand
    pub release_frame_index: usize,

    /// Estimated frame where the ball reaches the hoop
    pub impact_frame_index: usize,
}

impl ShotEvent {
    /// Build an event from a buffer snapshot.
    ///
    /// The impact frame is the newest frame and the release frame sits
    /// `release_offset` frames before it. Indices are clamped so that
    /// `release < impact` whenever the window holds at least two frames.
    pub fn from_snapshot(frames: Vec<Frame>, release_offset: usize, detected_at: Instant) -> Self {
        let impact = frames.len().saturating_sub(1);
        let release = frames
            .len()
            .saturating_sub(release_offset.max(1))
            .min(impact.saturating_sub(1));

        Self {
            detected_at,
            frames,
            release_frame_index: release,
            impact_frame_index: impact,
        }
    }

    pub fn release_frame(&self) -> Option<&Frame> {
        if self.release_frame_index < self.impact_frame_index {
            self.frames.get(self.release_frame_index)
        } else {
            None
        }
    }

    pub fn impact_frame(&self) -> Option<&Frame> {
        self.frames.get(self.impact_frame_index)
    }
}

/// Check that y decreases (screen-up) between the start and one third in.
pub fn has_upward_motion(trajectory: &Trajectory) -> bool {
    let points = &trajectory.points;
    if points.len() < 3 {
        return false;
    }
    points[points.len() / 3].y < points[0].y
}

/// Check for an arc: the midpoint sits above both ends.
pub fn has_parabolic_motion(trajectory: &Trajectory) -> bool {
    let points = &trajectory.points;
    if points.len() < 5 {
        return false;
    }
    let start = points[0].y;
    let mid = points[points.len() / 2].y;
    let end = points[points.len() - 1].y;
    mid < start && mid < end
}

/// Shot detector driven by a pluggable trajectory estimator.
pub struct TrajectoryShotDetector {
    config: DetectorConfig,
    estimator: Box<dyn TrajectoryEstimator>,
    state: DetectorState,
    detections: u64,
}

impl TrajectoryShotDetector {
    /// Create a new detector.
    pub fn new(config: DetectorConfig, estimator: Box<dyn TrajectoryEstimator>) -> Self {
        Self {
            config,
            estimator,
            state: DetectorState::Idle,
            detections: 0,
        }
    }

    /// Current state, with an expired cooldown reported as `Idle`.
    pub fn state(&self, now: Instant) -> DetectorState {
        match self.state {
            DetectorState::CooldownWait { until } if now >= until => DetectorState::Idle,
            state => state,
        }
    }

    /// Number of shots detected so far.
    pub fn detections(&self) -> u64 {
        self.detections
    }

    fn cooldown(&self) -> Duration {
        self.config.cooldown()
    }

    /// Whether a trajectory looks like a shot.
    pub fn is_shot(&self, trajectory: &Trajectory) -> bool {
        if trajectory.len() < self.config.min_points.max(5) {
            return false;
        }
        if trajectory.path_length() < self.config.min_path_length {
            return false;
        }
        has_upward_motion(trajectory) && has_parabolic_motion(trajectory)
    }

    /// Observe a frame.
    ///
    /// `snapshot` is only invoked when a shot is detected and must return the
    /// current buffer window, oldest first. Estimator failures are logged and
    /// treated as "no detection".
    pub fn observe<F>(&mut self, frame: &Frame, now: Instant, snapshot: F) -> Option<ShotEvent>
    where
        F: FnOnce() -> Vec<Frame>,
    {
        // The estimator sees every frame so its motion history stays current,
        // even while cooling down.
        let trajectories = match self.estimator.observe(frame) {
            Ok(t) => t,
            Err(e) => {
                warn!(sequence = frame.sequence, error = %e, "Trajectory estimation failed");
                return None;
            }
        };

        if let DetectorState::CooldownWait { until } = self.state {
            if now < until {
                return None;
            }
            debug!("Detector cooldown elapsed");
            self.state = DetectorState::Idle;
        }

        if trajectories.is_empty() {
            return None;
        }

        self.state = DetectorState::Processing;

        let shot = trajectories.iter().find(|t| self.is_shot(t));
        let Some(trajectory) = shot else {
            self.state = DetectorState::Idle;
            return None;
        };

        self.detections += 1;
        self.state = DetectorState::CooldownWait {
            until: now + self.cooldown(),
        };

        let event = ShotEvent::from_snapshot(snapshot(), self.config.release_offset, now);
        info!(
            sequence = frame.sequence,
            path_length = trajectory.path_length(),
            points = trajectory.len(),
            window = event.frames.len(),
            release = event.release_frame_index,
            impact = event.impact_frame_index,
            "Shot detected"
        );

        Some(event)
    }

    /// Return to `Idle` and drop estimator history.
    pub fn reset(&mut self) {
        self.state = DetectorState::Idle;
        self.estimator.reset();
    }
}
