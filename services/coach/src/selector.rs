//! Frame quality selection for shot analysis.
//!
//! Picks the frames worth sending to the analysis service: the release frame
//! for form, then the impact frame for outcome. Frames that are too small, too
//! dark or too bright are filtered out, but the selector always hands back at
//! least one frame when given a fallback.

use crate::config::SelectionConfig;
use crate::detector::ShotEvent;
use crate::frame::Frame;
use tracing::{debug, trace, warn};

/// Decision on whether a frame is good enough to analyse
#[derive(Debug, Clone, PartialEq)]
pub enum QualityDecision {
    /// Frame passes every check
    Accept,
    /// Frame rejected with given reason
    Reject { reason: String },
}

/// Mean Rec.601 luminance (0.0 - 1.0) sampled every `step` pixels.
///
/// Returns `None` for frames with no readable pixels.
pub fn mean_brightness(frame: &Frame, step: u32) -> Option<f32> {
    let step = step.max(1) as usize;
    let mut sum = 0u64;
    let mut count = 0u64;

    for y in (0..frame.height).step_by(step) {
        for x in (0..frame.width).step_by(step) {
            if let Some(luma) = frame.luminance_at(x, y) {
                sum += luma as u64;
                count += 1;
            }
        }
    }

    if count == 0 {
        return None;
    }
    Some(sum as f32 / count as f32 / 255.0)
}

/// Selects analysable frames from a shot event.
#[derive(Debug, Clone)]
pub struct FrameQualitySelector {
    config: SelectionConfig,
}

impl FrameQualitySelector {
    /// Create a new frame selector with the given configuration
    pub fn new(config: SelectionConfig) -> Self {
        Self { config }
    }

    /// Evaluate one frame against the resolution and brightness checks
    pub fn evaluate(&self, frame: &Frame) -> QualityDecision {
        if frame.width < self.config.min_width || frame.height < self.config.min_height {
            return QualityDecision::Reject {
                reason: format!(
                    "Resolution {}x{} below minimum {}x{}",
                    frame.width, frame.height, self.config.min_width, self.config.min_height
                ),
            };
        }

        let Some(brightness) = mean_brightness(frame, self.config.sample_step) else {
            return QualityDecision::Reject {
                reason: "No readable pixels".to_string(),
            };
        };

        if brightness <= self.config.min_brightness {
            return QualityDecision::Reject {
                reason: format!(
                    "Too dark: brightness {:.2} <= {:.2}",
                    brightness, self.config.min_brightness
                ),
            };
        }
        if brightness >= self.config.max_brightness {
            return QualityDecision::Reject {
                reason: format!(
                    "Too bright: brightness {:.2} >= {:.2}",
                    brightness, self.config.max_brightness
                ),
            };
        }

        QualityDecision::Accept
    }

    /// Candidate frames in preference order before filtering.
    fn candidates(&self, event: &ShotEvent, fallback: &Frame) -> Vec<Frame> {
        let mut candidates: Vec<Frame> = event
            .release_frame()
            .into_iter()
            .chain(event.impact_frame())
            .cloned()
            .collect();

        if candidates.is_empty() {
            candidates.push(fallback.clone());
        }
        candidates
    }

    /// Select frames to analyse, release frame first.
    ///
    /// Never returns an empty sequence: when every candidate fails the quality
    /// checks the unfiltered candidates are returned instead.
    pub fn select(&self, event: &ShotEvent, fallback: &Frame) -> Vec<Frame> {
        let candidates = self.candidates(event, fallback);

        let accepted: Vec<Frame> = candidates
            .iter()
            .filter(|frame| match self.evaluate(frame) {
                QualityDecision::Accept => true,
                QualityDecision::Reject { reason } => {
                    trace!(sequence = frame.sequence, %reason, "Frame rejected");
                    false
                }
            })
            .cloned()
            .collect();

        if accepted.is_empty() {
            debug!(
                candidates = candidates.len(),
                "No frame passed quality checks, using unfiltered candidates"
            );
            return candidates;
        }

        accepted
    }

    /// Run [`select`](Self::select) on the blocking pool.
    pub async fn select_async(&self, event: ShotEvent, fallback: Frame) -> Vec<Frame> {
        let selector = self.clone();
        let fallback_copy = fallback.clone();
        match tokio::task::spawn_blocking(move || selector.select(&event, &fallback)).await {
            Ok(frames) => frames,
            Err(e) => {
                warn!(error = %e, "Frame selection task failed, using fallback frame");
                vec![fallback_copy]
            }
        }
    }
}
