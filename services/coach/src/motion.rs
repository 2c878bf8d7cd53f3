//! Motion trajectory estimation.
//!
//! The shot detector does not care how candidate trajectories are found; any
//! [`TrajectoryEstimator`] will do. [`FrameDiffEstimator`] is the built-in
//! classical implementation: it diffs each frame against the previous one on
//! a coarse grid and tracks the centroid of the changed region.

use crate::config::MotionConfig;
use crate::frame::{Frame, FrameError};
use std::collections::VecDeque;
use thiserror::Error;
use tracing::trace;

/// Errors that can occur while estimating motion.
#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Malformed frame: {0}")]
    MalformedFrame(#[from] FrameError),

    #[error("Estimator failure: {0}")]
    Estimator(String),
}

/// A point in normalised frame coordinates (0.0 - 1.0, y = 0 at the top).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f32,
    pub y: f32,
}

impl Point {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another point.
    pub fn distance(&self, other: &Point) -> f32 {
        let dx = other.x - self.x;
        let dy = other.y - self.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// An ordered sequence of points describing one moving object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trajectory {
    pub points: Vec<Point>,
}

impl Trajectory {
    pub fn new(points: Vec<Point>) -> Self {
        Self { points }
    }

    /// Sum of distances between consecutive points.
    pub fn path_length(&self) -> f32 {
        self.points.windows(2).map(|w| w[0].distance(&w[1])).sum()
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }
}

/// Capability that turns frames into candidate trajectories.
pub trait TrajectoryEstimator: Send {
    /// Observe the next frame and return the trajectories currently tracked.
    fn observe(&mut self, frame: &Frame) -> Result<Vec<Trajectory>, DetectionError>;

    /// Forget all tracking state.
    fn reset(&mut self) {}
}

/// Coarse luminance grid of one frame.
#[derive(Debug, Clone)]
struct LumaGrid {
    width: u32,
    height: u32,
    cols: u32,
    rows: u32,
    cells: Vec<u8>,
}

/// Frame-difference trajectory estimator.
pub struct FrameDiffEstimator {
    config: MotionConfig,
    previous: Option<LumaGrid>,
    track: VecDeque<Point>,
    gap_frames: u32,
}

impl FrameDiffEstimator {
    /// Create a new estimator.
    pub fn new(config: MotionConfig) -> Self {
        let capacity = config.trajectory_length.max(1);
        Self {
            config,
            previous: None,
            track: VecDeque::with_capacity(capacity),
            gap_frames: 0,
        }
    }

    fn sample(&self, frame: &Frame) -> Result<LumaGrid, DetectionError> {
        frame.validate()?;
        let step = self.config.sample_step.max(1);
        let cols = frame.width.div_ceil(step);
        let rows = frame.height.div_ceil(step);

        let mut cells = Vec::with_capacity((cols * rows) as usize);
        for row in 0..rows {
            for col in 0..cols {
                let luma = frame
                    .luminance_at(col * step, row * step)
                    .ok_or_else(|| DetectionError::Estimator("grid sample out of bounds".into()))?;
                cells.push(luma);
            }
        }

        Ok(LumaGrid {
            width: frame.width,
            height: frame.height,
            cols,
            rows,
            cells,
        })
    }

    /// Centroid of the cells that changed between two grids.
    fn motion_centroid(&self, prev: &LumaGrid, current: &LumaGrid) -> Option<Point> {
        let mut sum_x = 0.0f64;
        let mut sum_y = 0.0f64;
        let mut changed = 0usize;

        for (idx, (a, b)) in prev.cells.iter().zip(&current.cells).enumerate() {
            if a.abs_diff(*b) > self.config.diff_threshold {
                let col = idx as u32 % current.cols;
                let row = idx as u32 / current.cols;
                sum_x += (col as f64 + 0.5) / current.cols as f64;
                sum_y += (row as f64 + 0.5) / current.rows as f64;
                changed += 1;
            }
        }

        if changed < self.config.min_changed_cells.max(1) {
            return None;
        }

        Some(Point::new(
            (sum_x / changed as f64) as f32,
            (sum_y / changed as f64) as f32,
        ))
    }
}

impl TrajectoryEstimator for FrameDiffEstimator {
    fn observe(&mut self, frame: &Frame) -> Result<Vec<Trajectory>, DetectionError> {
        let grid = self.sample(frame)?;

        let point = match self.previous.as_ref() {
            Some(prev) if prev.width == grid.width && prev.height == grid.height => {
                self.motion_centroid(prev, &grid)
            }
            Some(_) => {
                // Resolution changed mid-stream
                self.track.clear();
                None
            }
            None => None,
        };
        self.previous = Some(grid);

        match point {
            Some(p) => {
                self.gap_frames = 0;
                if self.track.len() >= self.config.trajectory_length.max(1) {
                    self.track.pop_front();
                }
                self.track.push_back(p);
                trace!(sequence = frame.sequence, x = p.x, y = p.y, "Motion centroid");
            }
            None => {
                self.gap_frames += 1;
                if self.gap_frames > self.config.max_gap_frames {
                    self.track.clear();
                }
            }
        }

        if self.track.len() < 2 {
            return Ok(Vec::new());
        }
        Ok(vec![Trajectory::new(self.track.iter().copied().collect())])
    }

    fn reset(&mut self) {
        self.previous = None;
        self.track.clear();
        self.gap_frames = 0;
    }
}
