//! Real-time basketball shot coaching.
//!
//! Watches a camera feed for basketball shots, sends the frames around each
//! shot to a remote analysis service and turns the answers into make/miss
//! statistics and coaching tips.
//!
//! # Architecture
//!
//! ```text
//! Camera -> FrameBuffer -> TrajectoryShotDetector -> FrameQualitySelector
//!                                                          |
//!                                                          v
//!              FeedbackSequencer <- AnalysisSessionController (live | fallback)
//!                     |
//!                     v
//!               FeedbackSink (UI / audio)
//! ```
//!
//! [`session::TrainingSession`] wires everything together for one session.
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with COACH_)
//!
//! See [`config`] for detailed configuration options.

pub mod analysis;
pub mod config;
pub mod credential;
pub mod detector;
pub mod feedback;
pub mod frame;
pub mod frame_buffer;
pub mod motion;
pub mod selector;
pub mod session;

pub use analysis::{AnalysisResult, ConnectionState, ShotOutcome, ShotType};
pub use config::CoachConfig;
pub use feedback::{DisplayEvent, SessionStats};
pub use frame::{Frame, PixelFormat};
pub use session::{FeedbackSink, SessionCollaborators, TrainingSession};
