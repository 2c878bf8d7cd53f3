//! Bounded ring buffer of recent frames.

use crate::frame::Frame;
use std::collections::VecDeque;
use tracing::error;

/// Recent frames for shot event construction.
///
/// Holds at most `capacity` frames in arrival order; pushing past capacity
/// evicts the oldest frame.
#[derive(Debug)]
pub struct FrameBuffer {
    frames: VecDeque<Frame>,
    capacity: usize,
}

impl FrameBuffer {
    /// Create a new frame buffer.
    pub fn new(capacity: usize) -> Self {
        if capacity == 0 {
            error!("Frame buffer configured with zero capacity; frames will not be retained");
        }
        Self {
            frames: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Add a frame to the buffer, evicting the oldest when full.
    pub fn push(&mut self, frame: Frame) {
        if self.capacity == 0 {
            error!(sequence = frame.sequence, "Dropping frame pushed into zero-capacity buffer");
            return;
        }
        while self.frames.len() >= self.capacity {
            self.frames.pop_front();
        }
        self.frames.push_back(frame);
    }

    /// Ordered copy of the current contents, oldest first.
    pub fn snapshot(&self) -> Vec<Frame> {
        self.frames.iter().cloned().collect()
    }

    /// Number of buffered frames.
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}
