//! Flat-image spoof scoring via yaw-proxy stability analysis.
//!
//! A printed photograph or a phone screen held up to the camera can be
//! slid sideways to fake a head turn: the nose moves off the cheek midpoint,
//! but because the image is flat the distance between the eye corners stays
//! essentially constant. A real head rotating about its vertical axis
//! foreshortens that distance measurably.
//!
//! The scorer keeps a running suspicion counter. Frames that show a large
//! apparent turn while the recent yaw proxy is flat push the counter up
//! quickly; every other scored frame lets it decay slowly. Crossing the
//! block threshold is a terminal outcome for the session.
//!
//! # Threat Coverage
//!
//! - **Blocks:** Printed photographs and screens panned or tilted in front of
//!   the camera to simulate the turn challenges.
//! - **Does not block:** Video replays of a real head turn, 3D masks, or
//!   depth-consistent adversarial displays.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::config::LivenessConfig;

/// Bounded FIFO of the most recent yaw-proxy samples.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct YawHistory {
    samples: VecDeque<f32>,
    capacity: usize,
}

impl YawHistory {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Append a sample, evicting the oldest once the window is full.
    pub fn push(&mut self, yaw: f32) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(yaw);
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn clear(&mut self) {
        self.samples.clear();
    }

    /// `max - min` over the window, or `None` when empty.
    pub fn range(&self) -> Option<f32> {
        let mut iter = self.samples.iter().copied();
        let first = iter.next()?;
        let (min, max) = iter.fold((first, first), |(lo, hi), v| (lo.min(v), hi.max(v)));
        Some(max - min)
    }
}

/// Outcome of scoring one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuspicionUpdate {
    /// Score after this frame.
    pub score: u32,
    /// Yaw range used for the decision; `None` while warming up.
    pub yaw_range: Option<f32>,
    /// Whether this frame looked like a panned flat image.
    pub flat_motion: bool,
}

/// Stateless scoring rule; the score itself lives in the session.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuspicionScorer {
    warmup: usize,
    increment: u32,
    decrement: u32,
    block_threshold: u32,
    yaw_flatness: f32,
    offset_flatness: f32,
}

impl SuspicionScorer {
    pub fn from_config(config: &LivenessConfig) -> Self {
        Self {
            warmup: config.scorer_warmup,
            increment: config.suspicion_increment,
            decrement: config.suspicion_decrement,
            block_threshold: config.suspicion_block_threshold,
            yaw_flatness: config.yaw_flatness_threshold,
            offset_flatness: config.offset_flatness_threshold,
        }
    }

    /// Score one frame. Leaves `score` untouched until `history` holds at
    /// least the warm-up number of samples.
    pub fn update(&self, score: u32, offset: f32, history: &YawHistory) -> SuspicionUpdate {
        if history.len() < self.warmup {
            return SuspicionUpdate {
                score,
                yaw_range: None,
                flat_motion: false,
            };
        }

        // Non-empty: warmup is at least 1.
        let yaw_range = history.range().unwrap_or(0.0);
        let flat_motion = offset.abs() > self.offset_flatness && yaw_range < self.yaw_flatness;

        let score = if flat_motion {
            score.saturating_add(self.increment)
        } else {
            score.saturating_sub(self.decrement)
        };

        SuspicionUpdate {
            score,
            yaw_range: Some(yaw_range),
            flat_motion,
        }
    }

    pub fn should_block(&self, score: u32) -> bool {
        score > self.block_threshold
    }
}

impl Default for SuspicionScorer {
    fn default() -> Self {
        Self::from_config(&LivenessConfig::default())
    }
}
