//! Bounded training buffer
//!
//! Samples accumulate until a retraining pass drains them as a unit. When the
//! bound is hit the oldest sample is dropped first.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

use crate::types::FeatureVector;

/// One labelled observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub inputs: FeatureVector,
    pub outcome: bool,
}

impl Sample {
    pub fn new(inputs: FeatureVector, outcome: bool) -> Self {
        Self { inputs, outcome }
    }

    pub fn target(&self) -> f32 {
        if self.outcome {
            1.0
        } else {
            0.0
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainingBuffer {
    samples: VecDeque<Sample>,
    capacity: usize,
    dropped: u64,
}

impl TrainingBuffer {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append a sample; returns the evicted oldest sample when full
    pub fn push(&mut self, sample: Sample) -> Option<Sample> {
        let evicted = if self.samples.len() == self.capacity {
            self.dropped += 1;
            self.samples.pop_front()
        } else {
            None
        };
        self.samples.push_back(sample);
        evicted
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

    /// Samples evicted over the buffer's lifetime
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Take every sample, oldest first, leaving the buffer empty
    pub fn drain(&mut self) -> Vec<Sample> {
        self.samples.drain(..).collect()
    }

    /// Put back samples from a failed pass. They are older than anything
    /// recorded since, so they go in front and are the first to be evicted.
    pub fn restore(&mut self, older: Vec<Sample>) {
        let newer = std::mem::take(&mut self.samples);
        let total = older.len() + newer.len();
        let skip = total.saturating_sub(self.capacity);
        self.dropped += skip as u64;
        self.samples = older.into_iter().chain(newer).skip(skip).collect();
    }

    pub fn iter(&self) -> impl Iterator<Item = &Sample> {
        self.samples.iter()
    }
}
