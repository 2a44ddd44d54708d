//! # Temporal Smoothing
//!
//! A single frame's probability is noisy. Each session keeps the last W raw outcomes
//! and reports their mean confidence and a majority vote over their flags, so the
//! reported signal lags by at most W frames (4 × 40ms ≈ 160ms by default).

use chrono::{DateTime, Utc};
use std::collections::VecDeque;

/// One raw per-frame outcome.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowEntry {
    pub is_noisy: bool,
    pub confidence: f32,
    pub timestamp: DateTime<Utc>,
}

/// Result of folding one outcome into a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Smoothed {
    pub is_noisy: bool,
    pub confidence: f32,
}

/// Bounded history of raw outcomes, oldest first.
///
/// ## Memory Management:
/// Never holds more than `capacity` entries; pushing into a full window evicts the
/// oldest entry.
#[derive(Debug, Clone)]
pub struct SmoothingWindow {
    entries: VecDeque<WindowEntry>,
    capacity: usize,
    /// Previous smoothed flag, used to break voting ties
    last_is_noisy: Option<bool>,
}

impl SmoothingWindow {
    /// Create an empty window. A capacity of 0 is treated as 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            last_is_noisy: None,
        }
    }

    /// The most recent smoothed flag, if any frame has been folded in.
    pub fn last_is_noisy(&self) -> Option<bool> {
        self.last_is_noisy
    }

    fn push(&mut self, entry: WindowEntry) {
        self.entries.push_back(entry);
        while self.entries.len() > self.capacity {
            self.entries.pop_front();
        }
    }
}

#[cfg(test)]
impl SmoothingWindow {
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &WindowEntry> {
        self.entries.iter()
    }
}

/// Folds raw outcomes into a `SmoothingWindow`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SmoothingController;

impl SmoothingController {
    /// Push a raw outcome and compute the smoothed values.
    ///
    /// ## Rules:
    /// - **confidence**: arithmetic mean of the confidences in the window
    /// - **is_noisy**: majority vote of the flags in the window; a tie keeps the
    ///   previous smoothed flag, or `false` when there is none
    pub fn update(
        &self,
        window: &mut SmoothingWindow,
        raw_is_noisy: bool,
        raw_confidence: f32,
        timestamp: DateTime<Utc>,
    ) -> Smoothed {
        window.push(WindowEntry {
            is_noisy: raw_is_noisy,
            confidence: raw_confidence,
            timestamp,
        });

        let total = window.entries.len();
        let confidence =
            window.entries.iter().map(|e| e.confidence).sum::<f32>() / total as f32;

        let noisy_votes = window.entries.iter().filter(|e| e.is_noisy).count();
        let quiet_votes = total - noisy_votes;
        let is_noisy = match noisy_votes.cmp(&quiet_votes) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => window.last_is_noisy.unwrap_or(false),
        };

        window.last_is_noisy = Some(is_noisy);

        Smoothed { is_noisy, confidence }
    }
}
