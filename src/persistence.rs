use std::num::NonZeroU32;

use crate::detector::Detection;

/// Debounce state of the persistence filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterState {
    /// No hits since the last clean frame or reset.
    Idle,
    /// Some consecutive hits, fewer than the persistence window.
    Accumulating,
    /// The persistence window has been reached.
    Triggered,
}

/// Converts per-frame hit/no-hit signals into a debounced pause decision.
///
/// Any non-empty detection set counts as exactly one hit; an empty set resets
/// the count to zero with no partial decay. Once the count reaches the
/// persistence window the filter stays triggered on every further hit until
/// [`PersistenceFilter::reset`] is called.
///
/// The filter holds no frame or display dependency, so it can be driven
/// directly from a sequence of booleans.
#[derive(Debug, Clone)]
pub struct PersistenceFilter {
    persistence_frames: NonZeroU32,
    consecutive_hits: u32,
}

impl PersistenceFilter {
    pub fn new(persistence_frames: NonZeroU32) -> Self {
        Self {
            persistence_frames,
            consecutive_hits: 0,
        }
    }

    /// Feed one frame's detections and report whether the filter is triggered.
    pub fn observe(&mut self, detections: &[Detection]) -> bool {
        self.record(!detections.is_empty())
    }

    /// Feed one frame's hit/no-hit signal and report whether the filter is triggered.
    pub fn record(&mut self, hit: bool) -> bool {
        if hit {
            self.consecutive_hits = self.consecutive_hits.saturating_add(1);
        } else {
            self.consecutive_hits = 0;
        }
        self.is_triggered()
    }

    /// Force the hit count back to zero.
    pub fn reset(&mut self) {
        self.consecutive_hits = 0;
    }

    pub fn is_triggered(&self) -> bool {
        self.consecutive_hits >= self.persistence_frames.get()
    }

    pub fn state(&self) -> FilterState {
        match self.consecutive_hits {
            0 => FilterState::Idle,
            hits if hits < self.persistence_frames.get() => FilterState::Accumulating,
            _ => FilterState::Triggered,
        }
    }

    pub fn consecutive_hits(&self) -> u32 {
        self.consecutive_hits
    }

    pub fn persistence_frames(&self) -> u32 {
        self.persistence_frames.get()
    }
}
