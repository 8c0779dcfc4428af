//! Height windows.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open height range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Window {
    pub start: u64,
    pub end: u64,
}

impl Window {
    /// Window of `interval` heights starting at `start`.
    pub fn starting_at(start: u64, interval: u64) -> Self {
        Self {
            start,
            end: start.saturating_add(interval),
        }
    }

    pub fn contains(&self, height: u64) -> bool {
        height >= self.start && height < self.end
    }

    /// True when `[start, end)` lies entirely inside this window.
    pub fn covers(&self, start: u64, end: u64) -> bool {
        start >= self.start && end <= self.end
    }

    /// True when `[start, end)` (open-ended if `end` is `None`) intersects this window.
    pub fn intersects(&self, start: u64, end: Option<u64>) -> bool {
        start < self.end && end.map_or(true, |end| end > self.start)
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Round `height` down to a multiple of `interval`.
pub fn align_down(height: u64, interval: u64) -> u64 {
    if interval == 0 {
        return height;
    }
    height - height % interval
}
