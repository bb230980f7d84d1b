use crate::error::{Result, StreamError};
use serde::Deserialize;

/// Watermark-based refill policy for stages that prefetch from upstream
///
/// A stage that holds up to `capacity` elements (queued plus requested but
/// not yet received) stays quiet while it is above the low watermark, and
/// tops itself up to the high watermark once it falls to or below it.
/// Batching requests this way keeps `request` traffic proportional to
/// `capacity / (high - low)` rather than to the element count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct RefillController {
    /// Fill target as a percentage of capacity
    high_watermark: u32,
    /// Refill threshold as a percentage of capacity
    low_watermark: u32,
}

impl RefillController {
    /// Create a new refill controller
    /// Default: high=100%, low=50%
    pub fn new() -> Self {
        Self {
            high_watermark: 100,
            low_watermark: 50,
        }
    }

    /// Set custom watermark thresholds
    pub fn with_watermarks(high: u32, low: u32) -> Result<Self> {
        let controller = Self {
            high_watermark: high,
            low_watermark: low,
        };
        controller.validate()?;
        Ok(controller)
    }

    pub fn validate(&self) -> Result<()> {
        if self.high_watermark == 0
            || self.high_watermark > 100
            || self.low_watermark >= self.high_watermark
        {
            return Err(StreamError::InvalidConfig(format!(
                "watermarks must satisfy 0 <= low < high <= 100, got low={} high={}",
                self.low_watermark, self.high_watermark
            )));
        }
        Ok(())
    }

    pub fn high_watermark(&self) -> u32 {
        self.high_watermark
    }

    pub fn low_watermark(&self) -> u32 {
        self.low_watermark
    }

    /// How many elements to request given `committed` out of `capacity`
    ///
    /// Returns zero while the stage is above its low watermark.
    pub fn refill(&self, capacity: u64, committed: u64) -> u64 {
        let high = percent_of(capacity, self.high_watermark).max(1);
        let low = percent_of(capacity, self.low_watermark);
        if committed > low {
            0
        } else {
            high.saturating_sub(committed)
        }
    }
}

impl Default for RefillController {
    fn default() -> Self {
        Self::new()
    }
}

fn percent_of(capacity: u64, percent: u32) -> u64 {
    (capacity as u128 * percent as u128 / 100) as u64
}
