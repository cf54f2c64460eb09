//! Holding area for ticks that are not yet committed.
//!
//! Modules report independently, so a tick receives hits from many records that
//! arrive in no particular order. Ticks from `front` up to `front + capacity - 1`
//! accumulate here until the pipeline commits them in strict time order.

use crate::error::{SnError, SnResult};

/// Result of staging one sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageOutcome {
    /// Added to an uncommitted tick
    Staged,
    /// The tick was already committed; the hits were discarded
    Late,
}

/// Future-tick accumulator.
#[derive(Debug)]
pub struct StagingBuffer {
    data: Vec<u16>,
    width: usize,
    capacity: usize,
    front: u64,
    /// One past the highest tick that received hits
    high_water: u64,
}

impl StagingBuffer {
    /// Staging for `capacity` ticks of `width` modules.
    pub fn new(capacity: usize, width: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            data: vec![0; capacity * width],
            width,
            capacity,
            front: 0,
            high_water: 0,
        }
    }

    /// Tick capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Oldest uncommitted tick.
    pub fn front(&self) -> u64 {
        self.front
    }

    /// One past the newest tick holding hits (never below `front`).
    pub fn high_water(&self) -> u64 {
        self.high_water.max(self.front)
    }

    /// Whether `tick` can be staged without overflowing.
    pub fn fits(&self, tick: u64) -> bool {
        tick < self.front + self.capacity as u64
    }

    /// Add hits for a module to a tick.
    ///
    /// Counts saturate at `u16::MAX`; a tick beyond capacity is an invariant violation.
    pub fn add(&mut self, tick: u64, module: usize, count: u32) -> SnResult<StageOutcome> {
        if tick < self.front {
            return Ok(StageOutcome::Late);
        }
        if !self.fits(tick) {
            return Err(SnError::BufferOverflowAttempt {
                tick: tick - self.front,
                capacity: self.capacity,
            });
        }
        if module >= self.width {
            return Err(SnError::BufferOverflowAttempt {
                tick: tick - self.front,
                capacity: self.capacity,
            });
        }
        let slot = (tick % self.capacity as u64) as usize * self.width + module;
        let value = &mut self.data[slot];
        *value = value.saturating_add(u16::try_from(count).unwrap_or(u16::MAX));
        self.high_water = self.high_water.max(tick + 1);
        Ok(StageOutcome::Staged)
    }

    /// Move the front tick into `out` and advance. Returns the tick index.
    pub fn pop_front(&mut self, out: &mut [u16]) -> u64 {
        let start = (self.front % self.capacity as u64) as usize * self.width;
        let column = &mut self.data[start..start + self.width];
        let n = out.len().min(column.len());
        out[..n].copy_from_slice(&column[..n]);
        column.fill(0);
        let tick = self.front;
        self.front += 1;
        tick
    }

    /// Drop everything and restart at `front`.
    pub fn reset(&mut self, front: u64) {
        self.data.fill(0);
        self.front = front;
        self.high_water = front;
    }
}
