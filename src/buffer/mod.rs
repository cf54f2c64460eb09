//! Multi-scale streaming storage for the whole module array.
//!
//! Data moves through fixed-capacity levels, one committed 2 ms tick at a time:
//!
//! ```text
//! samples -> staging (future ticks, any order)
//!                | commit, strict time order
//!                v
//!            raw ring (2 ms, longest signal window)  -> sliding sums per window width
//!                | every `ticks_per_base` ticks
//!                v
//!            delay ring (base bins, exclusion + longest window)
//!                | oldest bin falls out
//!                v
//!            background ring (base bins, background window) -> BackgroundEstimator
//! ```
//!
//! The delay ring keeps the background estimate from ever seeing hits that are still
//! inside a signal window. Array-wide per-tick totals are kept separately for
//! lightcurves. Nothing allocates after construction.

pub mod ring;
pub mod staging;

pub use ring::ColumnRing;
pub use staging::{StageOutcome, StagingBuffer};

use crate::background::BackgroundEstimator;
use crate::config::{AnalysisConfig, GRID_MS};
use crate::error::SnResult;
use crate::rebin::GridSample;
use std::ops::Range;

/// Summary of one committed tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommittedTick {
    /// Tick index since the grid origin
    pub grid_index: u64,
    /// Hits across all modules in the tick
    pub array_total: u32,
    /// Base bin completed by this tick, with its array-wide total
    pub completed_bin: Option<(u64, u64)>,
}

/// Layout derived from the analysis configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferLayout {
    /// Module columns
    pub modules: usize,
    /// Uncommitted ticks that can be staged
    pub staging_ticks: usize,
    /// Signal window widths in ticks, in configuration order
    pub window_ticks: Vec<usize>,
    /// Signal window widths in base bins, in configuration order
    pub window_bins: Vec<usize>,
    /// Ticks per base bin
    pub ticks_per_base: usize,
    /// Base bins held back between the signal and background windows
    pub delay_bins: usize,
    /// Base bins in the background window
    pub background_bins: usize,
    /// Array-wide totals kept for lightcurves
    pub lightcurve_ticks: usize,
}

impl BufferLayout {
    /// Derive the layout for `modules` columns.
    pub fn new(
        analysis: &AnalysisConfig,
        modules: usize,
        staging_ticks: usize,
        lightcurve_ticks: usize,
    ) -> Self {
        let ticks_per_base = analysis.ticks_per_base().max(1);
        let window_ticks: Vec<usize> = analysis
            .window_widths_ms
            .iter()
            .map(|&w| (w / GRID_MS) as usize)
            .collect();
        let window_bins = window_ticks
            .iter()
            .map(|&w| w.div_ceil(ticks_per_base))
            .collect();
        let max_window_bins = analysis.max_window_ticks().div_ceil(ticks_per_base);
        Self {
            modules,
            staging_ticks,
            window_ticks,
            window_bins,
            ticks_per_base,
            delay_bins: analysis.exclusion_bins() + max_window_bins,
            background_bins: analysis.background_bins(),
            lightcurve_ticks,
        }
    }
}

/// Fixed-memory store behind the background and signal windows.
#[derive(Debug)]
pub struct StreamBuffer {
    layout: BufferLayout,
    staging: StagingBuffer,
    raw: ColumnRing<u16>,
    window_sums: Vec<Vec<u32>>,
    base_acc: Vec<u32>,
    base_fill: usize,
    base_index: u64,
    delay: ColumnRing<u32>,
    background: ColumnRing<u32>,
    array: ColumnRing<u32>,
    column: Vec<u16>,
    block: Vec<u32>,
}

impl StreamBuffer {
    /// Allocate every level for `layout`.
    pub fn new(layout: BufferLayout) -> Self {
        let modules = layout.modules;
        let max_window = layout.window_ticks.iter().copied().max().unwrap_or(1);
        Self {
            staging: StagingBuffer::new(layout.staging_ticks, modules),
            raw: ColumnRing::new(max_window, modules),
            window_sums: vec![vec![0; modules]; layout.window_ticks.len()],
            base_acc: vec![0; modules],
            base_fill: 0,
            base_index: 0,
            delay: ColumnRing::new(layout.delay_bins, modules),
            background: ColumnRing::new(layout.background_bins, modules),
            array: ColumnRing::new(layout.lightcurve_ticks, 1),
            column: vec![0; modules],
            block: vec![0; modules],
            layout,
        }
    }

    /// Layout in use.
    pub fn layout(&self) -> &BufferLayout {
        &self.layout
    }

    /// Next tick to be committed.
    pub fn front(&self) -> u64 {
        self.staging.front()
    }

    /// One past the newest tick holding staged hits.
    pub fn staged_until(&self) -> u64 {
        self.staging.high_water()
    }

    /// Whether a tick index can still be staged.
    pub fn can_stage(&self, tick: u64) -> bool {
        self.staging.fits(tick)
    }

    /// Route one rebinned sample into staging.
    pub fn stage(&mut self, sample: &GridSample) -> SnResult<StageOutcome> {
        self.staging
            .add(sample.grid_index, sample.module_index, sample.count)
    }

    /// Commit the front tick to every level.
    ///
    /// Evicted background bins are retired from `background` before the new bin is
    /// added, so the estimator always reflects exactly the background ring.
    pub fn commit_tick(&mut self, background: &mut BackgroundEstimator) -> CommittedTick {
        let grid_index = self.staging.pop_front(&mut self.column);
        let array_total: u32 = self.column.iter().map(|&c| u32::from(c)).sum();

        for (sums, &width) in self.window_sums.iter_mut().zip(&self.layout.window_ticks) {
            if self.raw.len() >= width {
                if let Some(leaving) = self.raw.get(width - 1) {
                    for (s, &c) in sums.iter_mut().zip(leaving) {
                        *s -= u32::from(c);
                    }
                }
            }
            for (s, &c) in sums.iter_mut().zip(&self.column) {
                *s += u32::from(c);
            }
        }
        self.raw.push(&self.column);
        self.array.push(&[array_total]);

        for (acc, &c) in self.base_acc.iter_mut().zip(&self.column) {
            *acc += u32::from(c);
        }
        self.base_fill += 1;

        let mut completed_bin = None;
        if self.base_fill == self.layout.ticks_per_base {
            if let Some(matured) = self.delay.next_evicted() {
                let held = self.background.len();
                if self.background.is_full() {
                    // Blocks starting at the bin about to be evicted
                    for (w, &k) in self.layout.window_bins.iter().enumerate() {
                        let ages = held.saturating_sub(k)..held;
                        if block_sum(&self.background, ages, k, &mut self.block) {
                            background.remove_block(w, &self.block);
                        }
                    }
                }
                if let Some(expired) = self.background.next_evicted() {
                    background.remove(expired);
                }
                background.add(matured);
                self.background.push(matured);
                // Blocks ending at the bin just added
                for (w, &k) in self.layout.window_bins.iter().enumerate() {
                    if block_sum(&self.background, 0..k, k, &mut self.block) {
                        background.add_block(w, &self.block);
                    }
                }
            }
            self.delay.push(&self.base_acc);
            let total = self.base_acc.iter().map(|&c| u64::from(c)).sum();
            completed_bin = Some((self.base_index, total));
            self.base_acc.fill(0);
            self.base_fill = 0;
            self.base_index += 1;
        }

        CommittedTick {
            grid_index,
            array_total,
            completed_bin,
        }
    }

    /// Hits per module over the last `window_ticks[width_index]` committed ticks.
    pub fn window_counts(&self, width_index: usize) -> &[u32] {
        self.window_sums
            .get(width_index)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Whether enough ticks have been committed to fill a signal window.
    pub fn window_filled(&self, width_index: usize) -> bool {
        self.layout
            .window_ticks
            .get(width_index)
            .is_some_and(|&w| self.raw.len() >= w)
    }

    /// Whether the background window holds its full complement of bins.
    pub fn background_full(&self) -> bool {
        self.background.is_full()
    }

    /// Committed ticks since the last clear.
    pub fn committed_ticks(&self) -> u64 {
        self.raw.total_pushed()
    }

    /// Array-wide totals for the last `ticks` committed ticks, oldest first.
    pub fn lightcurve(&self, ticks: usize) -> Vec<u32> {
        let n = ticks.min(self.array.len());
        (0..n).rev().filter_map(|age| self.array.get(age)).map(|c| c[0]).collect()
    }

    /// Reset every level and restart staging at `front` (stream restart only).
    pub fn clear(&mut self, front: u64, background: &mut BackgroundEstimator) {
        self.staging.reset(front);
        self.raw.clear();
        self.window_sums.iter_mut().for_each(|s| s.fill(0));
        self.base_acc.fill(0);
        self.base_fill = 0;
        self.base_index = front / self.layout.ticks_per_base as u64;
        self.delay.clear();
        self.background.clear();
        self.array.clear();
        background.clear();
    }
}

/// Sum the bins at `ages` into `out`. False unless all `k` of them are held.
fn block_sum(ring: &ColumnRing<u32>, ages: Range<usize>, k: usize, out: &mut [u32]) -> bool {
    if k == 0 || ages.len() != k || ages.end > ring.len() {
        return false;
    }
    out.fill(0);
    for age in ages {
        if let Some(bin) = ring.get(age) {
            for (o, &c) in out.iter_mut().zip(bin) {
                *o += c;
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn tiny_config() -> AnalysisConfig {
        AnalysisConfig {
            background_window: Duration::from_millis(12),
            exclusion: Duration::from_millis(4),
            window_widths_ms: vec![4, 8],
            ..Default::default()
        }
    }

    fn sample(tick: u64, module: usize, count: u32) -> GridSample {
        GridSample {
            grid_index: tick,
            module_index: module,
            count,
        }
    }

    #[test]
    fn test_layout() {
        let layout = BufferLayout::new(&tiny_config(), 2, 16, 8);
        assert_eq!(layout.ticks_per_base, 2);
        assert_eq!(layout.window_ticks, vec![2, 4]);
        // One exclusion bin plus the two bins the longest window can reach back into
        assert_eq!(layout.delay_bins, 3);
        assert_eq!(layout.background_bins, 3);
    }

    #[test]
    fn test_window_sums_slide() {
        let layout = BufferLayout::new(&tiny_config(), 1, 16, 8);
        let mut buf = StreamBuffer::new(layout);
        let mut bg = BackgroundEstimator::new(1, 4);
        for (tick, count) in [1u32, 2, 3, 4, 5].into_iter().enumerate() {
            buf.stage(&sample(tick as u64, 0, count)).unwrap();
        }
        let mut seen = Vec::new();
        for _ in 0..5 {
            buf.commit_tick(&mut bg);
            seen.push((buf.window_counts(0)[0], buf.window_counts(1)[0]));
        }
        assert_eq!(seen, vec![(1, 1), (3, 3), (5, 6), (7, 10), (9, 14)]);
        assert!(buf.window_filled(1));
        assert_eq!(buf.lightcurve(3), vec![3, 4, 5]);
    }

    #[test]
    fn test_background_lags_by_delay() {
        let layout = BufferLayout::new(&tiny_config(), 1, 64, 8);
        let mut buf = StreamBuffer::new(layout);
        let mut bg = BackgroundEstimator::new(1, 4);
        // Bin b holds b+1 hits in each of its two ticks
        for tick in 0..40u64 {
            buf.stage(&sample(tick, 0, (tick / 2 + 1) as u32)).unwrap();
        }
        let mut bins_done = 0;
        for _ in 0..20 {
            let committed = buf.commit_tick(&mut bg);
            if committed.completed_bin.is_some() {
                bins_done += 1;
            }
        }
        assert_eq!(bins_done, 10);
        // Bins 7..=9 wait in the delay ring, bins 4..=6 form the background
        assert!(buf.background_full());
        assert_eq!(bg.bins(), 3);
        // Bin b holds 2*(b+1) hits: 10, 12, 14
        assert!((bg.mean(0) - 12.0).abs() < 1e-12);
        assert!((bg.variance(0).unwrap() - 8.0 / 3.0).abs() < 1e-12);
    }

    #[test]
    fn test_clear_resets_levels() {
        let layout = BufferLayout::new(&tiny_config(), 1, 16, 8);
        let mut buf = StreamBuffer::new(layout);
        let mut bg = BackgroundEstimator::new(1, 4);
        buf.stage(&sample(0, 0, 3)).unwrap();
        buf.commit_tick(&mut bg);
        buf.clear(100, &mut bg);
        assert_eq!(buf.front(), 100);
        assert_eq!(buf.committed_ticks(), 0);
        assert_eq!(buf.window_counts(0), &[0u32][..]);
        assert!(buf.lightcurve(4).is_empty());
        assert_eq!(buf.stage(&sample(5, 0, 1)).unwrap(), StageOutcome::Late);
    }

    #[test]
    fn test_block_moments_track_ring() {
        let layout = BufferLayout::new(&tiny_config(), 1, 64, 8);
        let mut bg = BackgroundEstimator::for_layout(&layout);
        let mut buf = StreamBuffer::new(layout);
        // Bins alternate 2 and 6 hits, so every two-bin block holds 8
        for tick in 0..40u64 {
            let count = if (tick / 2) % 2 == 0 { 1 } else { 3 };
            buf.stage(&sample(tick, 0, count)).unwrap();
        }
        for _ in 0..20 {
            buf.commit_tick(&mut bg);
        }
        assert_eq!(bg.bins(), 3);
        assert_eq!(bg.blocks(0), 3);
        assert_eq!(bg.blocks(1), 2);
        assert!((bg.window_mean(1, 0).unwrap() - 8.0).abs() < 1e-9);
        assert_eq!(bg.window_variance(1, 0).unwrap(), Some(0.0));
        assert!(bg.variance(0).unwrap() > 0.0);
    }
}
