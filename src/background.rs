//! Per-module background rate estimate over the sliding background window.
//!
//! Sums of counts and squared counts are kept as exact integers, so adding a bin as
//! it enters the window and subtracting it as it leaves never accumulates rounding
//! error, however long the run.
//!
//! Two families of moments are tracked. Base-bin moments drive module qualification
//! (rate and Fano factor). For every signal window of `k` base bins, the moments of
//! all `k`-bin sums lying inside the background window give that window's expected
//! hits and variance directly, so correlated noise between neighbouring bins is
//! reflected in the variance rather than assumed away.

use crate::buffer::BufferLayout;
use crate::config::GRID_MS;
use crate::error::{SnError, SnResult};
use serde::Serialize;

/// Background mean and spread of one module, per base bin.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BackgroundStatistics {
    /// Module column
    pub module_index: usize,
    /// Mean rate in Hz
    pub mean_rate: f64,
    /// Mean hits per base bin
    pub mean: f64,
    /// Variance of hits per base bin
    pub variance: f64,
}

impl BackgroundStatistics {
    /// Variance over mean; 0 for a silent module.
    pub fn fano(&self) -> f64 {
        if self.mean > 0.0 {
            self.variance / self.mean
        } else {
            0.0
        }
    }
}

/// Exact sum and sum of squares per module over a set of samples.
#[derive(Debug, Clone)]
struct Moments {
    sum: Vec<u64>,
    sum_sq: Vec<u64>,
    n: u64,
}

impl Moments {
    fn new(modules: usize) -> Self {
        Self {
            sum: vec![0; modules],
            sum_sq: vec![0; modules],
            n: 0,
        }
    }

    fn add(&mut self, values: &[u32]) {
        for ((s, q), &c) in self.sum.iter_mut().zip(self.sum_sq.iter_mut()).zip(values) {
            let c = u64::from(c);
            *s += c;
            *q += c * c;
        }
        self.n += 1;
    }

    fn remove(&mut self, values: &[u32]) {
        for ((s, q), &c) in self.sum.iter_mut().zip(self.sum_sq.iter_mut()).zip(values) {
            let c = u64::from(c);
            *s = s.saturating_sub(c);
            *q = q.saturating_sub(c * c);
        }
        self.n = self.n.saturating_sub(1);
    }

    fn mean(&self, module: usize) -> f64 {
        if self.n == 0 {
            return 0.0;
        }
        self.sum.get(module).map_or(0.0, |&s| s as f64 / self.n as f64)
    }

    /// `(N * sum_sq - sum^2) / N^2` in 128-bit integers; negative means corrupt sums.
    fn variance(&self, module: usize) -> SnResult<f64> {
        if self.n == 0 {
            return Ok(0.0);
        }
        let (Some(&s), Some(&q)) = (self.sum.get(module), self.sum_sq.get(module)) else {
            return Ok(0.0);
        };
        let n = u128::from(self.n);
        let numerator = (n * u128::from(q))
            .checked_sub(u128::from(s) * u128::from(s))
            .ok_or(SnError::NegativeVariance { module })?;
        Ok(numerator as f64 / (n * n) as f64)
    }

    fn clear(&mut self) {
        self.sum.fill(0);
        self.sum_sq.fill(0);
        self.n = 0;
    }
}

/// Incremental sum / sum-of-squares estimator.
#[derive(Debug, Clone)]
pub struct BackgroundEstimator {
    base: Moments,
    windows: Vec<Moments>,
    block_bins: Vec<usize>,
    bin_seconds: f64,
    generation: u64,
}

impl BackgroundEstimator {
    /// Estimator for `modules` columns with base bins `bin_ms` wide.
    ///
    /// Tracks base-bin moments only; see [`BackgroundEstimator::with_block_widths`].
    pub fn new(modules: usize, bin_ms: u64) -> Self {
        Self {
            base: Moments::new(modules),
            windows: Vec::new(),
            block_bins: Vec::new(),
            bin_seconds: bin_ms as f64 / 1000.0,
            generation: 0,
        }
    }

    /// Estimator matching a stream buffer layout, with one block width per signal window.
    pub fn for_layout(layout: &BufferLayout) -> Self {
        let bin_ms = layout.ticks_per_base as u64 * GRID_MS;
        Self::new(layout.modules, bin_ms).with_block_widths(&layout.window_bins)
    }

    /// Also track moments of `k`-bin sums for each entry of `block_bins`.
    pub fn with_block_widths(mut self, block_bins: &[usize]) -> Self {
        let modules = self.base.sum.len();
        self.windows = block_bins.iter().map(|_| Moments::new(modules)).collect();
        self.block_bins = block_bins.to_vec();
        self
    }

    /// Base bins per block, by window index.
    pub fn block_bins(&self) -> &[usize] {
        &self.block_bins
    }

    /// Base bins currently in the window.
    pub fn bins(&self) -> u64 {
        self.base.n
    }

    /// Changes whenever the window content changes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Module count.
    pub fn modules(&self) -> usize {
        self.base.sum.len()
    }

    /// A base bin enters the window.
    pub fn add(&mut self, bin: &[u32]) {
        self.base.add(bin);
        self.generation += 1;
    }

    /// A base bin leaves the window. It must be a bin previously added.
    pub fn remove(&mut self, bin: &[u32]) {
        self.base.remove(bin);
        self.generation += 1;
    }

    /// A `k`-bin sum for window `window` enters the background.
    pub fn add_block(&mut self, window: usize, block: &[u32]) {
        if let Some(m) = self.windows.get_mut(window) {
            m.add(block);
            self.generation += 1;
        }
    }

    /// A `k`-bin sum for window `window` leaves the background.
    pub fn remove_block(&mut self, window: usize, block: &[u32]) {
        if let Some(m) = self.windows.get_mut(window) {
            m.remove(block);
            self.generation += 1;
        }
    }

    /// Blocks currently held for window `window`.
    pub fn blocks(&self, window: usize) -> u64 {
        self.windows.get(window).map_or(0, |m| m.n)
    }

    /// Mean hits per base bin.
    pub fn mean(&self, module: usize) -> f64 {
        self.base.mean(module)
    }

    /// Population variance of hits per base bin.
    ///
    /// A negative variance means the sums are corrupt and is reported as fatal.
    pub fn variance(&self, module: usize) -> SnResult<f64> {
        self.base.variance(module)
    }

    /// Expected hits in window `window`, or `None` if that width is not tracked.
    pub fn window_mean(&self, window: usize, module: usize) -> Option<f64> {
        self.windows.get(window).map(|m| m.mean(module))
    }

    /// Variance of hits in window `window`, or `None` if that width is not tracked.
    pub fn window_variance(&self, window: usize, module: usize) -> SnResult<Option<f64>> {
        self.windows
            .get(window)
            .map(|m| m.variance(module))
            .transpose()
    }

    /// Full statistics for one module.
    pub fn stats(&self, module: usize) -> SnResult<BackgroundStatistics> {
        let mean = self.mean(module);
        Ok(BackgroundStatistics {
            module_index: module,
            mean_rate: mean / self.bin_seconds,
            mean,
            variance: self.variance(module)?,
        })
    }

    /// Drop all sums.
    pub fn clear(&mut self) {
        self.base.clear();
        self.windows.iter_mut().for_each(Moments::clear);
        self.generation += 1;
    }
}
