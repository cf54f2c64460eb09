//! Array-wide maximum-likelihood rate excess and test statistic.
//!
//! For a window of `k` base bins, module `i` contributes its observed hits `R_i`,
//! relative efficiency `e_i`, and the mean `<R_i>` and variance `s_i^2` of the
//! `k`-bin sums in its background window:
//!
//! ```text
//! var_dmu = 1 / sum(e_i^2 / s_i^2)
//! dmu     = var_dmu * sum(e_i * (R_i - <R_i>) / s_i^2)
//! xi      = dmu / sqrt(var_dmu)
//! chi2    = sum((R_i - <R_i> - e_i * dmu)^2 / s_i^2)
//! ```
//!
//! Each sum is a single pass over the module columns; chi2 is expanded so it needs no
//! second pass.

use crate::background::BackgroundEstimator;
use crate::buffer::StreamBuffer;
use crate::config::AnalysisConfig;
use crate::error::SnResult;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Test statistic for one window width at one tick.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AnalysisWindowResult {
    /// Signal window width
    #[serde(with = "humantime_serde")]
    pub window_width: Duration,
    /// Tick closing the window
    pub grid_index: u64,
    /// Rate excess in hits per window per unit efficiency
    pub delta_mu: f64,
    /// Uncertainty of `delta_mu`
    pub sigma_delta_mu: f64,
    /// Significance of the excess
    pub xi: f64,
    /// Significance after seasonal correction
    pub xi_corrected: f64,
    /// Goodness of fit of the uniform-excess hypothesis
    pub chi2: f64,
    /// Modules included in the sums
    pub active_modules: usize,
}

/// Closed-form likelihood estimate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Estimate {
    #[allow(missing_docs)]
    pub delta_mu: f64,
    #[allow(missing_docs)]
    pub sigma_delta_mu: f64,
    #[allow(missing_docs)]
    pub xi: f64,
    #[allow(missing_docs)]
    pub chi2: f64,
    /// Terms that entered the sums
    pub active: usize,
}

/// One module's contribution to a window.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModuleTerm {
    /// Hits in the window
    pub observed: f64,
    /// Expected hits from the background
    pub expected: f64,
    /// Expected variance of the hits
    pub variance: f64,
    /// Relative efficiency
    pub efficiency: f64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Sums {
    weighted_excess: f64,
    weight: f64,
    excess_sq: f64,
    active: usize,
}

impl Sums {
    fn add(&mut self, term: ModuleTerm) {
        if term.variance <= 0.0 || !term.variance.is_finite() {
            return;
        }
        let d = term.observed - term.expected;
        self.weighted_excess += term.efficiency * d / term.variance;
        self.weight += term.efficiency * term.efficiency / term.variance;
        self.excess_sq += d * d / term.variance;
        self.active += 1;
    }

    fn finish(self) -> Option<Estimate> {
        if self.active == 0 || self.weight <= 0.0 {
            return None;
        }
        let var_dmu = 1.0 / self.weight;
        let delta_mu = self.weighted_excess * var_dmu;
        let sigma_delta_mu = var_dmu.sqrt();
        // sum((d - e*dmu)^2 / s^2) = sum(d^2/s^2) - A^2/B
        let chi2 = (self.excess_sq - self.weighted_excess * delta_mu).max(0.0);
        Some(Estimate {
            delta_mu,
            sigma_delta_mu,
            xi: delta_mu / sigma_delta_mu,
            chi2,
            active: self.active,
        })
    }
}

/// Evaluate the estimator over a set of module terms.
///
/// Terms with zero or non-finite variance are excluded. Returns `None` when nothing
/// remains.
pub fn likelihood<I>(terms: I) -> Option<Estimate>
where
    I: IntoIterator<Item = ModuleTerm>,
{
    let mut sums = Sums::default();
    for term in terms {
        sums.add(term);
    }
    sums.finish()
}

#[derive(Debug, Clone)]
struct WindowSpec {
    width: Duration,
    /// Expected hits per module
    means: Vec<f64>,
    /// Variance of hits per module; NaN when the background does not track this width
    variances: Vec<f64>,
}

/// Per-tick evaluation of every configured window width.
#[derive(Debug)]
pub struct SignificanceEngine {
    windows: Vec<WindowSpec>,
    efficiencies: Vec<f64>,
    participating: Vec<bool>,
    qualified: Vec<bool>,
    cached_generation: Option<u64>,
    min_rate_hz: f64,
    max_rate_hz: f64,
    min_fano: f64,
    max_fano: f64,
    min_active_modules: usize,
}

impl SignificanceEngine {
    /// Engine for modules with the given efficiencies and participation flags.
    pub fn new(analysis: &AnalysisConfig, efficiencies: Vec<f64>, participating: Vec<bool>) -> Self {
        let modules = efficiencies.len();
        let windows = analysis
            .window_widths_ms
            .iter()
            .map(|&ms| WindowSpec {
                width: Duration::from_millis(ms),
                means: vec![0.0; modules],
                variances: vec![f64::NAN; modules],
            })
            .collect();
        Self {
            windows,
            efficiencies,
            participating,
            qualified: vec![false; modules],
            cached_generation: None,
            min_rate_hz: analysis.min_rate_hz,
            max_rate_hz: analysis.max_rate_hz,
            min_fano: analysis.min_fano,
            max_fano: analysis.max_fano,
            min_active_modules: analysis.min_active_modules.max(1),
        }
    }

    /// Modules currently passing qualification.
    pub fn qualified_modules(&self) -> usize {
        self.qualified.iter().filter(|&&q| q).count()
    }

    /// Whether module `index` passes qualification.
    pub fn is_qualified(&self, index: usize) -> bool {
        self.qualified.get(index).copied().unwrap_or(false)
    }

    /// Recompute background-derived values when the background window has moved.
    fn refresh(&mut self, background: &BackgroundEstimator) -> SnResult<()> {
        if self.cached_generation == Some(background.generation()) {
            return Ok(());
        }
        let mut changed = 0usize;
        for i in 0..self.efficiencies.len() {
            let stats = background.stats(i)?;
            let fano = stats.fano();
            let qualified = self.participating.get(i).copied().unwrap_or(false)
                && stats.variance > 0.0
                && (self.min_rate_hz..=self.max_rate_hz).contains(&stats.mean_rate)
                && (self.min_fano..=self.max_fano).contains(&fano);
            if qualified != self.qualified[i] {
                changed += 1;
                debug!(
                    module_index = i,
                    qualified,
                    rate_hz = stats.mean_rate,
                    fano,
                    "Module qualification changed"
                );
            }
            self.qualified[i] = qualified;
            for (w, spec) in self.windows.iter_mut().enumerate() {
                spec.means[i] = background.window_mean(w, i).unwrap_or(0.0);
                spec.variances[i] = background.window_variance(w, i)?.unwrap_or(f64::NAN);
            }
        }
        if changed > 0 {
            debug!(
                changed,
                qualified = self.qualified_modules(),
                "Qualified module set updated"
            );
        }
        self.cached_generation = Some(background.generation());
        Ok(())
    }

    fn window_estimate(&self, buffer: &StreamBuffer, index: usize) -> Option<Estimate> {
        let spec = &self.windows[index];
        if !buffer.window_filled(index) {
            return None;
        }
        let counts = buffer.window_counts(index);
        let mut sums = Sums::default();
        for (i, &observed) in counts.iter().enumerate() {
            if !self.qualified[i] {
                continue;
            }
            sums.add(ModuleTerm {
                observed: f64::from(observed),
                expected: spec.means[i],
                variance: spec.variances[i],
                efficiency: self.efficiencies[i],
            });
        }
        sums.finish().filter(|e| e.active >= self.min_active_modules)
    }

    /// Evaluate every window width for the tick just committed.
    ///
    /// Nothing is reported until the background window is full. `xi_corrected` is
    /// initialized to `xi`.
    pub fn evaluate(
        &mut self,
        buffer: &StreamBuffer,
        background: &BackgroundEstimator,
        grid_index: u64,
    ) -> SnResult<Vec<AnalysisWindowResult>> {
        if !buffer.background_full() {
            return Ok(Vec::new());
        }
        self.refresh(background)?;

        let this = &*self;
        let result = |index: usize| {
            this.window_estimate(buffer, index).map(|e| AnalysisWindowResult {
                window_width: this.windows[index].width,
                grid_index,
                delta_mu: e.delta_mu,
                sigma_delta_mu: e.sigma_delta_mu,
                xi: e.xi,
                xi_corrected: e.xi,
                chi2: e.chi2,
                active_modules: e.active,
            })
        };

        #[cfg(feature = "parallel")]
        let results = {
            use rayon::prelude::*;
            (0..this.windows.len())
                .into_par_iter()
                .filter_map(result)
                .collect()
        };
        #[cfg(not(feature = "parallel"))]
        let results = (0..this.windows.len()).filter_map(result).collect();

        Ok(results)
    }

    /// Forget cached background values (stream restart).
    pub fn reset(&mut self) {
        self.cached_generation = None;
        self.qualified.fill(false);
    }
}
