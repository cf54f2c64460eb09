//! Slow bias correction of the test statistic.
//!
//! The atmospheric muon flux drifts with the seasons and leaks into the module rates,
//! biasing `xi` over hours. One model per window width tracks an exponentially
//! weighted mean of `xi` and, when muon rate samples are supplied, its regression on
//! the muon rate. The corrected statistic is
//!
//! ```text
//! xi' = xi - w * (mean_xi + beta * (r_mu - mean_mu)),   w = min(1, n / warmup)
//! ```
//!
//! Every update moves the model by a small step, so `xi'` has no jump at an update.
//! Samples at or above the learning limit (the lowest trigger tier) are not learned
//! from, so a burst does not correct itself away.

use crate::config::{SeasonalConfig, GRID_MS};
use crate::significance::AnalysisWindowResult;
use std::time::Duration;

#[derive(Debug, Default, Clone, Copy)]
struct Model {
    samples: u64,
    mean_xi: f64,
    mean_mu: f64,
    var_mu: f64,
    cov: f64,
}

impl Model {
    fn bias(&self, muon: Option<f64>) -> f64 {
        let slope = match muon {
            Some(r) if self.var_mu > 0.0 => self.cov / self.var_mu * (r - self.mean_mu),
            _ => 0.0,
        };
        self.mean_xi + slope
    }

    fn learn(&mut self, xi: f64, muon: Option<f64>, floor: f64) {
        let alpha = (1.0 / (self.samples + 1) as f64).max(floor);
        let dx = xi - self.mean_xi;
        self.mean_xi += alpha * dx;
        if let Some(r) = muon {
            let dm = r - self.mean_mu;
            if self.samples == 0 {
                self.mean_mu = r;
            } else {
                self.mean_mu += alpha * dm;
                self.var_mu = (1.0 - alpha) * (self.var_mu + alpha * dm * dm);
                self.cov = (1.0 - alpha) * (self.cov + alpha * dx * dm);
            }
        }
        self.samples += 1;
    }
}

/// Per-width seasonal bias model.
#[derive(Debug, Clone)]
pub struct SeasonalCorrector {
    enabled: bool,
    widths: Vec<Duration>,
    models: Vec<Model>,
    alpha_floor: f64,
    warmup: f64,
    learn_limit: f64,
    muon_rate: Option<f64>,
}

impl SeasonalCorrector {
    /// Corrector for the given window widths. `learn_limit` is the lowest trigger tier.
    pub fn new(config: &SeasonalConfig, widths: &[Duration], learn_limit: f64) -> Self {
        let tau = config.tau.as_secs_f64();
        Self {
            enabled: config.enabled,
            widths: widths.to_vec(),
            models: vec![Model::default(); widths.len()],
            alpha_floor: if tau > 0.0 {
                GRID_MS as f64 / 1000.0 / tau
            } else {
                1.0
            },
            warmup: config.warmup_samples.max(1) as f64,
            learn_limit,
            muon_rate: None,
        }
    }

    /// Latest atmospheric muon rate sample.
    pub fn observe_muon_rate(&mut self, rate_hz: f64) {
        if rate_hz.is_finite() {
            self.muon_rate = Some(rate_hz);
        }
    }

    /// Samples learned by the model of window `index`.
    pub fn samples(&self, index: usize) -> u64 {
        self.models.get(index).map_or(0, |m| m.samples)
    }

    /// Corrected statistic for window `index`, then learn from `xi` when quiet.
    pub fn correct(&mut self, index: usize, xi: f64) -> f64 {
        if !self.enabled {
            return xi;
        }
        let Some(model) = self.models.get_mut(index) else {
            return xi;
        };
        let weight = (model.samples as f64 / self.warmup).min(1.0);
        let corrected = xi - weight * model.bias(self.muon_rate);
        if xi.is_finite() && xi.abs() < self.learn_limit {
            model.learn(xi, self.muon_rate, self.alpha_floor);
        }
        corrected
    }

    /// Fill `xi_corrected` for one tick's results.
    pub fn apply(&mut self, results: &mut [AnalysisWindowResult]) {
        for result in results {
            let index = self.widths.iter().position(|w| *w == result.window_width);
            result.xi_corrected = match index {
                Some(i) => self.correct(i, result.xi),
                None => result.xi,
            };
        }
    }

    /// Drop all learned state.
    pub fn reset(&mut self) {
        self.models.fill(Model::default());
    }
}
