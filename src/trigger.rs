//! Threshold ladder with per-excursion hysteresis.
//!
//! An excursion opens when any window's corrected statistic reaches the lowest tier.
//! While it lasts, each tier is reported once, the first time any window reaches it.
//! The excursion resolves after every window has stayed below the lowest tier for the
//! hold period; only then can a new candidate open.

use crate::config::{duration_to_ticks, TierConfig, TriggerConfig};
use crate::payload::{utime_to_datetime, GRID_UDT};
use crate::significance::AnalysisWindowResult;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::info;

/// One tier crossing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerEvent {
    /// Excursion this crossing belongs to
    pub candidate_id: u64,
    /// Tier label
    pub tier: String,
    /// 1-based position of the tier in the ladder
    pub tier_level: usize,
    /// Window that reached the tier
    #[serde(with = "humantime_serde")]
    pub window_width: Duration,
    #[allow(missing_docs)]
    pub xi: f64,
    #[allow(missing_docs)]
    pub xi_corrected: f64,
    /// Tick at which the tier was reached
    pub grid_index: u64,
    /// Record time at the end of that tick
    pub trigger_utime: u64,
    /// UTC time, when the epoch year is known
    pub trigger_time: Option<DateTime<Utc>>,
}

/// Summary of a finished excursion.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Resolution {
    #[allow(missing_docs)]
    pub candidate_id: u64,
    /// Tick that opened the excursion
    pub opened_at: u64,
    /// Tick at which the hold period completed
    pub resolved_at: u64,
    /// Highest corrected statistic seen
    pub peak_xi_corrected: f64,
    /// Window that produced the peak
    #[serde(with = "humantime_serde")]
    pub peak_window: Duration,
    /// Highest tier reached (1-based)
    pub tiers_reached: usize,
}

/// Output of one tick's evaluation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerStep {
    /// Tier crossings, lowest tier first
    pub events: Vec<TriggerEvent>,
    /// Set when the current excursion resolved on this tick
    pub resolved: Option<Resolution>,
}

#[derive(Debug, Clone)]
struct Excursion {
    candidate_id: u64,
    opened_at: u64,
    reached: usize,
    peak: f64,
    peak_window: Duration,
    quiet_since: Option<u64>,
}

/// Trigger state machine.
#[derive(Debug)]
pub struct TriggerEvaluator {
    tiers: Vec<TierConfig>,
    hold_ticks: u64,
    origin: u64,
    epoch_year: Option<i32>,
    next_candidate: u64,
    active: Option<Excursion>,
}

impl TriggerEvaluator {
    /// Evaluator for a validated ladder.
    pub fn new(config: &TriggerConfig) -> Self {
        Self {
            tiers: config.ladder.clone(),
            hold_ticks: duration_to_ticks(config.hold).max(1),
            origin: 0,
            epoch_year: None,
            next_candidate: 1,
            active: None,
        }
    }

    /// Stamp events with record times relative to `origin`.
    pub fn with_time_base(mut self, origin: u64, epoch_year: Option<i32>) -> Self {
        self.set_time_base(origin, epoch_year);
        self
    }

    /// Update the grid origin and epoch used to stamp events.
    pub fn set_time_base(&mut self, origin: u64, epoch_year: Option<i32>) {
        self.origin = origin;
        self.epoch_year = epoch_year;
    }

    /// Lowest threshold in the ladder.
    pub fn lowest_threshold(&self) -> f64 {
        self.tiers.first().map_or(f64::INFINITY, |t| t.threshold)
    }

    /// Whether an excursion is in progress.
    pub fn in_excursion(&self) -> bool {
        self.active.is_some()
    }

    /// Tiers whose threshold `xi` reaches.
    fn level(&self, xi: f64) -> usize {
        self.tiers.iter().take_while(|t| xi >= t.threshold).count()
    }

    /// Advance by one tick. An empty `results` counts as quiet.
    pub fn evaluate(&mut self, grid_index: u64, results: &[AnalysisWindowResult]) -> TriggerStep {
        let mut step = TriggerStep::default();
        let loudest = results
            .iter()
            .filter(|r| r.xi_corrected.is_finite())
            .max_by(|a, b| a.xi_corrected.total_cmp(&b.xi_corrected));
        let level = loudest.map_or(0, |r| self.level(r.xi_corrected));

        if self.active.is_none() && level > 0 {
            let candidate_id = self.next_candidate;
            self.next_candidate += 1;
            info!(candidate_id, grid_index, "Excursion opened");
            self.active = Some(Excursion {
                candidate_id,
                opened_at: grid_index,
                reached: 0,
                peak: f64::NEG_INFINITY,
                peak_window: Duration::ZERO,
                quiet_since: None,
            });
        }

        let Some(mut excursion) = self.active.take() else {
            return step;
        };

        if let Some(loudest) = loudest {
            if loudest.xi_corrected > excursion.peak {
                excursion.peak = loudest.xi_corrected;
                excursion.peak_window = loudest.window_width;
            }
        }

        for tier_index in excursion.reached..level {
            let threshold = self.tiers[tier_index].threshold;
            // Among windows at this tier, report the loudest
            let Some(window) = results
                .iter()
                .filter(|r| r.xi_corrected >= threshold)
                .max_by(|a, b| a.xi_corrected.total_cmp(&b.xi_corrected))
            else {
                continue;
            };
            let event = self.event(&excursion, tier_index, window);
            info!(
                candidate_id = event.candidate_id,
                tier = %event.tier,
                window_ms = event.window_width.as_millis() as u64,
                xi = event.xi,
                xi_corrected = event.xi_corrected,
                grid_index,
                "Trigger"
            );
            step.events.push(event);
        }
        excursion.reached = excursion.reached.max(level);

        if level == 0 {
            let since = *excursion.quiet_since.get_or_insert(grid_index);
            if grid_index + 1 - since >= self.hold_ticks {
                let resolution = Resolution {
                    candidate_id: excursion.candidate_id,
                    opened_at: excursion.opened_at,
                    resolved_at: grid_index,
                    peak_xi_corrected: excursion.peak,
                    peak_window: excursion.peak_window,
                    tiers_reached: excursion.reached,
                };
                info!(
                    candidate_id = resolution.candidate_id,
                    peak_xi_corrected = resolution.peak_xi_corrected,
                    tiers_reached = resolution.tiers_reached,
                    duration_ticks = grid_index - excursion.opened_at,
                    "Excursion resolved"
                );
                step.resolved = Some(resolution);
                return step;
            }
        } else {
            excursion.quiet_since = None;
        }
        self.active = Some(excursion);
        step
    }

    fn event(
        &self,
        excursion: &Excursion,
        tier_index: usize,
        window: &AnalysisWindowResult,
    ) -> TriggerEvent {
        let trigger_utime = self.origin + (window.grid_index + 1) * GRID_UDT;
        TriggerEvent {
            candidate_id: excursion.candidate_id,
            tier: self.tiers[tier_index].name.clone(),
            tier_level: tier_index + 1,
            window_width: window.window_width,
            xi: window.xi,
            xi_corrected: window.xi_corrected,
            grid_index: window.grid_index,
            trigger_utime,
            trigger_time: self
                .epoch_year
                .and_then(|year| utime_to_datetime(trigger_utime, year)),
        }
    }

    /// Abandon any excursion (stream restart).
    pub fn reset(&mut self) {
        self.active = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(grid_index: u64, width_ms: u64, xi: f64) -> AnalysisWindowResult {
        AnalysisWindowResult {
            window_width: Duration::from_millis(width_ms),
            grid_index,
            delta_mu: 0.0,
            sigma_delta_mu: 1.0,
            xi,
            xi_corrected: xi,
            chi2: 0.0,
            active_modules: 1,
        }
    }

    fn evaluator(hold_ms: u64) -> TriggerEvaluator {
        TriggerEvaluator::new(&TriggerConfig {
            hold: Duration::from_millis(hold_ms),
            ..Default::default()
        })
    }

    #[test]
    fn test_single_event_per_tier() {
        let mut trig = evaluator(20);
        let mut events = Vec::new();
        for tick in 0..50 {
            events.extend(trig.evaluate(tick, &[result(tick, 500, 7.5)]).events);
        }
        let tiers: Vec<&str> = events.iter().map(|e| e.tier.as_str()).collect();
        assert_eq!(tiers, vec!["basic", "sn-wg"]);
        assert!(events.iter().all(|e| e.candidate_id == 1));
        assert_eq!(events[0].grid_index, 0);
    }

    #[test]
    fn test_loudest_window_reported() {
        let mut trig = evaluator(20);
        let step = trig.evaluate(3, &[result(3, 500, 4.5), result(3, 1500, 5.0)]);
        assert_eq!(step.events.len(), 1);
        assert_eq!(step.events[0].window_width, Duration::from_millis(1500));
        assert_eq!(step.events[0].trigger_utime, 4 * GRID_UDT);
    }

    #[test]
    fn test_resolution_after_hold() {
        // Hold of 10 ms = 5 ticks
        let mut trig = evaluator(10);
        trig.evaluate(0, &[result(0, 500, 9.0)]);
        // Dipping below and back up again within the hold keeps the excursion open
        for tick in 1..4 {
            assert!(trig.evaluate(tick, &[result(tick, 500, 1.0)]).resolved.is_none());
        }
        assert!(trig.evaluate(4, &[result(4, 500, 8.2)]).events.is_empty());
        for tick in 5..9 {
            assert!(trig.evaluate(tick, &[]).resolved.is_none());
        }
        let resolved = trig.evaluate(9, &[]).resolved.unwrap();
        assert_eq!(resolved.candidate_id, 1);
        assert_eq!(resolved.tiers_reached, 3);
        assert!((resolved.peak_xi_corrected - 9.0).abs() < 1e-12);
        assert!(!trig.in_excursion());

        let step = trig.evaluate(10, &[result(10, 500, 4.1)]);
        assert_eq!(step.events.len(), 1);
        assert_eq!(step.events[0].candidate_id, 2);
    }

    #[test]
    fn test_epoch_stamps_utc() {
        let mut trig = evaluator(10).with_time_base(0, Some(2024));
        let step = trig.evaluate(499, &[result(499, 500, 4.0)]);
        let time = step.events[0].trigger_time.unwrap();
        assert_eq!(time.to_rfc3339(), "2024-01-01T00:00:01+00:00");
    }
}
