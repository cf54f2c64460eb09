//! Trigger hysteresis over sustained and flickering excursions.

use sndaq::config::TriggerConfig;
use sndaq::significance::AnalysisWindowResult;
use sndaq::trigger::{TriggerEvaluator, TriggerEvent};
use std::time::Duration;

const WIDTHS_MS: [u64; 4] = [500, 1500, 4000, 10000];

fn results(grid_index: u64, xi: [f64; 4]) -> Vec<AnalysisWindowResult> {
    WIDTHS_MS
        .iter()
        .zip(xi)
        .map(|(&ms, xi)| AnalysisWindowResult {
            window_width: Duration::from_millis(ms),
            grid_index,
            delta_mu: xi,
            sigma_delta_mu: 1.0,
            xi,
            xi_corrected: xi,
            chi2: 0.0,
            active_modules: 5000,
        })
        .collect()
}

fn run(trigger: &mut TriggerEvaluator, ticks: std::ops::Range<u64>, xi: impl Fn(u64) -> [f64; 4]) -> Vec<TriggerEvent> {
    ticks
        .flat_map(|t| trigger.evaluate(t, &results(t, xi(t))).events)
        .collect()
}

#[test]
fn sustained_excursion_fires_each_tier_once() {
    let mut trigger = TriggerEvaluator::new(&TriggerConfig::default());
    // Rises over 2 s to 11 in the shortest window, then plateaus for a minute
    let events = run(&mut trigger, 0..30_000, |t| {
        let peak = (t as f64 / 1000.0 * 11.0).min(11.0);
        [peak, peak * 0.8, peak * 0.5, peak * 0.3]
    });
    let tiers: Vec<&str> = events.iter().map(|e| e.tier.as_str()).collect();
    assert_eq!(tiers, vec!["basic", "sn-wg", "silver", "snews", "gold"]);
    assert!(events.iter().all(|e| e.candidate_id == 1));
    assert!(events.iter().all(|e| e.window_width == Duration::from_millis(500)));
    let levels: Vec<usize> = events.iter().map(|e| e.tier_level).collect();
    assert_eq!(levels, vec![1, 2, 3, 4, 5]);
}

#[test]
fn flicker_within_hold_is_one_excursion() {
    let mut trigger = TriggerEvaluator::new(&TriggerConfig::default());
    // Alternates around the lowest tier every 100 ticks for 20 s
    let events = run(&mut trigger, 0..10_000, |t| {
        let xi = if (t / 100) % 2 == 0 { 4.2 } else { 3.8 };
        [xi, 0.0, 0.0, 0.0]
    });
    assert_eq!(events.len(), 1);
    assert!(trigger.in_excursion());
}

#[test]
fn new_candidate_after_hold() {
    let config = TriggerConfig {
        hold: Duration::from_secs(1),
        ..Default::default()
    };
    let mut trigger = TriggerEvaluator::new(&config);
    let burst = |t: u64| if t < 100 || (1000..1100).contains(&t) { [5.0, 0.0, 0.0, 0.0] } else { [0.0; 4] };
    let mut resolved = Vec::new();
    let mut events = Vec::new();
    for t in 0..2000 {
        let step = trigger.evaluate(t, &results(t, burst(t)));
        events.extend(step.events);
        resolved.extend(step.resolved);
    }
    let ids: Vec<u64> = events.iter().map(|e| e.candidate_id).collect();
    assert_eq!(ids, vec![1, 2]);
    // 500 quiet ticks (1 s) after the last loud tick
    assert_eq!(resolved.len(), 2);
    assert_eq!(resolved[0].resolved_at, 100 + 500 - 1);
    assert_eq!(resolved[1].candidate_id, 2);
}
