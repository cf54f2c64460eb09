//! Synthetic scaler streams for tests, benchmarks and dry runs.
//!
//! Every module reports one record per period, each slot carrying Poisson hits at
//! the configured rate. An optional step raises all rates from a given time on,
//! standing in for a burst. The generator is seeded so runs are reproducible.

use crate::detector::{DetectorModel, ModuleRecord, ModuleType};
use crate::error::SnResult;
use crate::payload::{TelemetryRecord, MAX_48BIT, SCALER_UDT, UTIME_PER_SECOND};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Module clock ticks are 25 ns, i.e. 250 record-time units.
const CLOCK_UDT: u64 = 250;

/// Rate increase applied to every module from `at` on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateStep {
    /// Record time of the step
    pub at: u64,
    /// Added rate in Hz
    pub extra_hz: f64,
}

/// Synthetic stream parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct SyntheticConfig {
    /// Reporting modules
    pub module_ids: Vec<u64>,
    /// Record time of the first record
    pub start_time: u64,
    /// Stream ends before this record time (unbounded if `None`)
    pub end_time: Option<u64>,
    /// Scaler slots per record
    pub slots_per_record: usize,
    /// Background rate per module in Hz
    pub rate_hz: f64,
    /// Optional burst
    pub step: Option<RateStep>,
    /// RNG seed
    pub seed: u64,
}

impl SyntheticConfig {
    /// Flat stream for `modules` modules with ids 1..=modules.
    pub fn flat(modules: usize, rate_hz: f64, duration_secs: f64) -> Self {
        Self {
            module_ids: (1..=modules as u64).collect(),
            start_time: 0,
            end_time: Some((duration_secs * UTIME_PER_SECOND as f64) as u64),
            slots_per_record: 250,
            rate_hz,
            step: None,
            seed: 0x5eed,
        }
    }
}

/// Iterator over synthetic records in time order.
#[derive(Debug)]
pub struct SyntheticStream {
    config: SyntheticConfig,
    rng: ChaCha8Rng,
    period_time: u64,
    next_module: usize,
}

impl SyntheticStream {
    #[allow(missing_docs)]
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(config.seed),
            period_time: config.start_time,
            next_module: 0,
            config,
        }
    }

    fn slot_rate(&self, slot_time: u64) -> f64 {
        match self.config.step {
            Some(step) if slot_time >= step.at => self.config.rate_hz + step.extra_hz,
            _ => self.config.rate_hz,
        }
    }

    fn poisson(&mut self, mean: f64) -> u8 {
        // Knuth's method; means here are a few hits per slot
        let limit = (-mean).exp();
        let mut k = 0u32;
        let mut p: f64 = self.rng.gen();
        while p > limit && k < u32::from(u8::MAX) {
            k += 1;
            p *= self.rng.gen::<f64>();
        }
        k as u8
    }
}

impl Iterator for SyntheticStream {
    type Item = TelemetryRecord;

    fn next(&mut self) -> Option<TelemetryRecord> {
        if self.config.module_ids.is_empty() || self.config.slots_per_record == 0 {
            return None;
        }
        if self.config.end_time.is_some_and(|end| self.period_time >= end) {
            return None;
        }
        let module_id = self.config.module_ids[self.next_module];
        let record_time = self.period_time;
        let slot_seconds = SCALER_UDT as f64 / UTIME_PER_SECOND as f64;
        let scaler_counts = (0..self.config.slots_per_record as u64)
            .map(|k| {
                let mean = self.slot_rate(record_time + k * SCALER_UDT) * slot_seconds;
                self.poisson(mean)
            })
            .collect();

        self.next_module += 1;
        if self.next_module == self.config.module_ids.len() {
            self.next_module = 0;
            self.period_time += self.config.slots_per_record as u64 * SCALER_UDT;
        }
        Some(TelemetryRecord {
            module_id,
            record_time,
            module_clock: ((record_time - self.config.start_time) / CLOCK_UDT) & MAX_48BIT,
            scaler_counts,
        })
    }
}

/// Detector table of in-ice modules on string 1 with the given ids.
pub fn synthetic_detector(module_ids: &[u64]) -> SnResult<DetectorModel> {
    let modules = module_ids
        .iter()
        .enumerate()
        .map(|(i, &module_id)| ModuleRecord {
            module_id,
            string: 1,
            position: (i + 1) as u16,
            x: 0.0,
            y: 0.0,
            z: -1450.0 - 17.0 * i as f64,
            module_type: ModuleType::InIce,
            effective_volume: 1.0,
            relative_efficiency: 1.0,
        })
        .collect();
    DetectorModel::from_records(modules)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_records_are_contiguous() {
        let config = SyntheticConfig {
            slots_per_record: 10,
            ..SyntheticConfig::flat(2, 800.0, 1.0)
        };
        let records: Vec<_> = SyntheticStream::new(config).take(6).collect();
        assert_eq!(records[0].module_id, 1);
        assert_eq!(records[1].module_id, 2);
        assert_eq!(records[0].record_time, records[1].record_time);
        assert_eq!(records[2].record_time, records[0].end_time().unwrap());
        assert_eq!(records[4].module_clock, 2 * 10 * SCALER_UDT / CLOCK_UDT);
    }

    #[test]
    fn test_mean_rate() {
        let config = SyntheticConfig::flat(1, 800.0, 20.0);
        let hits: u64 = SyntheticStream::new(config).map(|r| r.hit_sum()).sum();
        // 20 s at 800 Hz = 16000 expected, sigma ~126
        assert!((15_000..17_000).contains(&hits), "hits = {hits}");
    }

    #[test]
    fn test_seeded_streams_repeat() {
        let a: Vec<_> = SyntheticStream::new(SyntheticConfig::flat(3, 500.0, 1.0)).collect();
        let b: Vec<_> = SyntheticStream::new(SyntheticConfig::flat(3, 500.0, 1.0)).collect();
        assert_eq!(a, b);
    }

    #[test]
    fn test_detector_for_stream() {
        let detector = synthetic_detector(&[3, 1, 2]).unwrap();
        assert_eq!(detector.len(), 3);
        assert_eq!(detector.index_of(1), Some(0));
        assert!(detector.is_valid(3));
    }
}
