//! End-to-end burst scenario on a synthetic three-module stream.
//!
//! Flat 800 Hz background for 10 minutes, then every module's rate steps up by 185 Hz.
//! With a 0.5 s window that is an expected excess of 92.5 hits per module against a
//! Poisson spread of 20, i.e. xi = 92.5 / sqrt(400 / 3) ~ 8.

use sndaq::config::SnConfig;
use sndaq::payload::{PayloadReader, PayloadWriter, UTIME_PER_SECOND};
use sndaq::publish::AlertPublisher;
use sndaq::simulate::{synthetic_detector, RateStep, SyntheticConfig, SyntheticStream};
use sndaq::{Pipeline, TickOutput, TriggerEvent};
use std::sync::Arc;
use std::time::Duration;

const STEP_SECONDS: u64 = 600;
const STEP_TICK: u64 = STEP_SECONDS * 500;
const WINDOW_TICKS: u64 = 250;

fn scenario_config() -> SnConfig {
    let mut config = SnConfig::default();
    // The background must be full well before the step
    config.analysis.background_window = Duration::from_secs(300);
    // Short hold so a background fluctuation cannot hold the trigger open into the step
    config.trigger.hold = Duration::from_secs(2);
    config
}

fn stream(end_seconds: u64) -> SyntheticStream {
    SyntheticStream::new(SyntheticConfig {
        end_time: Some(end_seconds * UTIME_PER_SECOND),
        step: Some(RateStep {
            at: STEP_SECONDS * UTIME_PER_SECOND,
            extra_hz: 185.0,
        }),
        seed: 20_240_611,
        ..SyntheticConfig::flat(3, 800.0, 0.0)
    })
}

#[derive(Default)]
struct Observed {
    events: Vec<TriggerEvent>,
    peak_half_second: f64,
    results_before_step: u64,
}

impl Observed {
    fn absorb(&mut self, outputs: Vec<TickOutput>) {
        for output in outputs {
            if output.grid_index < STEP_TICK {
                self.results_before_step += output.results.len() as u64;
            } else if output.grid_index < STEP_TICK + 10 * WINDOW_TICKS {
                for r in &output.results {
                    if r.window_width == Duration::from_millis(500) {
                        self.peak_half_second = self.peak_half_second.max(r.xi_corrected);
                    }
                }
            }
            self.events.extend(output.events);
        }
    }
}

#[test]
fn step_triggers_half_second_window() {
    let detector = Arc::new(synthetic_detector(&[1, 2, 3]).unwrap());
    let publisher = Arc::new(AlertPublisher::new(64));
    let mut pipeline = Pipeline::new(scenario_config(), detector)
        .unwrap()
        .with_publisher(publisher.clone());

    let mut observed = Observed::default();
    for record in stream(STEP_SECONDS + 20) {
        observed.absorb(pipeline.process_record(&record).unwrap());
    }
    observed.absorb(pipeline.finish().unwrap());

    // Statistics were online before the step
    assert!(observed.results_before_step > 0);

    let prompt: Vec<&TriggerEvent> = observed
        .events
        .iter()
        .filter(|e| (STEP_TICK..=STEP_TICK + WINDOW_TICKS).contains(&e.grid_index))
        .collect();
    assert!(
        prompt
            .iter()
            .any(|e| e.window_width == Duration::from_millis(500)),
        "no prompt 0.5 s trigger in {:?}",
        observed.events
    );
    assert!(prompt.iter().all(|e| e.xi_corrected >= 4.0));
    assert!(
        (5.0..=12.0).contains(&observed.peak_half_second),
        "peak xi' = {}",
        observed.peak_half_second
    );

    let counters = pipeline.counters();
    assert_eq!(counters.unknown_module, 0);
    assert_eq!(counters.clock_discontinuity, 0);
    assert_eq!(counters.late_samples, 0);
    assert_eq!(counters.triggers, observed.events.len() as u64);

    // Every event became an alert; the stream ended inside the post-trigger context
    assert_eq!(publisher.published(), observed.events.len() as u64);
    let alert = publisher.try_pop().unwrap();
    assert_eq!(alert.lightcurve.start_offset_ticks, -15_000);
    assert!(alert.lightcurve.counts.len() > 15_001);
}

#[test]
fn archive_round_trip_feeds_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sn_1_000000_0_0.dat");
    let mut writer = PayloadWriter::create(&path).unwrap();
    let mut direct = Vec::new();
    for record in SyntheticStream::new(SyntheticConfig::flat(3, 800.0, 30.0)) {
        writer.append(&record).unwrap();
        direct.push(record);
    }
    writer.flush().unwrap();
    drop(writer);

    let detector = Arc::new(synthetic_detector(&[1, 2, 3]).unwrap());
    let mut from_file = Pipeline::new(SnConfig::default(), detector.clone()).unwrap();
    let mut reader = PayloadReader::open(&path).unwrap();
    tokio_test::block_on(from_file.replay(&mut reader)).unwrap();
    from_file.finish().unwrap();

    let mut from_memory = Pipeline::new(SnConfig::default(), detector).unwrap();
    for record in &direct {
        from_memory.process_record(record).unwrap();
    }
    from_memory.finish().unwrap();

    assert_eq!(from_file.counters(), from_memory.counters());
    assert_eq!(from_file.counters().records, direct.len() as u64);
}
