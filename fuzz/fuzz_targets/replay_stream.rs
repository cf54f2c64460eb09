//! Fuzz target for the streaming reader feeding the pipeline.
//!
//! Tests:
//! - Corrupt archives are skipped or rejected without panicking
//! - Arbitrary record times and module ids never break tick commitment

#![no_main]

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use sndaq::config::SnConfig;
use sndaq::payload::{PayloadReader, TelemetryRecord};
use sndaq::simulate::synthetic_detector;
use sndaq::Pipeline;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Arbitrary)]
struct Input {
    /// Raw archive bytes
    archive: Vec<u8>,
    /// Hand-built records: (module id, time step in slots, scalers)
    records: Vec<(u8, u16, Vec<u8>)>,
}

fuzz_target!(|input: Input| {
    let Ok(detector) = synthetic_detector(&[1, 2, 3]) else {
        return;
    };
    let mut config = SnConfig::default();
    config.analysis.background_window = Duration::from_secs(2);
    config.timing.staging_ticks = 1000;
    let Ok(mut pipeline) = Pipeline::new(config, Arc::new(detector)) else {
        return;
    };

    let mut reader = PayloadReader::new(Cursor::new(input.archive));
    for _ in 0..64 {
        match reader.next_record() {
            Ok(Some(record)) => {
                let _ = pipeline.process_record(&record);
            }
            Ok(None) => break,
            Err(_) => continue,
        }
    }

    let mut time = 0u64;
    for (module, step, scalers) in input.records.into_iter().take(256) {
        time += u64::from(step) * sndaq::payload::SCALER_UDT;
        let record = TelemetryRecord {
            module_id: u64::from(module % 5),
            record_time: time,
            module_clock: 0,
            scaler_counts: scalers,
        };
        let _ = pipeline.process_record(&record);
    }
    let _ = pipeline.finish();
});
