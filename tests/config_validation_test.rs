//! Semantic validation of loaded configuration.

use sndaq::config::{SnConfig, TierConfig};
use sndaq::error::SnError;
use sndaq::simulate::synthetic_detector;
use sndaq::Pipeline;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

fn rejected(config: &SnConfig) -> String {
    config.validate().unwrap_err()
}

#[test]
fn test_duplicate_window_width_rejected() {
    let mut config = SnConfig::default();
    config.analysis.window_widths_ms = vec![500, 1500, 500];
    assert!(rejected(&config).contains("Duplicate window width 500 ms"));
}

#[test]
fn test_empty_window_list_rejected() {
    let mut config = SnConfig::default();
    config.analysis.window_widths_ms.clear();
    assert!(rejected(&config).contains("At least one analysis window"));
}

#[test]
fn test_background_not_multiple_of_base_rejected() {
    let mut config = SnConfig::default();
    config.analysis.background_window = Duration::from_millis(600_250);
    assert!(rejected(&config).contains("positive multiple of the base width"));
}

#[test]
fn test_single_bin_background_rejected() {
    let mut config = SnConfig::default();
    config.analysis.background_window = Duration::from_millis(500);
    assert!(rejected(&config).contains("at least two base bins"));
}

#[test]
fn test_nan_rate_bound_rejected() {
    let mut config = SnConfig::default();
    config.analysis.min_rate_hz = f64::NAN;
    assert!(rejected(&config).contains("Rate bounds"));
}

#[test]
fn test_inverted_fano_bounds_rejected() {
    let mut config = SnConfig::default();
    config.analysis.min_fano = 3.0;
    config.analysis.max_fano = 2.0;
    assert!(rejected(&config).contains("Fano bounds out of order"));
}

#[test]
fn test_empty_ladder_rejected() {
    let mut config = SnConfig::default();
    config.trigger.ladder.clear();
    assert!(rejected(&config).contains("at least one tier"));
}

#[test]
fn test_equal_thresholds_rejected() {
    let mut config = SnConfig::default();
    config.trigger.ladder = vec![
        TierConfig {
            name: "low".to_string(),
            threshold: 5.0,
        },
        TierConfig {
            name: "also-low".to_string(),
            threshold: 5.0,
        },
    ];
    assert!(rejected(&config).contains("strictly ascending"));
}

#[test]
fn test_zero_capacities_rejected() {
    let mut config = SnConfig::default();
    config.publish.queue_capacity = 0;
    assert!(rejected(&config).contains("queue_capacity"));

    let mut config = SnConfig::default();
    config.ingest.max_consecutive_malformed = 0;
    assert!(rejected(&config).contains("max_consecutive_malformed"));

    let mut config = SnConfig::default();
    config.seasonal.tau = Duration::ZERO;
    assert!(rejected(&config).contains("seasonal.tau"));
}

#[test]
fn test_log_format_case_insensitive() {
    let mut config = SnConfig::default();
    config.logging.format = "JSON".to_string();
    config.logging.level = "Debug".to_string();
    assert!(config.validate().is_ok());

    config.logging.format = "xml".to_string();
    assert!(rejected(&config).contains("Invalid log format 'xml'"));
}

#[test]
fn test_bad_duration_in_file_is_config_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sndaq.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    writeln!(file, "[trigger]\nhold = \"thirty seconds\"").unwrap();

    let err = SnConfig::load_from(&path).unwrap_err();
    assert!(matches!(err, SnError::Config(_)), "{err:?}");
}

#[test]
fn test_pipeline_refuses_invalid_config() {
    let detector = Arc::new(synthetic_detector(&[1]).unwrap());
    let mut config = SnConfig::default();
    config.analysis.window_widths_ms = vec![501];
    let err = Pipeline::new(config, detector).unwrap_err();
    assert!(matches!(err, SnError::Configuration(_)), "{err:?}");
}
