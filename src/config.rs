//! Configuration for the scaler ingest and burst search, loaded with Figment.
//!
//! Configuration is merged from, in increasing precedence:
//! 1. Built-in operational defaults (`SnConfig::default()`)
//! 2. A TOML file
//! 3. Environment variables prefixed with `SNDAQ_`, nested keys separated by `__`
//!
//! # Example
//! ```no_run
//! use sndaq::config::SnConfig;
//!
//! // SNDAQ_TRIGGER__HOLD=45s overrides the excursion hold period
//! let config = SnConfig::load_from("sndaq.toml")?;
//! config.validate()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

use crate::error::{SnError, SnResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Grid tick width in milliseconds.
pub const GRID_MS: u64 = 2;

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SnConfig {
    /// Stream timing and reordering
    #[serde(default)]
    pub timing: TimingConfig,
    /// Background and signal window layout, module qualification
    #[serde(default)]
    pub analysis: AnalysisConfig,
    /// Threshold ladder and excursion hold-off
    #[serde(default)]
    pub trigger: TriggerConfig,
    /// Slow bias correction of the test statistic
    #[serde(default)]
    pub seasonal: SeasonalConfig,
    /// Alert queue and lightcurve context
    #[serde(default)]
    pub publish: PublishConfig,
    /// Record-level fault tolerance
    #[serde(default)]
    pub ingest: IngestConfig,
    /// Log output
    #[serde(default)]
    pub logging: LogSettings,
}

/// Stream timing configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimingConfig {
    /// How far behind the newest record time a tick must be before it is committed
    #[serde(with = "humantime_serde", default = "default_reorder_slack")]
    pub reorder_slack: Duration,
    /// Number of uncommitted 2 ms ticks that may be staged ahead of the commit point
    #[serde(default = "default_staging_ticks")]
    pub staging_ticks: usize,
    /// UTC year the record times count from, used to stamp trigger reports
    #[serde(default)]
    pub epoch_year: Option<i32>,
}

/// Window layout and module qualification
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AnalysisConfig {
    /// Length of the background estimate window
    #[serde(with = "humantime_serde", default = "default_background_window")]
    pub background_window: Duration,
    /// Gap between the background window and the signal window
    #[serde(with = "humantime_serde", default = "default_exclusion")]
    pub exclusion: Duration,
    /// Signal window widths; the smallest is the base bin width
    #[serde(default = "default_window_widths")]
    pub window_widths_ms: Vec<u64>,
    /// Lowest tolerated background rate per module
    #[serde(default = "default_min_rate")]
    pub min_rate_hz: f64,
    /// Highest tolerated background rate per module
    #[serde(default = "default_max_rate")]
    pub max_rate_hz: f64,
    /// Lowest tolerated background Fano factor per module
    #[serde(default = "default_min_fano")]
    pub min_fano: f64,
    /// Highest tolerated background Fano factor per module
    #[serde(default = "default_max_fano")]
    pub max_fano: f64,
    /// Minimum number of qualified modules for a result to be reported
    #[serde(default = "default_min_active_modules")]
    pub min_active_modules: usize,
}

/// One rung of the threshold ladder
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TierConfig {
    /// Tier label carried in trigger events
    pub name: String,
    /// Corrected test statistic at which the tier fires
    pub threshold: f64,
}

/// Trigger configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TriggerConfig {
    /// Quiet period below the lowest tier that resolves an excursion
    #[serde(with = "humantime_serde", default = "default_hold")]
    pub hold: Duration,
    /// Tiers in ascending threshold order
    #[serde(default = "default_ladder")]
    pub ladder: Vec<TierConfig>,
}

/// Seasonal correction configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SeasonalConfig {
    /// Disable to report xi_corrected == xi
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Time constant of the correction model
    #[serde(with = "humantime_serde", default = "default_tau")]
    pub tau: Duration,
    /// Samples before the correction is applied at full weight
    #[serde(default = "default_warmup")]
    pub warmup_samples: u64,
}

/// Alert publication configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PublishConfig {
    /// Bounded alert queue length; the oldest alert is dropped on overflow
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    /// Lightcurve context before the trigger tick
    #[serde(with = "humantime_serde", default = "default_lightcurve")]
    pub lightcurve_pre: Duration,
    /// Lightcurve context after the trigger tick
    #[serde(with = "humantime_serde", default = "default_lightcurve")]
    pub lightcurve_post: Duration,
}

/// Record-level fault tolerance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IngestConfig {
    /// Consecutive malformed records that abort a stream
    #[serde(default = "default_max_malformed")]
    pub max_consecutive_malformed: u32,
}

/// Log output settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogSettings {
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_reorder_slack() -> Duration {
    Duration::from_secs(2)
}

fn default_staging_ticks() -> usize {
    4000
}

fn default_background_window() -> Duration {
    Duration::from_secs(600)
}

fn default_exclusion() -> Duration {
    Duration::from_secs(15)
}

fn default_window_widths() -> Vec<u64> {
    vec![500, 1500, 4000, 10000]
}

fn default_min_rate() -> f64 {
    100.0
}

fn default_max_rate() -> f64 {
    10_000.0
}

fn default_min_fano() -> f64 {
    0.5
}

fn default_max_fano() -> f64 {
    5.0
}

fn default_min_active_modules() -> usize {
    1
}

fn default_ladder() -> Vec<TierConfig> {
    [
        ("basic", 4.0),
        ("sn-wg", 7.0),
        ("silver", 8.0),
        ("snews", 8.4),
        ("gold", 10.0),
    ]
    .into_iter()
    .map(|(name, threshold)| TierConfig {
        name: name.to_string(),
        threshold,
    })
    .collect()
}

fn default_hold() -> Duration {
    Duration::from_secs(30)
}

fn default_enabled() -> bool {
    true
}

fn default_tau() -> Duration {
    Duration::from_secs(3 * 3600)
}

fn default_warmup() -> u64 {
    30_000
}

fn default_queue_capacity() -> usize {
    64
}

fn default_lightcurve() -> Duration {
    Duration::from_secs(30)
}

fn default_max_malformed() -> u32 {
    16
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reorder_slack: default_reorder_slack(),
            staging_ticks: default_staging_ticks(),
            epoch_year: None,
        }
    }
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            background_window: default_background_window(),
            exclusion: default_exclusion(),
            window_widths_ms: default_window_widths(),
            min_rate_hz: default_min_rate(),
            max_rate_hz: default_max_rate(),
            min_fano: default_min_fano(),
            max_fano: default_max_fano(),
            min_active_modules: default_min_active_modules(),
        }
    }
}

impl Default for TriggerConfig {
    fn default() -> Self {
        Self {
            hold: default_hold(),
            ladder: default_ladder(),
        }
    }
}

impl Default for SeasonalConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            tau: default_tau(),
            warmup_samples: default_warmup(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            lightcurve_pre: default_lightcurve(),
            lightcurve_post: default_lightcurve(),
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_consecutive_malformed: default_max_malformed(),
        }
    }
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Whole 2 ms grid ticks in a duration (rounded down).
pub fn duration_to_ticks(d: Duration) -> u64 {
    (d.as_millis() / u128::from(GRID_MS)) as u64
}

impl AnalysisConfig {
    /// Base bin width in ms (the smallest signal window).
    pub fn base_width_ms(&self) -> u64 {
        self.window_widths_ms.iter().copied().min().unwrap_or(GRID_MS)
    }

    /// Grid ticks per base bin.
    pub fn ticks_per_base(&self) -> usize {
        (self.base_width_ms() / GRID_MS) as usize
    }

    /// Base bins in the background window.
    pub fn background_bins(&self) -> usize {
        (self.background_window.as_millis() / u128::from(self.base_width_ms())) as usize
    }

    /// Base bins in the exclusion gap (rounded up).
    pub fn exclusion_bins(&self) -> usize {
        let base = u128::from(self.base_width_ms());
        self.exclusion.as_millis().div_ceil(base) as usize
    }

    /// Largest signal window in grid ticks.
    pub fn max_window_ticks(&self) -> usize {
        (self.window_widths_ms.iter().copied().max().unwrap_or(GRID_MS) / GRID_MS) as usize
    }
}

impl SnConfig {
    /// Load defaults overlaid with `SNDAQ_` environment variables only.
    pub fn load_env() -> SnResult<Self> {
        Ok(Self::figment().extract()?)
    }

    /// Load configuration from a TOML file plus environment overrides.
    ///
    /// Missing keys fall back to the operational defaults.
    pub fn load_from<P: AsRef<Path>>(path: P) -> SnResult<Self> {
        let config = Figment::from(Serialized::defaults(SnConfig::default()))
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SNDAQ_").split("__"))
            .extract()?;
        Ok(config)
    }

    fn figment() -> Figment {
        Figment::from(Serialized::defaults(SnConfig::default()))
            .merge(Env::prefixed("SNDAQ_").split("__"))
    }

    /// Render the configuration as TOML.
    pub fn to_toml(&self) -> SnResult<String> {
        toml::to_string_pretty(self).map_err(|e| SnError::Configuration(e.to_string()))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> Result<(), String> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.logging.level,
                valid_levels.join(", ")
            ));
        }
        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.logging.format.to_lowercase().as_str()) {
            return Err(format!(
                "Invalid log format '{}'. Must be one of: {}",
                self.logging.format,
                valid_formats.join(", ")
            ));
        }

        let analysis = &self.analysis;
        if analysis.window_widths_ms.is_empty() {
            return Err("At least one analysis window width is required".to_string());
        }
        let base = analysis.base_width_ms();
        if base == 0 || base % GRID_MS != 0 {
            return Err(format!(
                "Base window width {base} ms must be a positive multiple of the {GRID_MS} ms grid"
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for &w in &analysis.window_widths_ms {
            if w % base != 0 {
                return Err(format!(
                    "Window width {w} ms is not a multiple of the base width {base} ms"
                ));
            }
            if !seen.insert(w) {
                return Err(format!("Duplicate window width {w} ms"));
            }
        }
        let bg_ms = analysis.background_window.as_millis();
        if bg_ms == 0 || bg_ms % u128::from(base) != 0 {
            return Err(format!(
                "Background window {bg_ms} ms must be a positive multiple of the base width {base} ms"
            ));
        }
        if analysis.background_bins() < 2 {
            return Err("Background window must span at least two base bins".to_string());
        }
        if !(analysis.min_rate_hz <= analysis.max_rate_hz) {
            return Err(format!(
                "Rate bounds out of order: {} > {}",
                analysis.min_rate_hz, analysis.max_rate_hz
            ));
        }
        if !(analysis.min_fano <= analysis.max_fano) {
            return Err(format!(
                "Fano bounds out of order: {} > {}",
                analysis.min_fano, analysis.max_fano
            ));
        }

        if self.trigger.ladder.is_empty() {
            return Err("Trigger ladder must have at least one tier".to_string());
        }
        for pair in self.trigger.ladder.windows(2) {
            if !(pair[0].threshold < pair[1].threshold) {
                return Err(format!(
                    "Trigger ladder must be strictly ascending: '{}' ({}) >= '{}' ({})",
                    pair[0].name, pair[0].threshold, pair[1].name, pair[1].threshold
                ));
            }
        }

        if self.timing.staging_ticks == 0 {
            return Err("staging_ticks must be positive".to_string());
        }
        if duration_to_ticks(self.timing.reorder_slack) >= self.timing.staging_ticks as u64 {
            return Err(format!(
                "reorder_slack {:?} does not fit in {} staging ticks",
                self.timing.reorder_slack, self.timing.staging_ticks
            ));
        }
        if self.publish.queue_capacity == 0 {
            return Err("publish.queue_capacity must be positive".to_string());
        }
        if self.ingest.max_consecutive_malformed == 0 {
            return Err("ingest.max_consecutive_malformed must be positive".to_string());
        }
        if self.seasonal.tau.is_zero() {
            return Err("seasonal.tau must be positive".to_string());
        }

        Ok(())
    }
}
