//! # sndaq
//!
//! Online search for collective rate excesses (core-collapse supernova neutrino
//! bursts) in the scaler telemetry of a large array of detector modules.
//!
//! Each module reports the hits it counted in consecutive 1.6384 ms slots. The
//! library decodes those records, rebins every module onto a common 2 ms grid,
//! keeps a fixed-memory multi-scale history of the whole array, and computes an
//! efficiency-weighted likelihood test statistic for several signal window widths
//! on every tick. A threshold ladder with hysteresis turns the statistic into
//! trigger events, which leave through a non-blocking alert queue.
//!
//! ## Crate Structure
//!
//! - **`payload`**: Wire format of scaler records, streaming readers and writers,
//!   archive file naming.
//! - **`detector`**: Immutable module table shared by every stage.
//! - **`rebin`**: Proportional split of scaler slots onto grid ticks.
//! - **`buffer`**: Staging, ring storage and sliding window sums (`StreamBuffer`).
//! - **`background`**: Incremental per-module background mean and variance.
//! - **`significance`**: Likelihood rate excess, test statistic and goodness of fit.
//! - **`seasonal`**: Slow bias correction of the test statistic.
//! - **`trigger`**: Threshold ladder state machine.
//! - **`publish`**: Drop-oldest alert queue and sinks.
//! - **`pipeline`**: The per-stream loop tying the stages together.
//! - **`changepoint`**: Hook for array-rate changepoint detectors.
//! - **`simulate`**: Seeded synthetic scaler streams.
//! - **`config`**, **`error`**, **`logging`**: Ambient configuration, error and
//!   tracing setup.

pub mod background;
pub mod buffer;
pub mod changepoint;
pub mod config;
pub mod detector;
pub mod error;
pub mod logging;
pub mod payload;
pub mod pipeline;
pub mod publish;
pub mod rebin;
pub mod seasonal;
pub mod significance;
pub mod simulate;
pub mod trigger;

pub use config::SnConfig;
pub use detector::DetectorModel;
pub use error::{SnError, SnResult};
pub use payload::TelemetryRecord;
pub use pipeline::{IngestCounters, Pipeline, TickOutput};
pub use publish::{Alert, AlertPublisher, AlertSink};
pub use significance::AnalysisWindowResult;
pub use trigger::TriggerEvent;
