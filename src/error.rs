//! Custom error types for the supernova DAQ.
//!
//! This module defines the primary error type, `SnError`, shared by every stage of the
//! ingest pipeline. Using the `thiserror` crate, it gives one consistent vocabulary for the
//! anomalies a long-running scaler stream produces, from a single corrupt record up to a
//! broken structural invariant.
//!
//! ## Error Hierarchy
//!
//! `SnError` separates locally recoverable conditions from fatal ones:
//!
//! - **`MalformedRecord`**: A single telemetry record failed to decode. The record is skipped
//!   and counted; the stream continues.
//! - **`CorruptStream`**: The record framing itself is unreadable (length field out of range),
//!   so the reader cannot find the next record boundary. Fatal for that stream.
//! - **`SystemicCorruption`**: Too many consecutive malformed records. The stream is aborted.
//! - **`ClockDiscontinuity`**: A module's record time jumped backward or skipped ahead. The
//!   module is resynchronized; recovered locally.
//! - **`UnknownModule`**: A record referenced a module absent from the detector table. Dropped
//!   and counted.
//! - **`BufferOverflowAttempt`**: A sample was routed past the staging capacity. This is a
//!   structural invariant violation and is fatal.
//! - **`NegativeVariance`**: Background sums produced an impossible variance. Fatal.
//! - **`DownstreamBackpressure`**: The alert queue overflowed and dropped its oldest entry.
//!   Never blocks ingest; reported for monitoring only.
//! - **`Config`** / **`Configuration`**: Parse and semantic validation failures of the
//!   configuration.
//! - **`DetectorTable`**: The module table could not be parsed.
//! - **`Io`**: Wraps `std::io::Error` from file and socket sources.
//!
//! By using `#[from]`, `SnError` can be created from underlying error types with `?`.

use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type SnResult<T> = std::result::Result<T, SnError>;

/// Error type for every stage of the scaler ingest and analysis pipeline.
#[derive(Error, Debug)]
pub enum SnError {
    /// A record failed to decode at the given byte offset of its source.
    #[error("Malformed record at offset {offset}: {reason}")]
    MalformedRecord {
        /// Byte offset of the record start within the stream
        offset: u64,
        /// Human-readable cause
        reason: String,
    },

    /// The stream framing is unrecoverable.
    #[error("Corrupt stream: {0}")]
    CorruptStream(String),

    /// Consecutive malformed records exceeded the configured limit.
    #[error("Systemic corruption: {consecutive} consecutive malformed records")]
    SystemicCorruption {
        /// Number of malformed records seen back to back
        consecutive: u32,
    },

    /// A module's record time does not continue its previous record.
    #[error("Clock discontinuity on module {module_id:012x}: expected utime {expected}, got {actual}")]
    ClockDiscontinuity {
        /// Module whose clock jumped
        module_id: u64,
        /// Record time predicted from the previous record
        expected: u64,
        /// Record time actually received
        actual: u64,
    },

    /// A record referenced a module that is not in the detector table.
    #[error("Unknown module {0:012x}")]
    UnknownModule(u64),

    /// A sample targeted a tick beyond the staging capacity.
    #[error("Buffer overflow attempt: tick offset {tick} exceeds staging capacity {capacity}")]
    BufferOverflowAttempt {
        /// Offset of the offending tick from the staging front
        tick: u64,
        /// Staging capacity in ticks
        capacity: usize,
    },

    /// Background sums yielded a negative variance.
    #[error("Negative background variance for module index {module}")]
    NegativeVariance {
        /// Index of the offending module
        module: usize,
    },

    /// The alert queue is full and dropped its oldest entry.
    #[error("Downstream backpressure: {dropped} alerts dropped")]
    DownstreamBackpressure {
        /// Total alerts dropped so far
        dropped: u64,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("Detector table error on line {line}: {reason}")]
    DetectorTable {
        /// 1-based line number in the table source
        line: usize,
        /// Human-readable cause
        reason: String,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl SnError {
    /// Structural invariant violations that must stop processing.
    ///
    /// Everything else is a per-record anomaly that the pipeline recovers from locally.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SnError::CorruptStream(_)
                | SnError::SystemicCorruption { .. }
                | SnError::BufferOverflowAttempt { .. }
                | SnError::NegativeVariance { .. }
                | SnError::Io(_)
        )
    }

    pub(crate) fn malformed(offset: u64, reason: impl Into<String>) -> Self {
        SnError::MalformedRecord {
            offset,
            reason: reason.into(),
        }
    }
}
