//! Supernova scaler telemetry records.
//!
//! A record carries one module's scaler counts for a contiguous run of 1.6384 ms
//! slots, stamped with the DAQ record time (0.1 ns since the start of the UTC year)
//! and the module's own 25 ns clock.
//!
//! # Wire Layout
//! ```text
//! envelope (16 bytes, big-endian)
//!   u32  total_length   (= 16 + data length)
//!   u32  type_id        (16)
//!   u64  record_time
//! data (18 + n bytes)
//!   u64  module_id      (48-bit value, zero-padded)
//!   u16  record_length  (= 10 + n)
//!   u16  magic          (300)
//!   [u8; 6] module_clock
//!   [u8; n] scaler counts
//! ```

pub mod archive;
pub mod codec;
pub mod reader;
pub mod writer;

pub use archive::{scan_archive_dir, ArchiveFileName, Compression};
pub use codec::{decode, encode};
pub use reader::{AsyncPayloadReader, PayloadReader, RecordSource};
pub use writer::PayloadWriter;

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

/// Record type tag for supernova scaler payloads.
pub const SN_TYPE_ID: u32 = 16;
/// Envelope length in bytes.
pub const SN_ENVELOPE_LENGTH: usize = 16;
/// Data block header length in bytes, excluding scalers.
pub const SN_HEADER_LENGTH: usize = 18;
/// Full fixed header (envelope plus data header).
pub const SN_FIXED_LENGTH: usize = SN_ENVELOPE_LENGTH + SN_HEADER_LENGTH;
/// Data block magic number.
pub const SN_MAGIC_NUMBER: u16 = 300;
/// Bytes counted by `record_length` before the scalers (length, magic, clock).
pub const SN_RECORD_LENGTH_OVERHEAD: usize = 10;
/// Largest scaler array a record can carry.
pub const MAX_SCALERS: usize = u16::MAX as usize - SN_RECORD_LENGTH_OVERHEAD;
/// Largest well-formed record on the wire.
pub const MAX_RECORD_LENGTH: usize = SN_FIXED_LENGTH + MAX_SCALERS;

/// Largest value of a 48-bit field.
pub const MAX_48BIT: u64 = (1 << 48) - 1;

/// Scaler slot width in record-time units (1.6384 ms = 2^16 module clock ticks of 25 ns).
pub const SCALER_UDT: u64 = 250 * (1 << 16);
/// Analysis grid tick width in record-time units (2 ms).
pub const GRID_UDT: u64 = 20_000_000;
/// Record-time units per second.
pub const UTIME_PER_SECOND: u64 = 10_000_000_000;

/// One decoded scaler record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelemetryRecord {
    /// 48-bit module (mainboard) identifier
    pub module_id: u64,
    /// Start of the first scaler slot, 0.1 ns since the start of the UTC year
    pub record_time: u64,
    /// 48-bit module clock at the first slot, 25 ns ticks since power-up
    pub module_clock: u64,
    /// Hits per 1.6384 ms slot, oldest first
    pub scaler_counts: Vec<u8>,
}

impl TelemetryRecord {
    /// Record time at which the next contiguous record of this module begins.
    ///
    /// `None` when the record would end past the representable time range.
    pub fn end_time(&self) -> Option<u64> {
        slots_end(self.record_time, self.scaler_counts.len())
    }

    /// Total hits in the record.
    pub fn hit_sum(&self) -> u64 {
        self.scaler_counts.iter().map(|&c| u64::from(c)).sum()
    }

    /// Bytes this record occupies on the wire.
    pub fn encoded_len(&self) -> usize {
        SN_FIXED_LENGTH + self.scaler_counts.len()
    }
}

/// End of `slots` scaler slots starting at `record_time`, if it fits in `i64`.
pub fn slots_end(record_time: u64, slots: usize) -> Option<u64> {
    (slots as u64)
        .checked_mul(SCALER_UDT)
        .and_then(|span| record_time.checked_add(span))
        .filter(|&end| end <= i64::MAX as u64)
}

/// Convert a record time to UTC given the year it counts from.
///
/// Returns `None` for years chrono cannot represent.
pub fn utime_to_datetime(utime: u64, year: i32) -> Option<DateTime<Utc>> {
    let start = Utc.with_ymd_and_hms(year, 1, 1, 0, 0, 0).single()?;
    // 0.1 ns resolution is truncated to whole nanoseconds
    let nanos = i64::try_from(utime / 10).ok()?;
    start.checked_add_signed(ChronoDuration::nanoseconds(nanos))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timing_constants() {
        assert_eq!(SCALER_UDT, 16_384_000);
        assert_eq!(MAX_RECORD_LENGTH, 24 + u16::MAX as usize);
    }

    #[test]
    fn test_record_end_time() {
        let rec = TelemetryRecord {
            module_id: 1,
            record_time: 1_000,
            module_clock: 0,
            scaler_counts: vec![1, 2, 3],
        };
        assert_eq!(rec.end_time(), Some(1_000 + 3 * SCALER_UDT));
        assert_eq!(rec.hit_sum(), 6);
        assert_eq!(rec.encoded_len(), 37);
    }

    #[test]
    fn test_end_time_out_of_range() {
        let rec = TelemetryRecord {
            module_id: 1,
            record_time: u64::MAX - 1_000,
            module_clock: 0,
            scaler_counts: vec![1, 2],
        };
        assert_eq!(rec.end_time(), None);
        assert_eq!(slots_end(i64::MAX as u64 - SCALER_UDT, 1), Some(i64::MAX as u64));
        assert_eq!(slots_end(i64::MAX as u64 - SCALER_UDT, 2), None);
    }

    #[test]
    fn test_utime_to_datetime() {
        // 1.5 days plus 250 ms into 2023
        let utime = (36 * 3600 * 1000 + 250) * 10_000_000;
        let dt = utime_to_datetime(utime, 2023).unwrap();
        assert_eq!(dt.to_rfc3339(), "2023-01-02T12:00:00.250+00:00");
    }
}
