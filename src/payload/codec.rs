//! Byte-level encoding of scaler records.

use super::{
    TelemetryRecord, MAX_48BIT, MAX_SCALERS, SN_FIXED_LENGTH, SN_MAGIC_NUMBER,
    SN_RECORD_LENGTH_OVERHEAD, SN_TYPE_ID,
};
use crate::error::{SnError, SnResult};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Decode one complete record from `buf`.
///
/// `buf` must hold exactly one record; trailing bytes are a length mismatch.
pub fn decode(buf: &[u8]) -> SnResult<TelemetryRecord> {
    decode_at(buf, 0)
}

/// Decode one record, reporting failures against stream offset `offset`.
pub fn decode_at(buf: &[u8], offset: u64) -> SnResult<TelemetryRecord> {
    if buf.len() < SN_FIXED_LENGTH {
        return Err(SnError::malformed(
            offset,
            format!(
                "record of {} bytes is shorter than the {SN_FIXED_LENGTH}-byte header",
                buf.len()
            ),
        ));
    }

    let mut cur = buf;
    let total_length = cur.get_u32() as usize;
    if total_length != buf.len() {
        return Err(SnError::malformed(
            offset,
            format!(
                "declared total length {total_length} disagrees with {} available bytes",
                buf.len()
            ),
        ));
    }
    let type_id = cur.get_u32();
    if type_id != SN_TYPE_ID {
        return Err(SnError::malformed(
            offset,
            format!("unexpected type id {type_id}"),
        ));
    }
    let record_time = cur.get_u64();

    let module_id = cur.get_u64();
    if module_id > MAX_48BIT {
        return Err(SnError::malformed(
            offset,
            format!("module id {module_id:#x} exceeds 48 bits"),
        ));
    }
    let record_length = cur.get_u16() as usize;
    // record_length counts itself, the magic, the clock and the scalers
    if record_length != cur.remaining() + 2 {
        return Err(SnError::malformed(
            offset,
            format!(
                "scaler-data length {record_length} disagrees with {} remaining bytes",
                cur.remaining()
            ),
        ));
    }
    let magic = cur.get_u16();
    if magic != SN_MAGIC_NUMBER {
        return Err(SnError::malformed(offset, format!("bad magic {magic}")));
    }
    let module_clock = cur.get_uint(6);
    if !cur.has_remaining() {
        return Err(SnError::malformed(offset, "record carries no scalers"));
    }

    Ok(TelemetryRecord {
        module_id,
        record_time,
        module_clock,
        scaler_counts: cur.to_vec(),
    })
}

/// Encode a record into a fresh buffer.
pub fn encode(record: &TelemetryRecord) -> SnResult<Bytes> {
    let mut buf = BytesMut::with_capacity(record.encoded_len());
    encode_into(record, &mut buf)?;
    Ok(buf.freeze())
}

/// Append the wire form of `record` to `buf`.
///
/// Rejects records that break the data model: no scalers, too many scalers for the
/// 16-bit length field, or 48-bit fields out of range.
pub fn encode_into(record: &TelemetryRecord, buf: &mut BytesMut) -> SnResult<()> {
    let n = record.scaler_counts.len();
    if n == 0 || n > MAX_SCALERS {
        return Err(SnError::malformed(
            0,
            format!("cannot encode {n} scalers (allowed 1..={MAX_SCALERS})"),
        ));
    }
    if record.module_id > MAX_48BIT || record.module_clock > MAX_48BIT {
        return Err(SnError::malformed(0, "48-bit field out of range"));
    }

    buf.reserve(SN_FIXED_LENGTH + n);
    buf.put_u32((SN_FIXED_LENGTH + n) as u32);
    buf.put_u32(SN_TYPE_ID);
    buf.put_u64(record.record_time);
    buf.put_u64(record.module_id);
    buf.put_u16((SN_RECORD_LENGTH_OVERHEAD + n) as u16);
    buf.put_u16(SN_MAGIC_NUMBER);
    buf.put_uint(record.module_clock, 6);
    buf.put_slice(&record.scaler_counts);
    Ok(())
}

/// Decode many independently framed records concurrently, preserving input order.
#[cfg(feature = "parallel")]
pub fn decode_batch(frames: &[Bytes]) -> Vec<SnResult<TelemetryRecord>> {
    use rayon::prelude::*;

    frames.par_iter().map(|frame| decode(frame)).collect()
}

/// Decode many independently framed records, preserving input order.
#[cfg(not(feature = "parallel"))]
pub fn decode_batch(frames: &[Bytes]) -> Vec<SnResult<TelemetryRecord>> {
    frames.iter().map(|frame| decode(frame)).collect()
}
