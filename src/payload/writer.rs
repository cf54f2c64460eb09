//! Append-only record writer.

use super::{codec, TelemetryRecord};
use crate::error::SnResult;
use bytes::BytesMut;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Writes records to any `Write`, one at a time.
pub struct PayloadWriter<W: Write> {
    inner: W,
    scratch: BytesMut,
    records: u64,
    bytes: u64,
}

impl PayloadWriter<BufWriter<File>> {
    /// Create (or truncate) an archive file.
    pub fn create<P: AsRef<Path>>(path: P) -> SnResult<Self> {
        Ok(Self::new(BufWriter::new(File::create(path)?)))
    }

    /// Open an archive file for appending, creating it if needed.
    pub fn append_to<P: AsRef<Path>>(path: P) -> SnResult<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self::new(BufWriter::new(file)))
    }
}

impl<W: Write> PayloadWriter<W> {
    /// Wrap a byte sink.
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            scratch: BytesMut::with_capacity(1024),
            records: 0,
            bytes: 0,
        }
    }

    /// Encode and write one record.
    pub fn append(&mut self, record: &TelemetryRecord) -> SnResult<()> {
        self.scratch.clear();
        codec::encode_into(record, &mut self.scratch)?;
        self.inner.write_all(&self.scratch)?;
        self.records += 1;
        self.bytes += self.scratch.len() as u64;
        Ok(())
    }

    /// Flush buffered bytes to the sink.
    pub fn flush(&mut self) -> SnResult<()> {
        self.inner.flush()?;
        Ok(())
    }

    /// Records written so far.
    pub fn records_written(&self) -> u64 {
        self.records
    }

    /// Bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    /// Flush and return the sink.
    pub fn into_inner(mut self) -> SnResult<W> {
        self.inner.flush()?;
        Ok(self.inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::PayloadReader;

    fn record(t: u64) -> TelemetryRecord {
        TelemetryRecord {
            module_id: 0xfeed,
            record_time: t,
            module_clock: 7,
            scaler_counts: vec![1, 0, 2],
        }
    }

    #[test]
    fn test_append_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.dat");

        let mut writer = PayloadWriter::create(&path).unwrap();
        writer.append(&record(10)).unwrap();
        writer.append(&record(20)).unwrap();
        writer.flush().unwrap();
        assert_eq!(writer.records_written(), 2);
        assert_eq!(writer.bytes_written(), 74);
        drop(writer);

        // A second writer extends the same file
        let mut writer = PayloadWriter::append_to(&path).unwrap();
        writer.append(&record(30)).unwrap();
        writer.into_inner().unwrap();

        let times: Vec<u64> = PayloadReader::open(&path)
            .unwrap()
            .map(|r| r.unwrap().record_time)
            .collect();
        assert_eq!(times, vec![10, 20, 30]);
    }

    #[test]
    fn test_invalid_record_writes_nothing() {
        let mut writer = PayloadWriter::new(Vec::new());
        let mut bad = record(1);
        bad.scaler_counts.clear();
        assert!(writer.append(&bad).is_err());
        assert!(writer.into_inner().unwrap().is_empty());
    }
}
