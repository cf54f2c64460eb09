//! Pull-based record readers over files and sockets.
//!
//! Both readers expose the same contract: `next_record()` yields `Ok(Some(record))`,
//! a recoverable `MalformedRecord` error after which reading may continue, or `Ok(None)`
//! once the source is exhausted. A framing error (a length field that cannot belong to
//! any scaler record) leaves the reader unable to find the next boundary; it is reported
//! as `CorruptStream` and the reader then behaves as exhausted.

use super::{codec, Compression, TelemetryRecord, MAX_RECORD_LENGTH, SN_FIXED_LENGTH};
use crate::error::{SnError, SnResult};
use async_trait::async_trait;
use futures::stream::{self, Stream};
use std::fs::File;
use std::io::{BufReader, ErrorKind, Read};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Uniform record source for the pipeline driver.
#[async_trait]
pub trait RecordSource: Send {
    /// Next record, a recoverable decode error, or `None` at end of stream.
    async fn next_record(&mut self) -> SnResult<Option<TelemetryRecord>>;

    /// Short label for logs.
    fn describe(&self) -> String;
}

/// Validate a length prefix and return the full record length.
fn frame_length(prefix: [u8; 4], offset: u64) -> SnResult<usize> {
    let total = u32::from_be_bytes(prefix) as usize;
    if !(SN_FIXED_LENGTH..=MAX_RECORD_LENGTH).contains(&total) {
        return Err(SnError::CorruptStream(format!(
            "record length {total} at offset {offset} is outside {SN_FIXED_LENGTH}..={MAX_RECORD_LENGTH}"
        )));
    }
    Ok(total)
}

fn truncated(offset: u64, wanted: usize, got: usize) -> SnError {
    SnError::malformed(
        offset,
        format!("truncated record: expected {wanted} bytes, stream ended after {got}"),
    )
}

/// Byte source of an opened archive file, decompressed as its suffix demands.
pub type ArchiveBytes = Box<dyn Read + Send>;

fn archive_bytes(path: &Path) -> SnResult<ArchiveBytes> {
    let file = BufReader::new(File::open(path)?);
    match Compression::from_path(path) {
        Compression::None => Ok(Box::new(file)),
        #[cfg(feature = "compression")]
        Compression::Gzip => {
            let decoder = flate2::read::MultiGzDecoder::new(file);
            Ok(Box::new(BufReader::new(decoder)))
        }
        #[cfg(feature = "compression")]
        Compression::Bzip2 => {
            let decoder = bzip2::read::MultiBzDecoder::new(file);
            Ok(Box::new(BufReader::new(decoder)))
        }
        #[cfg(not(feature = "compression"))]
        other => Err(SnError::Io(std::io::Error::new(
            ErrorKind::Unsupported,
            format!("{} archives need the `compression` feature", other.suffix()),
        ))),
    }
}

/// Blocking reader over any `Read`.
pub struct PayloadReader<R> {
    inner: R,
    label: String,
    offset: u64,
    records: u64,
    buf: Vec<u8>,
    exhausted: bool,
}

impl PayloadReader<ArchiveBytes> {
    /// Open an archive file; `.gz` and `.bz2` files are decompressed on the fly.
    pub fn open<P: AsRef<Path>>(path: P) -> SnResult<Self> {
        let path = path.as_ref();
        Ok(Self::new(archive_bytes(path)?).with_label(path.display().to_string()))
    }
}

impl<R: Read> PayloadReader<R> {
    /// Wrap a byte source.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            label: "stream".to_string(),
            offset: 0,
            records: 0,
            buf: Vec::with_capacity(1024),
            exhausted: false,
        }
    }

    /// Set the label used in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Bytes consumed so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Records successfully decoded so far.
    pub fn records_read(&self) -> u64 {
        self.records
    }

    /// Fill `buf[from..to]`, stopping early only at end of stream.
    fn fill(&mut self, from: usize, to: usize) -> SnResult<usize> {
        let mut got = from;
        while got < to {
            match self.inner.read(&mut self.buf[got..to]) {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(got)
    }

    /// Read the next record.
    pub fn next_record(&mut self) -> SnResult<Option<TelemetryRecord>> {
        if self.exhausted {
            return Ok(None);
        }
        let start = self.offset;

        self.buf.resize(4, 0);
        let got = self.fill(0, 4)?;
        if got == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        if got < 4 {
            self.exhausted = true;
            self.offset += got as u64;
            return Err(truncated(start, 4, got));
        }

        let prefix = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        let total = match frame_length(prefix, start) {
            Ok(total) => total,
            Err(e) => {
                self.exhausted = true;
                return Err(e);
            }
        };

        self.buf.resize(total, 0);
        let got = self.fill(4, total)?;
        self.offset += got as u64;
        if got < total {
            self.exhausted = true;
            return Err(truncated(start, total, got));
        }

        let record = codec::decode_at(&self.buf, start)?;
        self.records += 1;
        Ok(Some(record))
    }
}

impl<R: Read> Iterator for PayloadReader<R> {
    type Item = SnResult<TelemetryRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_record().transpose()
    }
}

#[async_trait]
impl<R: Read + Send> RecordSource for PayloadReader<R> {
    async fn next_record(&mut self) -> SnResult<Option<TelemetryRecord>> {
        PayloadReader::next_record(self)
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}

/// Non-blocking reader for live sockets or async files.
pub struct AsyncPayloadReader<R> {
    inner: R,
    label: String,
    offset: u64,
    buf: Vec<u8>,
    exhausted: bool,
}

impl<R: AsyncRead + Unpin + Send> AsyncPayloadReader<R> {
    /// Wrap an async byte source.
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            label: "socket".to_string(),
            offset: 0,
            buf: Vec::with_capacity(1024),
            exhausted: false,
        }
    }

    /// Set the label used in logs.
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    async fn fill(&mut self, from: usize, to: usize) -> SnResult<usize> {
        let mut got = from;
        while got < to {
            match self.inner.read(&mut self.buf[got..to]).await {
                Ok(0) => break,
                Ok(n) => got += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(got)
    }

    /// Read the next record.
    pub async fn next_record(&mut self) -> SnResult<Option<TelemetryRecord>> {
        if self.exhausted {
            return Ok(None);
        }
        let start = self.offset;

        self.buf.resize(4, 0);
        let got = self.fill(0, 4).await?;
        if got == 0 {
            self.exhausted = true;
            return Ok(None);
        }
        if got < 4 {
            self.exhausted = true;
            self.offset += got as u64;
            return Err(truncated(start, 4, got));
        }

        let prefix = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
        let total = match frame_length(prefix, start) {
            Ok(total) => total,
            Err(e) => {
                self.exhausted = true;
                return Err(e);
            }
        };

        self.buf.resize(total, 0);
        let got = self.fill(4, total).await?;
        self.offset += got as u64;
        if got < total {
            self.exhausted = true;
            return Err(truncated(start, total, got));
        }

        codec::decode_at(&self.buf, start).map(Some)
    }

    /// Consume the reader as a stream of records and recoverable errors.
    pub fn into_stream(self) -> impl Stream<Item = SnResult<TelemetryRecord>> {
        stream::unfold(self, |mut reader| async move {
            match reader.next_record().await {
                Ok(Some(record)) => Some((Ok(record), reader)),
                Ok(None) => None,
                Err(e) => Some((Err(e), reader)),
            }
        })
    }
}

#[async_trait]
impl<R: AsyncRead + Unpin + Send> RecordSource for AsyncPayloadReader<R> {
    async fn next_record(&mut self) -> SnResult<Option<TelemetryRecord>> {
        AsyncPayloadReader::next_record(self).await
    }

    fn describe(&self) -> String {
        self.label.clone()
    }
}
