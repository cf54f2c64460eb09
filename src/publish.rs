//! Decoupled hand-off of trigger alerts to downstream consumers.
//!
//! The ingest path only ever calls [`AlertPublisher::publish`], which never blocks:
//! alerts go into a bounded lock-free queue and the oldest is dropped (and counted)
//! when the queue is full. A tokio task spawned by [`spawn_forwarder`] drains the queue
//! into an [`AlertSink`] at whatever pace the sink allows.

use crate::error::{SnError, SnResult};
use crate::trigger::TriggerEvent;
use async_trait::async_trait;
use crossbeam_queue::ArrayQueue;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Array-wide hits per grid tick around a trigger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lightcurve {
    /// Offset of `counts[0]` from the trigger tick, in ticks (negative = before)
    pub start_offset_ticks: i64,
    /// Tick width in milliseconds
    pub tick_ms: u64,
    /// Hits per tick across all modules
    pub counts: Vec<u32>,
}

/// A trigger event with its review context.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    #[allow(missing_docs)]
    pub event: TriggerEvent,
    #[allow(missing_docs)]
    pub lightcurve: Lightcurve,
}

/// Bounded drop-oldest alert queue.
#[derive(Debug)]
pub struct AlertPublisher {
    queue: ArrayQueue<Alert>,
    published: AtomicU64,
    dropped: AtomicU64,
    ready: Notify,
}

impl AlertPublisher {
    /// Queue holding at most `capacity` undelivered alerts.
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity.max(1)),
            published: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            ready: Notify::new(),
        }
    }

    /// Enqueue an alert without blocking.
    ///
    /// When the queue is full the oldest alert is discarded and
    /// `DownstreamBackpressure` is returned; the new alert is still queued.
    pub fn publish(&self, alert: Alert) -> SnResult<()> {
        self.published.fetch_add(1, Ordering::Relaxed);
        let evicted = self.queue.force_push(alert);
        self.ready.notify_one();
        match evicted {
            Some(old) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                warn!(
                    candidate_id = old.event.candidate_id,
                    tier = %old.event.tier,
                    dropped,
                    "Alert queue full, dropped oldest alert"
                );
                Err(SnError::DownstreamBackpressure { dropped })
            }
            None => Ok(()),
        }
    }

    /// Take the oldest queued alert.
    pub fn try_pop(&self) -> Option<Alert> {
        self.queue.pop()
    }

    /// Alerts waiting for delivery.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue capacity.
    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Alerts discarded to overflow.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Alerts handed to `publish`.
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }

    /// Resolves once an alert has been published since the last wake-up.
    pub async fn notified(&self) {
        self.ready.notified().await;
    }
}

/// Destination for delivered alerts.
#[async_trait]
pub trait AlertSink: Send + Sync {
    /// Deliver one alert; may be slow.
    async fn deliver(&self, alert: &Alert) -> SnResult<()>;
}

/// Appends alerts to a file as one JSON document per line.
#[derive(Debug)]
pub struct JsonLinesSink {
    writer: Mutex<BufWriter<File>>,
}

impl JsonLinesSink {
    /// Open `path` for appending, creating it if needed.
    pub fn open<P: AsRef<Path>>(path: P) -> SnResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            writer: Mutex::new(BufWriter::new(file)),
        })
    }
}

#[async_trait]
impl AlertSink for JsonLinesSink {
    async fn deliver(&self, alert: &Alert) -> SnResult<()> {
        let mut writer = self.writer.lock();
        serde_json::to_writer(&mut *writer, alert)
            .map_err(|e| SnError::Io(std::io::Error::other(e)))?;
        writer.write_all(b"\n")?;
        writer.flush()?;
        Ok(())
    }
}

/// Logs each alert at info level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait]
impl AlertSink for TracingSink {
    async fn deliver(&self, alert: &Alert) -> SnResult<()> {
        info!(
            candidate_id = alert.event.candidate_id,
            tier = %alert.event.tier,
            xi_corrected = alert.event.xi_corrected,
            lightcurve_ticks = alert.lightcurve.counts.len(),
            "Alert delivered"
        );
        Ok(())
    }
}

/// Drain `publisher` into `sink` until `shutdown` turns true (or its sender is dropped).
///
/// Alerts already queued at shutdown are still delivered. The task returns the number
/// of alerts the sink accepted.
pub fn spawn_forwarder(
    publisher: Arc<AlertPublisher>,
    sink: Arc<dyn AlertSink>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<u64> {
    tokio::spawn(async move {
        let mut delivered = 0u64;
        loop {
            while let Some(alert) = publisher.try_pop() {
                match sink.deliver(&alert).await {
                    Ok(()) => delivered += 1,
                    Err(e) => warn!(
                        candidate_id = alert.event.candidate_id,
                        error = %e,
                        "Alert delivery failed"
                    ),
                }
            }
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = publisher.notified() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        // Sender gone: one last drain, then stop
                        while let Some(alert) = publisher.try_pop() {
                            if sink.deliver(&alert).await.is_ok() {
                                delivered += 1;
                            }
                        }
                        break;
                    }
                }
            }
        }
        delivered
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn alert(candidate_id: u64) -> Alert {
        Alert {
            event: TriggerEvent {
                candidate_id,
                tier: "basic".to_string(),
                tier_level: 1,
                window_width: Duration::from_millis(500),
                xi: 4.2,
                xi_corrected: 4.1,
                grid_index: 100,
                trigger_utime: 0,
                trigger_time: None,
            },
            lightcurve: Lightcurve {
                start_offset_ticks: -2,
                tick_ms: 2,
                counts: vec![1, 2, 9, 3],
            },
        }
    }

    #[test]
    fn test_drop_oldest() {
        let publisher = AlertPublisher::new(2);
        publisher.publish(alert(1)).unwrap();
        publisher.publish(alert(2)).unwrap();
        let err = publisher.publish(alert(3)).unwrap_err();
        assert!(matches!(err, SnError::DownstreamBackpressure { dropped: 1 }));
        assert!(!err.is_fatal());
        assert_eq!(publisher.dropped(), 1);
        assert_eq!(publisher.published(), 3);
        assert_eq!(publisher.try_pop().unwrap().event.candidate_id, 2);
        assert_eq!(publisher.try_pop().unwrap().event.candidate_id, 3);
        assert!(publisher.is_empty());
    }

    #[tokio::test]
    async fn test_forwarder_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alerts.jsonl");
        let sink: Arc<dyn AlertSink> = Arc::new(JsonLinesSink::open(&path).unwrap());
        let publisher = Arc::new(AlertPublisher::new(8));
        let (tx, rx) = watch::channel(false);
        let handle = spawn_forwarder(publisher.clone(), sink, rx);

        publisher.publish(alert(1)).unwrap();
        publisher.publish(alert(2)).unwrap();
        tx.send(true).unwrap();
        assert_eq!(handle.await.unwrap(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let alerts: Vec<Alert> = text
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(alerts, vec![alert(1), alert(2)]);
    }
}
