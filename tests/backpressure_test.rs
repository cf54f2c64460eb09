//! Alert queue behaviour when the downstream consumer falls behind.
//!
//! Publishing must never block the analysis path: a full queue evicts its oldest
//! alert and reports the loss instead.

use async_trait::async_trait;
use parking_lot::Mutex;
use sndaq::error::{SnError, SnResult};
use sndaq::publish::{spawn_forwarder, Alert, AlertPublisher, AlertSink, Lightcurve};
use sndaq::TriggerEvent;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::watch;

fn alert(candidate_id: u64) -> Alert {
    Alert {
        event: TriggerEvent {
            candidate_id,
            tier: "basic".to_string(),
            tier_level: 1,
            window_width: Duration::from_millis(500),
            xi: 5.0,
            xi_corrected: 5.0,
            grid_index: candidate_id * 1000,
            trigger_utime: 0,
            trigger_time: None,
        },
        lightcurve: Lightcurve {
            start_offset_ticks: 0,
            tick_ms: 2,
            counts: vec![0; 16],
        },
    }
}

/// Sink that takes 5 ms per alert and remembers what it saw.
#[derive(Default)]
struct SlowSink {
    seen: Mutex<Vec<u64>>,
}

#[async_trait]
impl AlertSink for SlowSink {
    async fn deliver(&self, alert: &Alert) -> SnResult<()> {
        tokio::time::sleep(Duration::from_millis(5)).await;
        self.seen.lock().push(alert.event.candidate_id);
        Ok(())
    }
}

#[test]
fn test_concurrent_publishers_never_block() {
    const CAPACITY: usize = 16;
    const PER_THREAD: u64 = 250;
    let publisher = Arc::new(AlertPublisher::new(CAPACITY));

    let start = Instant::now();
    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            let publisher = publisher.clone();
            thread::spawn(move || {
                let mut backpressure = 0;
                for i in 0..PER_THREAD {
                    match publisher.publish(alert(t * PER_THREAD + i)) {
                        Ok(()) => {}
                        Err(SnError::DownstreamBackpressure { .. }) => backpressure += 1,
                        Err(e) => panic!("unexpected error: {e}"),
                    }
                }
                backpressure
            })
        })
        .collect();
    let reported: u64 = handles.into_iter().map(|h| h.join().unwrap()).sum();
    assert!(start.elapsed() < Duration::from_secs(5));

    let total = 4 * PER_THREAD;
    assert_eq!(publisher.published(), total);
    assert_eq!(publisher.len(), CAPACITY);
    assert_eq!(publisher.dropped(), total - CAPACITY as u64);
    assert_eq!(reported, publisher.dropped());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_slow_sink_keeps_newest_alerts() {
    let publisher = Arc::new(AlertPublisher::new(4));
    let sink = Arc::new(SlowSink::default());
    let (tx, rx) = watch::channel(false);
    let forwarder = spawn_forwarder(publisher.clone(), sink.clone(), rx);

    for id in 1..=100 {
        let _ = publisher.publish(alert(id));
    }
    tx.send(true).unwrap();
    let delivered = forwarder.await.unwrap();

    let seen = sink.seen.lock().clone();
    assert_eq!(delivered, seen.len() as u64);
    assert_eq!(delivered + publisher.dropped(), 100);
    assert!(publisher.dropped() > 0);
    // Survivors arrive in publish order and the newest alert is never lost
    assert!(seen.windows(2).all(|w| w[0] < w[1]));
    assert_eq!(seen.last(), Some(&100));
    assert!(publisher.is_empty());
}
