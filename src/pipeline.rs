//! Per-stream processing loop: decode, rebin, buffer, statistics, trigger.
//!
//! Records from all modules enter through [`Pipeline::process_record`] in roughly
//! time order. Their hits are rebinned onto the 2 ms grid and staged; a tick is
//! committed once the newest record time has passed its end by `reorder_slack`, so
//! every module has had the chance to report it. Each committed tick runs the
//! statistics for every window width and feeds the trigger.
//!
//! The pipeline owns every mutable stage and is driven by one task. Alerts leave
//! through the non-blocking [`AlertPublisher`].

use crate::background::BackgroundEstimator;
use crate::buffer::{BufferLayout, StageOutcome, StreamBuffer};
use crate::changepoint::{ChangepointDetector, NoopChangepoint};
use crate::config::{duration_to_ticks, SnConfig, GRID_MS};
use crate::detector::DetectorModel;
use crate::error::{SnError, SnResult};
use crate::payload::{RecordSource, TelemetryRecord, GRID_UDT};
use crate::publish::{Alert, AlertPublisher, Lightcurve};
use crate::rebin::{GridSample, Rebinner};
use crate::seasonal::SeasonalCorrector;
use crate::significance::{AnalysisWindowResult, SignificanceEngine};
use crate::trigger::{Resolution, TriggerEvaluator, TriggerEvent};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, info_span, warn, Instrument};

/// Operator-facing counters of everything the pipeline dropped or recovered from.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct IngestCounters {
    /// Records handed to the pipeline
    pub records: u64,
    /// Records skipped as malformed (including oversized ones)
    pub malformed: u64,
    /// Records from module ids absent from the detector table
    pub unknown_module: u64,
    /// Records from modules that do not take part in the search
    pub invalid_module: u64,
    /// Module clock discontinuities
    pub clock_discontinuity: u64,
    /// Rebinned samples that arrived after their tick was committed
    pub late_samples: u64,
    /// Records reaching beyond the staging horizon
    pub oversized_records: u64,
    /// Hits in slots before the grid origin, discarded
    pub before_origin_hits: u64,
    /// Committed ticks
    pub ticks: u64,
    /// Trigger events emitted
    pub triggers: u64,
    /// Alerts lost to a full publish queue
    pub alerts_dropped: u64,
}

/// Everything produced by one committed tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickOutput {
    /// Committed tick
    pub grid_index: u64,
    /// One result per window width with enough qualified modules
    pub results: Vec<AnalysisWindowResult>,
    /// Tier crossings on this tick
    pub events: Vec<TriggerEvent>,
    /// Excursion that resolved on this tick
    pub resolved: Option<Resolution>,
}

#[derive(Debug)]
struct PendingAlert {
    event: TriggerEvent,
    pre: Vec<u32>,
    post: Vec<u32>,
}

impl PendingAlert {
    fn into_alert(self) -> Alert {
        let start_offset_ticks = 1 - self.pre.len() as i64;
        let mut counts = self.pre;
        counts.extend(self.post);
        Alert {
            event: self.event,
            lightcurve: Lightcurve {
                start_offset_ticks,
                tick_ms: GRID_MS,
                counts,
            },
        }
    }
}

/// Single-stream supernova search.
pub struct Pipeline {
    detector: Arc<DetectorModel>,
    rebinner: Rebinner,
    buffer: StreamBuffer,
    background: BackgroundEstimator,
    significance: SignificanceEngine,
    seasonal: SeasonalCorrector,
    trigger: TriggerEvaluator,
    changepoint: Box<dyn ChangepointDetector>,
    publisher: Option<Arc<AlertPublisher>>,
    pending_alerts: Vec<PendingAlert>,
    counters: IngestCounters,
    samples: Vec<GridSample>,
    newest_time: u64,
    ahead_streak: usize,
    time_base_set: bool,
    slack_udt: u64,
    epoch_year: Option<i32>,
    lightcurve_pre: usize,
    lightcurve_post: usize,
    bin_seconds: f64,
    max_consecutive_malformed: u32,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("modules", &self.detector.len())
            .field("front", &self.buffer.front())
            .field("counters", &self.counters)
            .finish_non_exhaustive()
    }
}

impl Pipeline {
    /// Build every stage for `detector` from a validated configuration.
    pub fn new(config: SnConfig, detector: Arc<DetectorModel>) -> SnResult<Self> {
        config.validate().map_err(SnError::Configuration)?;
        let modules = detector.len();
        let analysis = &config.analysis;
        let lightcurve_pre = duration_to_ticks(config.publish.lightcurve_pre) as usize;
        let lightcurve_post = duration_to_ticks(config.publish.lightcurve_post) as usize;

        let layout = BufferLayout::new(
            analysis,
            modules,
            config.timing.staging_ticks,
            lightcurve_pre + 1,
        );
        let participating = (0..modules).map(|i| detector.participates(i)).collect();
        let significance =
            SignificanceEngine::new(analysis, detector.efficiencies(), participating);
        let trigger = TriggerEvaluator::new(&config.trigger);
        let widths: Vec<Duration> = analysis
            .window_widths_ms
            .iter()
            .map(|&ms| Duration::from_millis(ms))
            .collect();
        let seasonal =
            SeasonalCorrector::new(&config.seasonal, &widths, trigger.lowest_threshold());

        info!(
            modules,
            windows = ?analysis.window_widths_ms,
            background = ?analysis.background_window,
            "Pipeline ready"
        );

        let background = BackgroundEstimator::for_layout(&layout);

        Ok(Self {
            rebinner: Rebinner::new(modules),
            buffer: StreamBuffer::new(layout),
            background,
            significance,
            seasonal,
            trigger,
            changepoint: Box::new(NoopChangepoint::default()),
            publisher: None,
            pending_alerts: Vec::new(),
            counters: IngestCounters::default(),
            samples: Vec::new(),
            newest_time: 0,
            ahead_streak: 0,
            time_base_set: false,
            slack_udt: duration_to_ticks(config.timing.reorder_slack) * GRID_UDT,
            epoch_year: config.timing.epoch_year,
            lightcurve_pre,
            lightcurve_post,
            bin_seconds: analysis.base_width_ms() as f64 / 1000.0,
            max_consecutive_malformed: config.ingest.max_consecutive_malformed,
            detector,
        })
    }

    /// Publish alerts to `publisher`.
    pub fn with_publisher(mut self, publisher: Arc<AlertPublisher>) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Replace the changepoint detector.
    pub fn with_changepoint(mut self, detector: Box<dyn ChangepointDetector>) -> Self {
        self.changepoint = detector;
        self
    }

    /// Fix the grid origin instead of taking it from the first record.
    pub fn with_origin(mut self, origin: u64) -> Self {
        self.rebinner = Rebinner::with_origin(self.detector.len(), origin);
        self
    }

    /// Record time of grid tick 0, once known.
    pub fn origin(&self) -> Option<u64> {
        self.rebinner.origin()
    }

    /// Snapshot of the counters.
    pub fn counters(&self) -> IngestCounters {
        let mut counters = self.counters.clone();
        if let Some(publisher) = &self.publisher {
            counters.alerts_dropped = publisher.dropped();
        }
        counters
    }

    /// Shared detector table.
    pub fn detector(&self) -> &Arc<DetectorModel> {
        &self.detector
    }

    /// Stream buffer, for inspection.
    pub fn buffer(&self) -> &StreamBuffer {
        &self.buffer
    }

    /// Background estimator, for inspection.
    pub fn background(&self) -> &BackgroundEstimator {
        &self.background
    }

    /// Significance engine, for inspection.
    pub fn significance(&self) -> &SignificanceEngine {
        &self.significance
    }

    /// Changepoint detector in use.
    pub fn changepoint(&self) -> &dyn ChangepointDetector {
        self.changepoint.as_ref()
    }

    /// Latest atmospheric muon rate, used by the seasonal correction.
    pub fn observe_muon_rate(&mut self, rate_hz: f64) {
        self.seasonal.observe_muon_rate(rate_hz);
    }

    /// Grid tick just past the last hit of a record ending at `record_end`.
    fn reach(record_end: u64, origin: u64) -> u64 {
        // A carry can spill one tick past the record's last slot
        record_end.saturating_sub(origin).saturating_sub(1) / GRID_UDT + 1
    }

    /// Ingest one record and commit every tick it makes ready.
    pub fn process_record(&mut self, record: &TelemetryRecord) -> SnResult<Vec<TickOutput>> {
        self.counters.records += 1;
        let Some(record_end) = record.end_time() else {
            self.counters.malformed += 1;
            warn!(
                module_id = format_args!("{:012x}", record.module_id),
                record_time = record.record_time,
                slots = record.scaler_counts.len(),
                "Record time out of range, dropped"
            );
            return Ok(Vec::new());
        };
        let Some(index) = self.detector.index_of(record.module_id) else {
            self.counters.unknown_module += 1;
            debug!(module_id = format_args!("{:012x}", record.module_id), "Unknown module");
            return Ok(Vec::new());
        };
        if !self.detector.participates(index) {
            self.counters.invalid_module += 1;
            return Ok(Vec::new());
        }

        // Record starts drive the commit horizon; a long record's end must not outrun
        // the other modules' records covering the same interval
        self.newest_time = self.newest_time.max(record.record_time);
        let mut outputs = self.commit_ready()?;

        let origin = self.rebinner.origin().unwrap_or(record.record_time);
        if !self.buffer.can_stage(Self::reach(record_end, origin)) {
            self.ahead_streak += 1;
            // Every module has moved past the horizon: the stream skipped ahead
            if self.ahead_streak > self.detector.len() {
                warn!(
                    record_time = record.record_time,
                    front = self.buffer.front(),
                    "Stream skipped ahead, advancing the grid"
                );
                self.newest_time = self.newest_time.max(record_end);
                outputs.extend(self.commit_ready()?);
            }
            if !self.buffer.can_stage(Self::reach(record_end, origin)) {
                self.counters.oversized_records += 1;
                self.counters.malformed += 1;
                warn!(
                    module_id = format_args!("{:012x}", record.module_id),
                    record_time = record.record_time,
                    slots = record.scaler_counts.len(),
                    "Record reaches beyond the staging horizon, dropped"
                );
                return Ok(outputs);
            }
        }
        self.ahead_streak = 0;

        self.samples.clear();
        let report = self.rebinner.rebin(
            index,
            record.module_id,
            record.record_time,
            &record.scaler_counts,
            &mut self.samples,
        );
        if report.out_of_range {
            self.counters.malformed += 1;
            warn!(
                module_id = format_args!("{:012x}", record.module_id),
                record_time = record.record_time,
                "Record cannot be placed on the grid, dropped"
            );
            return Ok(outputs);
        }
        if report.discontinuity {
            self.counters.clock_discontinuity += 1;
        }
        if report.before_origin > 0 {
            self.counters.before_origin_hits += report.before_origin;
            debug!(hits = report.before_origin, "Hits before the grid origin discarded");
        }
        if !self.time_base_set {
            if let Some(origin) = self.rebinner.origin() {
                self.trigger.set_time_base(origin, self.epoch_year);
                self.time_base_set = true;
            }
        }
        self.stage_samples()?;
        Ok(outputs)
    }

    fn stage_samples(&mut self) -> SnResult<()> {
        for sample in &self.samples {
            if self.buffer.stage(sample)? == StageOutcome::Late {
                self.counters.late_samples += 1;
            }
        }
        Ok(())
    }

    /// Commit ticks whose end lies at least `reorder_slack` before the newest record time.
    fn commit_ready(&mut self) -> SnResult<Vec<TickOutput>> {
        let mut outputs = Vec::new();
        let Some(origin) = self.rebinner.origin() else {
            return Ok(outputs);
        };
        loop {
            let tick_end = origin
                .saturating_add((self.buffer.front() + 1).saturating_mul(GRID_UDT))
                .saturating_add(self.slack_udt);
            if tick_end > self.newest_time {
                break;
            }
            outputs.push(self.commit_one()?);
        }
        Ok(outputs)
    }

    fn commit_one(&mut self) -> SnResult<TickOutput> {
        let committed = self.buffer.commit_tick(&mut self.background);
        self.counters.ticks += 1;
        if let Some((bin, total)) = committed.completed_bin {
            self.changepoint.observe(bin, total as f64 / self.bin_seconds);
        }

        let mut results =
            self.significance
                .evaluate(&self.buffer, &self.background, committed.grid_index)?;
        self.seasonal.apply(&mut results);
        let step = self.trigger.evaluate(committed.grid_index, &results);
        self.counters.triggers += step.events.len() as u64;

        self.advance_alerts(committed.array_total);
        for event in &step.events {
            self.open_alert(event.clone());
        }

        Ok(TickOutput {
            grid_index: committed.grid_index,
            results,
            events: step.events,
            resolved: step.resolved,
        })
    }

    fn open_alert(&mut self, event: TriggerEvent) {
        let pending = PendingAlert {
            event,
            pre: self.buffer.lightcurve(self.lightcurve_pre + 1),
            post: Vec::with_capacity(self.lightcurve_post),
        };
        if self.lightcurve_post == 0 {
            self.release(pending);
        } else {
            self.pending_alerts.push(pending);
        }
    }

    fn advance_alerts(&mut self, array_total: u32) {
        if self.pending_alerts.is_empty() {
            return;
        }
        for pending in &mut self.pending_alerts {
            pending.post.push(array_total);
        }
        let post = self.lightcurve_post;
        let (complete, waiting): (Vec<_>, Vec<_>) = std::mem::take(&mut self.pending_alerts)
            .into_iter()
            .partition(|p| p.post.len() >= post);
        self.pending_alerts = waiting;
        for pending in complete {
            self.release(pending);
        }
    }

    fn release(&mut self, pending: PendingAlert) {
        let Some(publisher) = &self.publisher else {
            return;
        };
        if let Err(e) = publisher.publish(pending.into_alert()) {
            debug!(error = %e, "Alert publish reported backpressure");
        }
        self.counters.alerts_dropped = publisher.dropped();
    }

    /// End of stream: flush held carries, commit everything staged, release alerts.
    pub fn finish(&mut self) -> SnResult<Vec<TickOutput>> {
        self.samples.clear();
        self.rebinner.flush_all(&mut self.samples);
        self.stage_samples()?;

        let mut outputs = Vec::new();
        while self.buffer.front() < self.buffer.staged_until() {
            outputs.push(self.commit_one()?);
        }
        for pending in std::mem::take(&mut self.pending_alerts) {
            self.release(pending);
        }
        info!(
            ticks = self.counters.ticks,
            triggers = self.counters.triggers,
            "Stream finished"
        );
        Ok(outputs)
    }

    /// Drive `source` until it is exhausted.
    ///
    /// Malformed records are skipped and counted; `max_consecutive_malformed` of them
    /// in a row abort with `SystemicCorruption`. Other errors are returned as is. Call
    /// [`Pipeline::finish`] after the last source of a stream.
    pub async fn replay(&mut self, source: &mut dyn RecordSource) -> SnResult<Vec<TriggerEvent>> {
        let span = info_span!("replay", source = %source.describe());
        async move {
            let mut events = Vec::new();
            let mut consecutive = 0u32;
            while let Some(next) = source.next_record().await.transpose() {
                match next {
                    Ok(record) => {
                        consecutive = 0;
                        for output in self.process_record(&record)? {
                            events.extend(output.events);
                        }
                    }
                    Err(SnError::MalformedRecord { offset, reason }) => {
                        self.counters.malformed += 1;
                        consecutive += 1;
                        warn!(offset, %reason, consecutive, "Skipping malformed record");
                        if consecutive >= self.max_consecutive_malformed {
                            return Err(SnError::SystemicCorruption { consecutive });
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
            info!(
                records = self.counters.records,
                malformed = self.counters.malformed,
                "Source exhausted"
            );
            Ok(events)
        }
        .instrument(span)
        .await
    }
}
