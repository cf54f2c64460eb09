//! Alignment of 1.6384 ms scaler slots onto the 2 ms analysis grid.
//!
//! Slots do not divide the grid evenly, so a slot that straddles a tick boundary
//! has its hits split between the two ticks in proportion to the overlap. The
//! share that lands after the boundary (the carry) is rounded half up:
//!
//! ```text
//! carry = round_half_up(count * (slot_end - boundary) / SCALER_UDT)
//! ```
//!
//! evaluated exactly in integer arithmetic so long runs cannot drift.
//!
//! A slot is owned by the tick whose end it does not pass at its start: a slot that
//! begins exactly on a boundary stays whole in the earlier tick.
//!
//! Each module keeps an open accumulator for the most recent tick it touched. Hits
//! for that tick (including a carry) are held until a later tick receives hits or the
//! module's record stream ends, so a tick split across two records is emitted once.

use crate::error::SnError;
use crate::payload::{slots_end, GRID_UDT, SCALER_UDT};
use tracing::warn;

const SLOT: i64 = SCALER_UDT as i64;
const GRID: i64 = GRID_UDT as i64;

/// Hits assigned to one grid tick for one module.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GridSample {
    /// 2 ms ticks since the grid origin
    pub grid_index: u64,
    /// Module column in the stream buffer
    pub module_index: usize,
    /// Hits in the tick
    pub count: u32,
}

/// What happened while rebinning one record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebinReport {
    /// The record did not continue the module's previous record
    pub discontinuity: bool,
    /// Hits that fell before the grid origin and were discarded
    pub before_origin: u64,
    /// The record's time span cannot be placed on the grid; nothing was rebinned
    pub out_of_range: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct ModuleState {
    /// Open accumulator: (tick, hits)
    open: Option<(i64, u32)>,
    /// Record time at which the next contiguous record starts
    expected_next: Option<u64>,
}

/// Per-module rebinning state for the whole array.
#[derive(Debug)]
pub struct Rebinner {
    origin: Option<u64>,
    states: Vec<ModuleState>,
    discontinuities: u64,
}

/// Tick owning a slot that starts at `start` (relative to the origin).
fn slot_tick(start: i64) -> i64 {
    if start <= 0 {
        start.div_euclid(GRID)
    } else {
        (start - 1).div_euclid(GRID)
    }
}

fn round_half_up_carry(overlap: i64, count: u32) -> u32 {
    // overlap < SLOT, so the result never exceeds count
    ((2 * overlap * i64::from(count) + SLOT) / (2 * SLOT)) as u32
}

impl Rebinner {
    /// State for `modules` columns. The grid origin is taken from the first record.
    pub fn new(modules: usize) -> Self {
        Self {
            origin: None,
            states: vec![ModuleState::default(); modules],
            discontinuities: 0,
        }
    }

    /// State with an explicit grid origin.
    pub fn with_origin(modules: usize, origin: u64) -> Self {
        let mut rebinner = Self::new(modules);
        rebinner.origin = Some(origin);
        rebinner
    }

    /// Record time of grid tick 0, once known.
    pub fn origin(&self) -> Option<u64> {
        self.origin
    }

    /// Clock discontinuities seen so far.
    pub fn discontinuities(&self) -> u64 {
        self.discontinuities
    }

    /// Hits held in open accumulators across all modules.
    pub fn pending_hits(&self) -> u64 {
        self.states
            .iter()
            .filter_map(|s| s.open.map(|(_, n)| u64::from(n)))
            .sum()
    }

    /// Rebin one record's scalers for the module at `module_index`.
    ///
    /// Completed ticks are appended to `out`. The module must be a valid column.
    pub fn rebin(
        &mut self,
        module_index: usize,
        module_id: u64,
        record_time: u64,
        scalers: &[u8],
        out: &mut Vec<GridSample>,
    ) -> RebinReport {
        let mut report = RebinReport::default();
        let Some(record_end) = slots_end(record_time, scalers.len()) else {
            report.out_of_range = true;
            return report;
        };
        let origin = *self.origin.get_or_insert(record_time);
        let Ok(rel) = i64::try_from(i128::from(record_time) - i128::from(origin)) else {
            report.out_of_range = true;
            return report;
        };
        let Some(state) = self.states.get_mut(module_index) else {
            return report;
        };

        if let Some(expected) = state.expected_next {
            let drift = record_time as i128 - expected as i128;
            if drift < -(i128::from(SLOT) / 2) || drift > i128::from(GRID) {
                let err = SnError::ClockDiscontinuity {
                    module_id,
                    expected,
                    actual: record_time,
                };
                warn!(module_index, %err, "Resynchronizing module");
                Self::close(state, module_index, out);
                self.discontinuities += 1;
                report.discontinuity = true;
            }
        }

        for (k, &count) in scalers.iter().enumerate() {
            if count == 0 {
                continue;
            }
            let count = u32::from(count);
            let start = rel + k as i64 * SLOT;
            let end = start + SLOT;
            let tick = slot_tick(start);
            let boundary = (tick + 1) * GRID;

            if end <= boundary || start >= boundary {
                report.before_origin += Self::add(state, module_index, tick, count, out);
            } else {
                let carry = round_half_up_carry(end - boundary, count);
                report.before_origin +=
                    Self::add(state, module_index, tick, count - carry, out);
                report.before_origin += Self::add(state, module_index, tick + 1, carry, out);
            }
        }

        let end = rel + scalers.len() as i64 * SLOT;
        // A following record can only reach the tick containing `end` or later
        if let Some((tick, _)) = state.open {
            if tick < slot_tick(end) {
                Self::close(state, module_index, out);
            }
        }
        state.expected_next = Some(record_end);
        report
    }

    /// Add hits to a tick; returns hits discarded for lying before the origin.
    fn add(
        state: &mut ModuleState,
        module_index: usize,
        tick: i64,
        hits: u32,
        out: &mut Vec<GridSample>,
    ) -> u64 {
        if hits == 0 {
            return 0;
        }
        if tick < 0 {
            return u64::from(hits);
        }
        match state.open.map(|(open_tick, _)| open_tick) {
            Some(open_tick) if open_tick == tick => {
                if let Some((_, n)) = state.open.as_mut() {
                    *n += hits;
                }
            }
            // Late hits for an already closed tick go out on their own
            Some(open_tick) if open_tick > tick => out.push(GridSample {
                grid_index: tick as u64,
                module_index,
                count: hits,
            }),
            _ => {
                Self::close(state, module_index, out);
                state.open = Some((tick, hits));
            }
        }
        0
    }

    fn close(state: &mut ModuleState, module_index: usize, out: &mut Vec<GridSample>) {
        if let Some((tick, count)) = state.open.take() {
            out.push(GridSample {
                grid_index: tick as u64,
                module_index,
                count,
            });
        }
    }

    /// Emit the module's held hits, e.g. when its stream ends.
    pub fn flush(&mut self, module_index: usize) -> Option<GridSample> {
        let state = self.states.get_mut(module_index)?;
        let mut out = Vec::with_capacity(1);
        Self::close(state, module_index, &mut out);
        out.pop()
    }

    /// Emit every module's held hits. Called at end of stream.
    pub fn flush_all(&mut self, out: &mut Vec<GridSample>) {
        for (module_index, state) in self.states.iter_mut().enumerate() {
            Self::close(state, module_index, out);
        }
    }

    /// Forget all per-module state and the origin (stream restart).
    pub fn clear(&mut self) {
        self.origin = None;
        self.states.iter_mut().for_each(|s| *s = ModuleState::default());
    }
}
