// =============================================================================
// Chart — a set of dimensions collected on a common wall-clock grid
// =============================================================================
//
// The chart is the only writer to its dimensions. Producers drive it with,
// in order per cycle:
//
//   1. next_usec(elapsed)       announce the time since the previous done
//   2. set(dimension, value)    record raw samples
//   3. done()                   interpolate onto the grid and write slots
//
// `done` maps producer-timed samples onto the fixed `update_every` grid:
// for every grid boundary crossed since the last call it computes each
// dimension's value at that boundary (linear interpolation for absolute
// values, proportional split for incremental counters), scales it, packs
// it, and writes the ring slot. After `done` returns, `last_updated` is
// always on the grid.
//
// Thread safety: all mutable chart state lives behind one parking_lot
// RwLock. `done` holds the write lock for the whole call (including the
// trailing dimension garbage collection); queries take the read lock and
// therefore never observe a partially written slot.
// =============================================================================

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use parking_lot::{RwLock, RwLockReadGuard};
use tracing::{debug, error, info};

use crate::rrd::dimension::Dimension;
use crate::rrd::persistence::ChartHeader;
use crate::runtime_config::RuntimeConfig;
use crate::storage_number::{pack, SlotFlags, EMPTY_SLOT};
use crate::types::{sanitize_name, Algorithm, ChartType, MemoryMode, Timeval, USEC_PER_SEC};

// =============================================================================
// Mutable chart state
// =============================================================================

/// Everything about a chart that changes after creation. Guarded by the
/// chart's RwLock.
pub struct ChartState {
    pub enabled: bool,
    pub dimensions: Vec<Dimension>,

    /// Next ring slot to write; always in `[0, entries)`.
    pub current_entry: usize,
    /// Total slots ever written.
    pub counter: u64,
    /// Number of times `done` has completed. The authoritative
    /// "have we stored at least one sample" signal.
    pub counter_done: u64,

    /// Elapsed time announced by the producer for the current cycle.
    pub usec_since_last_update: u64,
    /// When the newest slot was written; on the grid after every `done`.
    pub last_updated: Timeval,
    /// When samples were last collected.
    pub last_collected_time: Timeval,
    /// Wall-clock microseconds of the oldest slot still in the ring.
    pub first_entry_t: u64,

    /// Row totals for the percentage algorithms.
    pub collected_total: i64,
    pub last_collected_total: i64,
}

impl ChartState {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            dimensions: Vec::new(),
            current_entry: 0,
            counter: 0,
            counter_done: 0,
            usec_since_last_update: 0,
            last_updated: Timeval::zero(),
            last_collected_time: Timeval::zero(),
            first_entry_t: 0,
            collected_total: 0,
            last_collected_total: 0,
        }
    }
}

// =============================================================================
// Chart
// =============================================================================

/// Immutable creation parameters for a chart, resolved against the config
/// by the registry before construction.
pub struct ChartOptions {
    pub type_name: String,
    /// Fully qualified `type.id`.
    pub id: String,
    pub name: String,
    pub family: String,
    pub title: String,
    pub units: String,
    pub context: String,
    pub chart_type: ChartType,
    pub priority: i64,
    pub entries: usize,
    pub update_every: u32,
    pub memory_mode: MemoryMode,
    pub enabled: bool,
    pub gap_when_lost_iterations_above: u64,
    pub cache_dir: Option<PathBuf>,
    pub config: Arc<RuntimeConfig>,
}

pub struct Chart {
    pub type_name: String,
    /// Fully qualified `type.id`, unique per process.
    pub id: String,
    /// Display name; the config override wins over the producer's choice.
    pub name: String,
    pub family: String,
    pub title: String,
    pub units: String,
    pub context: String,
    pub chart_type: ChartType,
    pub priority: i64,
    /// Ring capacity per dimension.
    pub entries: usize,
    /// Grid cadence in seconds.
    pub update_every: u32,
    pub memory_mode: MemoryMode,
    /// Collection gaps of at least this many cycles store NOT_EXISTS
    /// instead of interpolated values.
    pub gap_when_lost_iterations_above: u64,
    pub cache_dir: Option<PathBuf>,

    /// Verbose interpolation tracing for this chart only.
    pub debug: AtomicBool,

    config: Arc<RuntimeConfig>,
    state: RwLock<ChartState>,
}

impl Chart {
    pub fn new(opts: ChartOptions, restore: Option<ChartHeader>) -> Self {
        let mut state = ChartState::new(opts.enabled);

        // A surviving header resumes the ring geometry and write cursor;
        // collection state always restarts cold so the first cycle after a
        // restart is store-suppressed.
        if let Some(header) = restore {
            state.current_entry = (header.current_entry as usize).min(opts.entries - 1);
            state.counter = header.counter;
            state.last_updated = header.last_updated;
            state.first_entry_t = header.first_entry_t;
        }

        Self {
            type_name: opts.type_name,
            id: opts.id,
            name: opts.name,
            family: opts.family,
            title: opts.title,
            units: opts.units,
            context: opts.context,
            chart_type: opts.chart_type,
            priority: opts.priority,
            entries: opts.entries,
            update_every: opts.update_every,
            memory_mode: opts.memory_mode,
            gap_when_lost_iterations_above: opts.gap_when_lost_iterations_above,
            cache_dir: opts.cache_dir,
            debug: AtomicBool::new(false),
            config: opts.config,
            state: RwLock::new(state),
        }
    }

    /// Read access for queries and the HTTP layer. Lock ordering: callers
    /// holding the registry lock may take this; never the reverse.
    pub fn read_state(&self) -> RwLockReadGuard<'_, ChartState> {
        self.state.read()
    }

    pub fn is_enabled(&self) -> bool {
        self.state.read().enabled
    }

    pub fn counter_done(&self) -> u64 {
        self.state.read().counter_done
    }

    pub fn toggle_debug(&self) -> bool {
        let new = !self.debug.load(Ordering::Relaxed);
        self.debug.store(new, Ordering::Relaxed);
        new
    }

    // =========================================================================
    // Dimensions
    // =========================================================================

    /// Create a dimension if it does not exist yet. Config overrides for
    /// name, algorithm and scaling win over the producer-supplied values.
    /// Returns true when the dimension was added.
    pub fn find_or_add_dimension(
        &self,
        id: &str,
        name: &str,
        algorithm: Algorithm,
        multiplier: i64,
        divisor: i64,
        hidden: bool,
    ) -> bool {
        let mut st = self.state.write();
        if st.dimensions.iter().any(|d| d.id == id) {
            return false;
        }

        let over = self.config.dimension(&self.id, id);
        let name = over
            .and_then(|o| o.name.clone())
            .unwrap_or_else(|| {
                if name.is_empty() {
                    id.to_string()
                } else {
                    name.to_string()
                }
            });
        let algorithm = over.and_then(|o| o.algorithm).unwrap_or(algorithm);
        let multiplier = over.and_then(|o| o.multiplier).unwrap_or(multiplier);
        let divisor = over.and_then(|o| o.divisor).unwrap_or(divisor);
        let hidden = over.and_then(|o| o.hidden).unwrap_or(hidden);

        let cache_file = self
            .cache_dir
            .as_ref()
            .map(|dir| dir.join(format!("{}.db", sanitize_name(id))));

        debug!(chart = %self.id, dimension = id, algorithm = %algorithm, "adding dimension");

        st.dimensions.push(Dimension::new(
            id.to_string(),
            name,
            algorithm,
            multiplier,
            divisor,
            hidden,
            self.entries,
            self.update_every,
            self.memory_mode,
            cache_file,
        ));
        true
    }

    pub fn has_dimension(&self, id: &str) -> bool {
        self.state.read().dimensions.iter().any(|d| d.id == id)
    }

    /// Record a raw sample for a dimension. Returns false when the
    /// dimension does not exist (the caller logs; this is not a protocol
    /// fault).
    pub fn set(&self, id: &str, value: i64) -> bool {
        self.set_at(id, value, Timeval::now())
    }

    pub fn set_at(&self, id: &str, value: i64, now: Timeval) -> bool {
        let mut st = self.state.write();
        match st.dimensions.iter_mut().find(|d| d.id == id) {
            Some(d) => {
                d.set(value, now);
                true
            }
            None => false,
        }
    }

    // =========================================================================
    // Cycle boundaries
    // =========================================================================

    /// Announce the microseconds elapsed since the previous `done`.
    pub fn next_usec(&self, microseconds: u64) {
        self.state.write().usec_since_last_update = microseconds;
    }

    /// Announce a new cycle, deriving the elapsed time from the wall clock.
    pub fn next(&self) {
        let elapsed = {
            let st = self.state.read();
            if st.last_collected_time.is_zero() {
                0
            } else {
                Timeval::now().usec_since(&st.last_collected_time)
            }
        };
        self.next_usec(elapsed);
    }

    /// Complete a collection cycle: interpolate the collected samples onto
    /// the grid, write ring slots, and roll the per-dimension state.
    pub fn done(&self) {
        self.done_at(Timeval::now());
    }

    /// `done` with an explicit wall clock. The clock is consulted only when
    /// the chart has no collection history (first cycle or after a reset).
    pub fn done_at(&self, now: Timeval) {
        let entries = self.entries as u64;
        let ue_usec = self.update_every as u64 * USEC_PER_SEC;
        let trace = self.debug.load(Ordering::Relaxed);

        let mut guard = self.state.write();
        let st = &mut *guard;
        let mut store_this_entry = true;

        // ── Clock repair ────────────────────────────────────────────────
        // A gap the ring cannot bridge: start over and charge one cycle.
        if st.usec_since_last_update > entries * ue_usec {
            info!(
                chart = %self.id,
                secs = st.usec_since_last_update / USEC_PER_SEC,
                "took too long to be updated, resetting"
            );
            Self::reset_state(st);
            st.usec_since_last_update = ue_usec;
        }

        // ── Collection time bookkeeping ─────────────────────────────────
        if st.last_collected_time.is_zero() {
            st.last_collected_time = now;
            store_this_entry = false;
        } else {
            let ut = st.last_collected_time.as_usec() + st.usec_since_last_update;
            st.last_collected_time = Timeval::from_usec(ut);
        }

        // The first interpolation window needs a well-defined left edge:
        // back-date last_updated by the announced elapsed time (one full
        // cycle when the producer announced nothing).
        if st.last_updated.is_zero() {
            if st.usec_since_last_update == 0 {
                st.usec_since_last_update = ue_usec;
            }
            let ut = st
                .last_collected_time
                .as_usec()
                .saturating_sub(st.usec_since_last_update);
            st.last_updated = Timeval::from_usec(ut);
            store_this_entry = false;
        }

        // Still too far apart: the whole ring would be rewritten.
        if st.last_collected_time.usec_since(&st.last_updated) > entries * ue_usec {
            info!(chart = %self.id, "data too old, resetting");
            Self::reset_state(st);
            st.usec_since_last_update = ue_usec;
            st.last_collected_time = now;
            let ut = st
                .last_collected_time
                .as_usec()
                .saturating_sub(st.usec_since_last_update);
            st.last_updated = Timeval::from_usec(ut);
            store_this_entry = false;
        }

        // ── Time math ───────────────────────────────────────────────────
        // last_ut = left edge of the window, now_ut = sample time,
        // next_ut = the next grid boundary to fill.
        let mut last_ut = st.last_updated.as_usec();
        let now_ut = st.last_collected_time.as_usec();
        let mut next_ut = (st.last_updated.sec as u64 + self.update_every as u64) * USEC_PER_SEC;

        if st.counter_done == 0 {
            store_this_entry = false;
        }
        st.counter_done += 1;
        let first_cycle = st.counter_done == 1;

        if trace {
            debug!(
                chart = %self.id,
                last_ut, now_ut, next_ut, store_this_entry,
                "interpolation window"
            );
        }

        // ── Per-dimension preparation ───────────────────────────────────
        let collected_total: i64 = st.dimensions.iter().map(|d| d.collected_value).sum();
        let last_collected_total = st.last_collected_total;
        st.collected_total = collected_total;

        let mut storage_flags = SlotFlags::Exists;

        for rd in st.dimensions.iter_mut() {
            match rd.algorithm {
                Algorithm::Absolute => {
                    rd.calculated_value = rd.collected_value as f64;
                }
                Algorithm::Incremental => {
                    // A counter that went backwards wrapped or reset: flag
                    // the slot about to be written and make this cycle's
                    // delta zero.
                    if rd.last_collected_value > rd.collected_value {
                        storage_flags = SlotFlags::ExistsReset;
                        rd.last_collected_value = rd.collected_value;
                    }
                    rd.calculated_value +=
                        (rd.collected_value - rd.last_collected_value) as f64;
                }
                Algorithm::PctOfRow => {
                    if collected_total == 0 {
                        rd.calculated_value = 0.0;
                    } else {
                        rd.calculated_value =
                            100.0 * rd.collected_value as f64 / collected_total as f64;
                    }
                }
                Algorithm::PctOfDiffRow => {
                    if collected_total == last_collected_total {
                        rd.calculated_value = rd.last_calculated_value;
                    } else {
                        rd.calculated_value = 100.0
                            * (rd.collected_value - rd.last_collected_value) as f64
                            / (collected_total - last_collected_total) as f64;
                    }
                }
            }

            if trace {
                debug!(
                    chart = %self.id,
                    dimension = %rd.id,
                    collected = rd.collected_value,
                    calculated = rd.calculated_value,
                    "prepared"
                );
            }
        }

        // ── Interpolation loop ──────────────────────────────────────────
        let first_ut = last_ut;
        let mut iterations = (now_ut.saturating_sub(last_ut) / ue_usec) as i64;
        let gap = self.gap_when_lost_iterations_above as i64;

        while next_ut <= now_ut {
            st.last_updated = Timeval {
                sec: (next_ut / USEC_PER_SEC) as i64,
                usec: 0,
            };

            let slot = st.current_entry;
            for rd in st.dimensions.iter_mut() {
                let new_value = match rd.algorithm {
                    Algorithm::Incremental => {
                        // The portion of the accumulated delta that fell
                        // inside [last_ut, next_ut].
                        let nv = rd.calculated_value * (next_ut - last_ut) as f64
                            / (now_ut - last_ut) as f64;
                        rd.calculated_value -= nv;
                        nv
                    }
                    _ => {
                        let nv = (rd.calculated_value - rd.last_calculated_value)
                            * (next_ut - first_ut) as f64
                            / (now_ut - first_ut) as f64
                            + rd.last_calculated_value;
                        if next_ut + ue_usec > now_ut {
                            rd.calculated_value = nv;
                        }
                        nv
                    }
                };

                if !store_this_entry {
                    rd.store_slot(slot, EMPTY_SLOT);
                    continue;
                }

                if rd.updated && iterations < gap {
                    let scaled = new_value * rd.scale();
                    rd.store_slot(slot, pack(scaled, storage_flags));
                    if trace {
                        debug!(
                            chart = %self.id,
                            dimension = %rd.id,
                            slot,
                            value = scaled,
                            reset = matches!(storage_flags, SlotFlags::ExistsReset),
                            "stored"
                        );
                    }
                } else {
                    rd.store_slot(slot, pack(0.0, SlotFlags::NotExists));
                    if trace {
                        debug!(chart = %self.id, dimension = %rd.id, slot, "stored gap");
                    }
                }
            }

            // Suppression covers exactly one grid step; the reset flag
            // covers exactly one stored sample.
            store_this_entry = true;
            storage_flags = SlotFlags::Exists;

            if st.first_entry_t != 0 && st.counter >= entries {
                // the ring is full; the oldest slot is being overwritten
                st.first_entry_t += ue_usec;
            }
            st.counter += 1;
            st.current_entry = if st.current_entry + 1 >= self.entries {
                0
            } else {
                st.current_entry + 1
            };
            if st.first_entry_t == 0 {
                st.first_entry_t = next_ut;
            }

            last_ut = next_ut;
            next_ut += ue_usec;
            iterations -= 1;
        }

        // ── Roll per-dimension state ────────────────────────────────────
        for rd in st.dimensions.iter_mut() {
            if !rd.updated {
                continue;
            }
            rd.last_collected_value = rd.collected_value;
            rd.last_calculated_value = rd.calculated_value;
            rd.collected_value = 0;
            rd.updated = false;

            // The very first cycle of a delta-based dimension must not
            // leave a residual, or the next cycle stores a spike.
            if first_cycle && rd.algorithm.is_delta_based() {
                rd.calculated_value = 0.0;
            }
        }
        st.last_collected_total = collected_total;

        // ── Garbage-collect abandoned dimensions ────────────────────────
        let horizon = st.last_collected_time.sec - 10 * self.update_every as i64;
        let mut removed = false;
        let mut i = 0;
        while i < st.dimensions.len() {
            if st.dimensions[i].last_collected_time.sec < horizon {
                let mut dim = st.dimensions.remove(i);
                info!(chart = %self.id, dimension = %dim.id, "removing obsolete dimension");
                if let Err(e) = dim.save() {
                    error!(chart = %self.id, dimension = %dim.id, error = %e, "failed to save dimension before removal");
                }
                removed = true;
            } else {
                i += 1;
            }
        }
        if removed && st.dimensions.is_empty() {
            info!(chart = %self.id, "all dimensions removed, disabling chart");
            st.enabled = false;
        }
    }

    fn reset_state(st: &mut ChartState) {
        st.last_collected_time = Timeval::zero();
        st.last_updated = Timeval::zero();
        st.current_entry = 0;
        st.counter = 0;
        st.counter_done = 0;
        st.first_entry_t = 0;
        for rd in st.dimensions.iter_mut() {
            rd.last_collected_time = Timeval::zero();
            rd.clear_ring();
        }
    }

    // =========================================================================
    // Slot / time arithmetic (used by the query engine)
    // =========================================================================

    /// Slots currently holding data.
    pub fn stored_slots(&self, st: &ChartState) -> usize {
        st.counter.min(self.entries as u64) as usize
    }

    /// Timestamp of the newest slot.
    pub fn last_entry_t(&self, st: &ChartState) -> i64 {
        st.last_updated.sec
    }

    /// Timestamp of the oldest slot still in the ring.
    pub fn first_entry_t(&self, st: &ChartState) -> i64 {
        let stored = self.stored_slots(st).saturating_sub(1) as i64;
        self.last_entry_t(st) - stored * self.update_every as i64
    }

    /// Index of the newest written slot.
    pub fn last_slot(&self, st: &ChartState) -> usize {
        if st.current_entry == 0 {
            self.entries - 1
        } else {
            st.current_entry - 1
        }
    }

    /// Index of the oldest written slot.
    pub fn first_slot(&self, st: &ChartState) -> usize {
        if st.counter >= self.entries as u64 {
            st.current_entry % self.entries
        } else {
            0
        }
    }

    /// Map a wall-clock second to a slot index. Always in range: times
    /// outside the ring clamp to the first or last slot.
    pub fn time2slot(&self, st: &ChartState, t: i64) -> usize {
        if self.stored_slots(st) == 0 {
            return 0;
        }
        if t >= self.last_entry_t(st) {
            return self.last_slot(st);
        }
        if t <= self.first_entry_t(st) {
            return self.first_slot(st);
        }
        let back = ((self.last_entry_t(st) - t) / self.update_every as i64) as usize;
        (self.last_slot(st) + self.entries - back) % self.entries
    }

    /// Map a slot index back to the wall-clock second it represents.
    pub fn slot2time(&self, st: &ChartState, slot: usize) -> i64 {
        let back = (self.last_slot(st) + self.entries - slot) % self.entries;
        self.last_entry_t(st) - back as i64 * self.update_every as i64
    }

    // =========================================================================
    // Persistence
    // =========================================================================

    fn header(&self, st: &ChartState) -> ChartHeader {
        ChartHeader {
            id: self.id.clone(),
            entries: self.entries as u64,
            update_every: self.update_every,
            current_entry: st.current_entry as u32,
            counter: st.counter,
            counter_done: st.counter_done,
            last_updated: st.last_updated,
            last_collected_time: st.last_collected_time,
            first_entry_t: st.first_entry_t,
        }
    }

    /// Flush the chart header and every dimension ring to disk. A no-op
    /// for ram charts.
    pub fn save(&self) -> Result<()> {
        if !self.memory_mode.is_persistent() {
            return Ok(());
        }
        let mut st = self.state.write();
        if let Some(dir) = &self.cache_dir {
            let header = self.header(&st);
            header.save(&dir.join("main.db"))?;
        }
        for rd in st.dimensions.iter_mut() {
            rd.save()?;
        }
        Ok(())
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage_number::Slot;

    const T0: i64 = 1_700_000_000;

    fn chart(entries: usize, update_every: u32) -> Chart {
        Chart::new(
            ChartOptions {
                type_name: "t".into(),
                id: "t.test".into(),
                name: "t.test".into(),
                family: "test".into(),
                title: "test chart".into(),
                units: "units".into(),
                context: "t.test".into(),
                chart_type: ChartType::Line,
                priority: 1000,
                entries,
                update_every,
                memory_mode: MemoryMode::Ram,
                enabled: true,
                gap_when_lost_iterations_above: 5,
                cache_dir: None,
                config: Arc::new(RuntimeConfig::default()),
            },
            None,
        )
    }

    fn tv(sec: i64) -> Timeval {
        Timeval { sec, usec: 0 }
    }

    /// Drive one aligned one-second cycle: announce, set, done.
    fn cycle(c: &Chart, sets: &[(&str, i64)], at_sec: i64) {
        if c.counter_done() > 0 {
            c.next_usec(USEC_PER_SEC);
        }
        for (id, v) in sets {
            c.set_at(id, *v, tv(at_sec));
        }
        c.done_at(tv(at_sec));
    }

    fn slot_values(c: &Chart, dim: &str) -> Vec<Slot> {
        let st = c.read_state();
        let d = st.dimensions.iter().find(|d| d.id == dim).unwrap();
        (0..c.entries).map(|i| d.slot(i)).collect()
    }

    fn present(slot: &Slot) -> f64 {
        match slot {
            Slot::Present { value, .. } => *value,
            Slot::Missing => panic!("expected a stored value, found missing slot"),
        }
    }

    #[test]
    fn linear_incremental_aligned_clock() {
        let c = chart(10, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Incremental, 1, 1, false);

        for k in 0..6 {
            cycle(&c, &[("d", k * 1000)], T0 + k);
        }

        let slots = slot_values(&c, "d");
        // First cycle is store-suppressed; the following five each store
        // the full per-second delta.
        assert_eq!(slots[0], Slot::Missing);
        for i in 1..6 {
            let v = present(&slots[i]);
            assert!((v - 1000.0).abs() < 1.0, "slot {i} holds {v}");
        }
        for slot in slots.iter().skip(6) {
            assert_eq!(*slot, Slot::Missing);
        }

        let st = c.read_state();
        assert_eq!(st.last_updated.sec, T0 + 5);
        assert_eq!(st.last_updated.usec, 0);
        assert_eq!(st.counter, 6);
        assert_eq!(st.counter_done, 6);
        assert_eq!(st.current_entry, 6);
    }

    #[test]
    fn misaligned_microseconds_split_the_delta() {
        let c = chart(10, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Incremental, 1, 1, false);

        // Warm up on the grid.
        cycle(&c, &[("d", 0)], T0);
        cycle(&c, &[("d", 1000)], T0 + 1);

        // 1.5s late, then 0.5s to land back on the grid. Total delta 3000.
        c.next_usec(1_500_000);
        c.set_at("d", 2500, tv(T0 + 2));
        c.done_at(tv(T0 + 2));

        c.next_usec(500_000);
        c.set_at("d", 4000, tv(T0 + 3));
        c.done_at(tv(T0 + 3));

        let slots = slot_values(&c, "d");
        // Slot 2 holds the portion that fell before the boundary
        // (two thirds of 1500 = 1000), slot 3 the remainder plus the next
        // cycle's share; together they cover the full 3000.
        let a = present(&slots[2]);
        let b = present(&slots[3]);
        assert!((a - 1000.0).abs() < 1.0, "first split slot holds {a}");
        assert!((a + b - 3000.0).abs() < 1.0, "sum {a} + {b}");

        let st = c.read_state();
        assert_eq!(st.last_updated.sec, T0 + 3);
        assert_eq!(st.last_updated.usec, 0);
    }

    #[test]
    fn counter_wrap_stores_reset_then_resumes() {
        let c = chart(10, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Incremental, 1, 1, false);

        for (k, v) in [10, 20, 5, 15].iter().enumerate() {
            cycle(&c, &[("d", *v)], T0 + k as i64);
        }

        let slots = slot_values(&c, "d");
        assert_eq!(slots[0], Slot::Missing);
        assert_eq!(present(&slots[1]).round(), 10.0);
        // The wrap cycle stores a flagged zero, the next the fresh delta.
        match slots[2] {
            Slot::Present { value, reset } => {
                assert_eq!(value.round(), 0.0);
                assert!(reset);
            }
            Slot::Missing => panic!("wrap cycle must store a flagged zero"),
        }
        match slots[3] {
            Slot::Present { value, reset } => {
                assert_eq!(value.round(), 10.0);
                assert!(!reset, "reset covers exactly one stored sample");
            }
            Slot::Missing => panic!("post-wrap cycle must store"),
        }
    }

    #[test]
    fn missing_dimension_stores_not_exists() {
        let c = chart(10, 1);
        c.find_or_add_dimension("a", "a", Algorithm::Absolute, 1, 1, false);
        c.find_or_add_dimension("b", "b", Algorithm::Absolute, 1, 1, false);

        cycle(&c, &[("a", 1), ("b", 1)], T0);
        cycle(&c, &[("a", 2)], T0 + 1); // b skips this cycle
        cycle(&c, &[("a", 3), ("b", 3)], T0 + 2);

        let a = slot_values(&c, "a");
        let b = slot_values(&c, "b");
        assert!(matches!(a[1], Slot::Present { .. }));
        assert_eq!(b[1], Slot::Missing);
        assert!(matches!(b[2], Slot::Present { .. }));
    }

    #[test]
    fn percentage_of_row_sums_to_hundred() {
        let c = chart(10, 1);
        for id in ["x", "y", "z"] {
            c.find_or_add_dimension(id, id, Algorithm::PctOfRow, 1, 1, false);
        }

        cycle(&c, &[("x", 50), ("y", 30), ("z", 20)], T0);
        cycle(&c, &[("x", 50), ("y", 30), ("z", 20)], T0 + 1);

        let x = present(&slot_values(&c, "x")[1]);
        let y = present(&slot_values(&c, "y")[1]);
        let z = present(&slot_values(&c, "z")[1]);
        assert!((x - 50.0).abs() < 0.1, "x = {x}");
        assert!((y - 30.0).abs() < 0.1, "y = {y}");
        assert!((z - 20.0).abs() < 0.1, "z = {z}");
        assert!((x + y + z - 100.0).abs() < 0.1);
    }

    #[test]
    fn first_cycle_with_no_elapsed_time_lands_on_grid() {
        let c = chart(10, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);

        // No next_usec at all before the first done: the engine must force
        // a one-cycle back-date so the window is well-defined.
        c.set_at("d", 7, tv(T0));
        c.done_at(tv(T0));

        let st = c.read_state();
        assert_eq!(st.last_updated.sec, T0);
        assert_eq!(st.last_updated.usec, 0);
        assert_eq!(st.counter_done, 1);
    }

    #[test]
    fn absolute_values_scale_by_multiplier_and_divisor() {
        let c = chart(10, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 8, 1024, false);

        cycle(&c, &[("d", 4096)], T0);
        cycle(&c, &[("d", 4096)], T0 + 1);

        let v = present(&slot_values(&c, "d")[1]);
        assert!((v - 32.0).abs() < 0.01, "4096 * 8 / 1024 = 32, got {v}");
    }

    #[test]
    fn clock_jump_beyond_ring_resets_chart() {
        let c = chart(10, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Incremental, 1, 1, false);

        for k in 0..4 {
            cycle(&c, &[("d", k * 100)], T0 + k);
        }
        assert!(c.read_state().counter > 0);

        // Announce an elapsed time beyond entries * update_every.
        c.next_usec(11 * USEC_PER_SEC);
        c.set_at("d", 10_000, tv(T0 + 15));
        c.done_at(tv(T0 + 15));

        let st = c.read_state();
        // The reset cleared history; this cycle ran as a first cycle.
        assert_eq!(st.counter_done, 1);
        assert_eq!(st.counter, 1);
        assert_eq!(st.current_entry, 1);
        drop(st);

        let slots = slot_values(&c, "d");
        assert_eq!(slots[0], Slot::Missing);
        for slot in slots.iter().skip(1) {
            assert_eq!(*slot, Slot::Missing);
        }
    }

    #[test]
    fn gap_above_threshold_stores_not_exists() {
        let c = chart(10, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);

        cycle(&c, &[("d", 5)], T0);
        cycle(&c, &[("d", 5)], T0 + 1);

        // Producer goes quiet for 7 cycles (below the ring span, above the
        // gap threshold of 5), then returns.
        c.next_usec(7 * USEC_PER_SEC);
        c.set_at("d", 5, tv(T0 + 8));
        c.done_at(tv(T0 + 8));

        let slots = slot_values(&c, "d");
        // Boundaries further than the gap threshold from the new sample
        // hold NOT_EXISTS; the ones close to it are interpolated.
        let missing = slots
            .iter()
            .skip(2)
            .take(7)
            .filter(|s| matches!(s, Slot::Missing))
            .count();
        assert!(missing >= 2, "expected leading gap slots, got {missing}");
        assert!(matches!(slots[8], Slot::Present { .. }));

        let st = c.read_state();
        assert_eq!(st.last_updated.sec, T0 + 8);
    }

    #[test]
    fn ring_wrap_maintains_first_entry_invariant() {
        let c = chart(5, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);

        for k in 0..8 {
            cycle(&c, &[("d", k)], T0 + k);
        }

        let st = c.read_state();
        assert_eq!(st.counter, 8);
        assert!(st.current_entry < 5);
        // Full ring: the oldest slot trails the newest by entries - 1.
        assert_eq!(
            st.first_entry_t / USEC_PER_SEC,
            (st.last_updated.sec - 4) as u64
        );
        assert_eq!(c.first_entry_t(&st), st.last_updated.sec - 4);
    }

    #[test]
    fn slot_time_round_trips_within_ring() {
        let c = chart(10, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);

        for k in 0..14 {
            cycle(&c, &[("d", k)], T0 + k);
        }

        let st = c.read_state();
        let first = c.first_entry_t(&st);
        let last = c.last_entry_t(&st);
        assert_eq!(last - first, 9);

        for t in first..=last {
            let slot = c.time2slot(&st, t);
            assert!(slot < c.entries);
            assert_eq!(c.slot2time(&st, slot), t);
        }

        // Out-of-window times clamp to the edges.
        assert_eq!(c.time2slot(&st, first - 100), c.first_slot(&st));
        assert_eq!(c.time2slot(&st, last + 100), c.last_slot(&st));
    }

    #[test]
    fn abandoned_dimension_is_garbage_collected() {
        let c = chart(60, 1);
        c.find_or_add_dimension("keep", "keep", Algorithm::Absolute, 1, 1, false);
        c.find_or_add_dimension("drop", "drop", Algorithm::Absolute, 1, 1, false);

        cycle(&c, &[("keep", 1), ("drop", 1)], T0);
        // "drop" stops reporting; after 10 update periods it is unlinked.
        for k in 1..13 {
            cycle(&c, &[("keep", 1)], T0 + k);
        }

        assert!(c.has_dimension("keep"));
        assert!(!c.has_dimension("drop"));
        assert!(c.is_enabled());
    }

    #[test]
    fn chart_with_no_live_dimensions_is_disabled() {
        let c = chart(60, 1);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);

        cycle(&c, &[("d", 1)], T0);
        for k in 1..13 {
            cycle(&c, &[], T0 + k);
        }

        assert!(!c.has_dimension("d"));
        assert!(!c.is_enabled());
    }

    #[test]
    fn dimension_overrides_from_config_win() {
        let mut cfg = RuntimeConfig::default();
        cfg.charts.insert(
            "t.test".into(),
            crate::runtime_config::ChartOverride {
                dimensions: [(
                    "d".to_string(),
                    crate::runtime_config::DimensionOverride {
                        name: Some("renamed".into()),
                        multiplier: Some(10),
                        ..Default::default()
                    },
                )]
                .into_iter()
                .collect(),
                ..Default::default()
            },
        );

        let c = Chart::new(
            ChartOptions {
                type_name: "t".into(),
                id: "t.test".into(),
                name: "t.test".into(),
                family: "test".into(),
                title: "test".into(),
                units: "".into(),
                context: "t.test".into(),
                chart_type: ChartType::Line,
                priority: 1000,
                entries: 10,
                update_every: 1,
                memory_mode: MemoryMode::Ram,
                enabled: true,
                gap_when_lost_iterations_above: 5,
                cache_dir: None,
                config: Arc::new(cfg),
            },
            None,
        );
        c.find_or_add_dimension("d", "producer-name", Algorithm::Absolute, 1, 1, false);

        let st = c.read_state();
        let d = &st.dimensions[0];
        assert_eq!(d.name, "renamed");
        assert_eq!(d.multiplier, 10);
    }

    #[test]
    fn repeated_dimension_add_is_idempotent() {
        let c = chart(10, 1);
        assert!(c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false));
        assert!(!c.find_or_add_dimension("d", "other", Algorithm::Incremental, 2, 2, true));
        let st = c.read_state();
        assert_eq!(st.dimensions.len(), 1);
        assert_eq!(st.dimensions[0].multiplier, 1);
    }

    #[test]
    fn invariants_hold_after_every_done() {
        let c = chart(7, 2);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);
        for k in 0..25 {
            if c.counter_done() > 0 {
                c.next_usec(2 * USEC_PER_SEC);
            }
            c.set_at("d", k, tv(T0 + 2 * k));
            c.done_at(tv(T0 + 2 * k));

            let st = c.read_state();
            assert!(st.current_entry < 7);
            assert_eq!(st.last_updated.sec % c.update_every as i64, 0);
            assert_eq!(st.last_updated.usec, 0);
            for d in &st.dimensions {
                assert_eq!(d.entries(), c.entries);
            }
        }
    }
}
