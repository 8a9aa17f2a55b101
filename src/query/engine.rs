// =============================================================================
// Query Engine — windowed, downsampled reads over chart rings
// =============================================================================
//
// A request names a chart, a window `(after, before)`, a number of output
// rows (`points`), a downsampling factor (`group_count`) and a group
// method. Execution is two-stage:
//
//   Stage 1  per-dimension over-time aggregation: walk the ring slots of
//            the window (with wrap), unpack storage numbers, skip
//            NOT_EXISTS, and collapse blocks of `group_count` consecutive
//            slots with the group method. Reset flags propagate to the
//            output as a per-cell annotation.
//
//   Stage 2  result shaping: one row per block, timestamped at the last
//            slot of the block, one cell per visible dimension; the
//            NonZero option drops dimensions whose output is all zero.
//
// The whole query runs under the chart's read lock, so it never observes a
// partially written slot. Cost is O(points * dimensions).
// =============================================================================

use crate::rrd::chart::{Chart, ChartState};
use crate::storage_number::Slot;
use crate::types::GroupMethod;

// =============================================================================
// Request / result types
// =============================================================================

/// A parsed query. `after` and `before` may be 0 (newest), negative
/// (seconds relative to the newest sample) or absolute epoch seconds.
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub points: usize,
    pub group_count: usize,
    pub group_method: GroupMethod,
    pub after: i64,
    pub before: i64,
    /// Drop dimensions whose output sums to exactly zero.
    pub nonzero: bool,
    /// Offer hidden dimensions too.
    pub include_hidden: bool,
}

impl Default for QueryRequest {
    fn default() -> Self {
        Self {
            points: 1,
            group_count: 1,
            group_method: GroupMethod::Average,
            after: 0,
            before: 0,
            nonzero: false,
            include_hidden: false,
        }
    }
}

/// One aggregated cell: the group-method result over a block of slots, or
/// `None` when every slot in the block was NOT_EXISTS.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Cell {
    pub value: Option<f64>,
    pub reset: bool,
}

#[derive(Debug, Clone)]
pub struct Row {
    pub timestamp: i64,
    pub cells: Vec<Cell>,
}

#[derive(Debug, Clone)]
pub struct QueryResult {
    pub chart_id: String,
    pub chart_name: String,
    pub update_every: u32,
    /// Names of the dimensions present in each row, in cell order.
    pub dimensions: Vec<String>,
    pub rows: Vec<Row>,
    /// Timestamp of the newest stored sample; drives the datasource
    /// `sig` / `not_modified` handshake.
    pub latest_timestamp: i64,
}

impl QueryResult {
    fn empty(chart: &Chart) -> Self {
        Self {
            chart_id: chart.id.clone(),
            chart_name: chart.name.clone(),
            update_every: chart.update_every,
            dimensions: Vec::new(),
            rows: Vec::new(),
            latest_timestamp: 0,
        }
    }
}

// =============================================================================
// Window compilation
// =============================================================================

/// The compiled plan for one request: a resolved slot window plus the
/// grouping parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPlan {
    pub after_t: i64,
    pub before_t: i64,
    pub first_slot: usize,
    pub slots: usize,
    pub group_count: usize,
    pub group_method: GroupMethod,
}

/// Translate `(after, before)` into a slot window. The result is always
/// inside the ring: a request window entirely outside it clamps to the
/// first/last stored slot, and `after > before` falls back to the default
/// (newest) window.
pub fn compile(chart: &Chart, st: &ChartState, req: &QueryRequest) -> Option<QueryPlan> {
    let stored = chart.stored_slots(st);
    if stored == 0 {
        return None;
    }

    let ue = chart.update_every as i64;
    let first_t = chart.first_entry_t(st);
    let last_t = chart.last_entry_t(st);

    let points = req.points.max(1);
    let group_count = req.group_count.max(1);
    // Cap the requested slot count; no ring is remotely this large.
    let wanted = points.saturating_mul(group_count).min(1_000_000_000);
    let span = (wanted as i64 - 1) * ue;

    let mut before_t = if req.before > 0 {
        req.before
    } else {
        last_t + req.before
    };
    let mut after_t = match req.after {
        a if a > 0 => a,
        a if a < 0 => last_t + a,
        _ => before_t - span,
    };

    if after_t > before_t {
        // Nonsense window: behave as if the caller asked for the newest.
        before_t = last_t;
        after_t = before_t - span;
    }

    let mut before_t = before_t.clamp(first_t, last_t);
    let mut after_t = after_t.clamp(first_t, last_t);

    // Align both edges to the grid so slots map cleanly.
    after_t -= after_t.rem_euclid(ue) - last_t.rem_euclid(ue);
    if after_t < first_t {
        after_t += ue;
    }
    before_t -= before_t.rem_euclid(ue) - last_t.rem_euclid(ue);
    if before_t > last_t {
        before_t -= ue;
    }

    let mut slots = ((before_t - after_t) / ue + 1).max(1) as usize;

    // Never hand back more rows than asked for: trim the oldest slots.
    if slots > wanted {
        after_t += (slots - wanted) as i64 * ue;
        slots = wanted;
    }

    Some(QueryPlan {
        after_t,
        before_t,
        first_slot: chart.time2slot(st, after_t),
        slots,
        group_count,
        group_method: req.group_method,
    })
}

// =============================================================================
// Execution
// =============================================================================

struct Accumulator {
    sum: f64,
    max: f64,
    count: usize,
    reset: bool,
}

impl Accumulator {
    fn new() -> Self {
        Self {
            sum: 0.0,
            max: f64::MIN,
            count: 0,
            reset: false,
        }
    }

    fn add(&mut self, value: f64, reset: bool) {
        self.sum += value;
        if value > self.max {
            self.max = value;
        }
        self.count += 1;
        self.reset |= reset;
    }

    fn finish(&mut self, method: GroupMethod) -> Cell {
        let cell = if self.count == 0 {
            Cell {
                value: None,
                reset: self.reset,
            }
        } else {
            let value = match method {
                GroupMethod::Average => self.sum / self.count as f64,
                GroupMethod::Max => self.max,
                GroupMethod::Sum => self.sum,
            };
            Cell {
                value: Some(value),
                reset: self.reset,
            }
        };
        *self = Self::new();
        cell
    }
}

/// Run a query against a chart. Returns rows oldest-first.
pub fn execute(chart: &Chart, req: &QueryRequest) -> QueryResult {
    let st = chart.read_state();

    let plan = match compile(chart, &st, req) {
        Some(plan) => plan,
        None => return QueryResult::empty(chart),
    };

    // Visible dimensions, in declaration order.
    let dims: Vec<usize> = st
        .dimensions
        .iter()
        .enumerate()
        .filter(|(_, d)| req.include_hidden || !d.hidden)
        .map(|(i, _)| i)
        .collect();
    if dims.is_empty() {
        return QueryResult::empty(chart);
    }

    let ue = chart.update_every as i64;
    let entries = chart.entries;

    // ── Stage 1: per-dimension over-time aggregation ────────────────────
    let mut accs: Vec<Accumulator> = dims.iter().map(|_| Accumulator::new()).collect();
    let mut timestamps: Vec<i64> = Vec::new();
    let mut columns: Vec<Vec<Cell>> = dims.iter().map(|_| Vec::new()).collect();

    let mut in_block = 0;
    for w in 0..plan.slots {
        let slot = (plan.first_slot + w) % entries;
        let t = plan.after_t + w as i64 * ue;

        for (col, &di) in dims.iter().enumerate() {
            match st.dimensions[di].slot(slot) {
                Slot::Present { value, reset } => accs[col].add(value, reset),
                Slot::Missing => {}
            }
        }

        in_block += 1;
        if in_block == plan.group_count || w + 1 == plan.slots {
            timestamps.push(t);
            for (col, acc) in accs.iter_mut().enumerate() {
                columns[col].push(acc.finish(plan.group_method));
            }
            in_block = 0;
        }
    }

    // ── Stage 2: result shaping ─────────────────────────────────────────
    // NonZero drops all-zero dimensions, unless that would drop everything.
    let mut keep: Vec<bool> = vec![true; dims.len()];
    if req.nonzero {
        let mut any_nonzero = false;
        for (col, cells) in columns.iter().enumerate() {
            let zero = cells
                .iter()
                .all(|c| c.value.map(|v| v == 0.0).unwrap_or(true));
            keep[col] = !zero;
            any_nonzero |= !zero;
        }
        if !any_nonzero {
            keep.iter_mut().for_each(|k| *k = true);
        }
    }

    let dimensions: Vec<String> = dims
        .iter()
        .zip(keep.iter())
        .filter(|(_, &k)| k)
        .map(|(&di, _)| st.dimensions[di].name.clone())
        .collect();

    let rows: Vec<Row> = timestamps
        .iter()
        .enumerate()
        .map(|(ri, &timestamp)| Row {
            timestamp,
            cells: columns
                .iter()
                .zip(keep.iter())
                .filter(|(_, &k)| k)
                .map(|(col, _)| col[ri])
                .collect(),
        })
        .collect();

    QueryResult {
        chart_id: chart.id.clone(),
        chart_name: chart.name.clone(),
        update_every: chart.update_every,
        dimensions,
        rows,
        latest_timestamp: chart.last_entry_t(&st),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rrd::chart::{Chart, ChartOptions};
    use crate::runtime_config::RuntimeConfig;
    use crate::types::{Algorithm, ChartType, MemoryMode, Timeval, USEC_PER_SEC};
    use std::sync::Arc;

    const T0: i64 = 1_700_000_000;

    fn chart(entries: usize) -> Chart {
        Chart::new(
            ChartOptions {
                type_name: "t".into(),
                id: "t.query".into(),
                name: "t.query".into(),
                family: "q".into(),
                title: "query test".into(),
                units: "u".into(),
                context: "t.query".into(),
                chart_type: ChartType::Line,
                priority: 1000,
                entries,
                update_every: 1,
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

    /// Feed `cycles` aligned one-second absolute samples per dimension.
    fn feed(c: &Chart, sets: &[(&str, &dyn Fn(i64) -> i64)], cycles: i64) {
        for k in 0..cycles {
            if c.counter_done() > 0 {
                c.next_usec(USEC_PER_SEC);
            }
            for (id, f) in sets {
                c.set_at(id, f(k), tv(T0 + k));
            }
            c.done_at(tv(T0 + k));
        }
    }

    fn ones(_k: i64) -> i64 {
        1
    }

    #[test]
    fn downsample_sum_sixty_slots_into_six_rows() {
        // 61 cycles: the first is store-suppressed, leaving 60 stored
        // ones followed by the suppressed slot out of window.
        let c = chart(100);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);
        feed(&c, &[("d", &ones)], 61);

        let res = execute(
            &c,
            &QueryRequest {
                points: 6,
                group_count: 10,
                group_method: GroupMethod::Sum,
                ..Default::default()
            },
        );

        assert_eq!(res.rows.len(), 6);
        for row in &res.rows {
            assert_eq!(row.cells.len(), 1);
            assert_eq!(row.cells[0].value.unwrap().round(), 10.0);
        }
        // Rows are spaced group_count seconds apart, newest row at the
        // newest stored sample.
        assert_eq!(res.rows.last().unwrap().timestamp, T0 + 60);
        assert_eq!(res.rows[1].timestamp - res.rows[0].timestamp, 10);
    }

    #[test]
    fn average_ignores_missing_slots() {
        let c = chart(30);
        c.find_or_add_dimension("a", "a", Algorithm::Absolute, 1, 1, false);
        c.find_or_add_dimension("b", "b", Algorithm::Absolute, 1, 1, false);

        // b reports only every other cycle.
        for k in 0..11 {
            if c.counter_done() > 0 {
                c.next_usec(USEC_PER_SEC);
            }
            c.set_at("a", 4, tv(T0 + k));
            if k % 2 == 0 {
                c.set_at("b", 8, tv(T0 + k));
            }
            c.done_at(tv(T0 + k));
        }

        let res = execute(
            &c,
            &QueryRequest {
                points: 2,
                group_count: 5,
                group_method: GroupMethod::Average,
                ..Default::default()
            },
        );

        assert_eq!(res.rows.len(), 2);
        for row in &res.rows {
            // a is always 4; b averages only its present samples, so it
            // stays 8 rather than being dragged down by the gaps.
            assert_eq!(row.cells[0].value.unwrap().round(), 4.0);
            assert_eq!(row.cells[1].value.unwrap().round(), 8.0);
        }
    }

    #[test]
    fn max_picks_the_block_maximum() {
        let c = chart(30);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);
        feed(&c, &[("d", &|k| k)], 11);

        let res = execute(
            &c,
            &QueryRequest {
                points: 2,
                group_count: 5,
                group_method: GroupMethod::Max,
                ..Default::default()
            },
        );

        assert_eq!(res.rows.len(), 2);
        assert_eq!(res.rows[0].cells[0].value.unwrap().round(), 5.0);
        assert_eq!(res.rows[1].cells[0].value.unwrap().round(), 10.0);
    }

    #[test]
    fn nonzero_drops_flat_zero_dimensions() {
        let c = chart(30);
        c.find_or_add_dimension("live", "live", Algorithm::Absolute, 1, 1, false);
        c.find_or_add_dimension("dead", "dead", Algorithm::Absolute, 1, 1, false);
        feed(&c, &[("live", &ones), ("dead", &|_| 0)], 11);

        let all = execute(
            &c,
            &QueryRequest {
                points: 10,
                ..Default::default()
            },
        );
        assert_eq!(all.dimensions, vec!["live", "dead"]);

        let nz = execute(
            &c,
            &QueryRequest {
                points: 10,
                nonzero: true,
                ..Default::default()
            },
        );
        assert_eq!(nz.dimensions, vec!["live"]);
        assert!(nz.rows.iter().all(|r| r.cells.len() == 1));
    }

    #[test]
    fn nonzero_keeps_everything_when_all_are_zero() {
        let c = chart(30);
        c.find_or_add_dimension("a", "a", Algorithm::Absolute, 1, 1, false);
        feed(&c, &[("a", &|_| 0)], 6);

        let res = execute(
            &c,
            &QueryRequest {
                points: 5,
                nonzero: true,
                ..Default::default()
            },
        );
        assert_eq!(res.dimensions, vec!["a"]);
    }

    #[test]
    fn hidden_dimensions_are_excluded_by_default() {
        let c = chart(30);
        c.find_or_add_dimension("shown", "shown", Algorithm::Absolute, 1, 1, false);
        c.find_or_add_dimension("secret", "secret", Algorithm::Absolute, 1, 1, true);
        feed(&c, &[("shown", &ones), ("secret", &ones)], 6);

        let res = execute(
            &c,
            &QueryRequest {
                points: 5,
                ..Default::default()
            },
        );
        assert_eq!(res.dimensions, vec!["shown"]);

        let res = execute(
            &c,
            &QueryRequest {
                points: 5,
                include_hidden: true,
                ..Default::default()
            },
        );
        assert_eq!(res.dimensions, vec!["shown", "secret"]);
    }

    #[test]
    fn window_clamps_to_ring_contents() {
        let c = chart(10);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);
        feed(&c, &[("d", &ones)], 6);

        // A window far in the past clamps to the oldest stored slot.
        let res = execute(
            &c,
            &QueryRequest {
                points: 100,
                after: T0 - 10_000,
                before: T0 - 9_000,
                ..Default::default()
            },
        );
        assert_eq!(res.rows.len(), 1);

        // A window far in the future clamps to the newest slot.
        let res = execute(
            &c,
            &QueryRequest {
                points: 100,
                after: T0 + 9_000,
                before: T0 + 10_000,
                ..Default::default()
            },
        );
        assert_eq!(res.rows.len(), 1);
        assert_eq!(res.rows[0].timestamp, T0 + 5);
    }

    #[test]
    fn inverted_window_behaves_like_default() {
        let c = chart(30);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);
        feed(&c, &[("d", &ones)], 11);

        let bad = execute(
            &c,
            &QueryRequest {
                points: 4,
                after: T0 + 9,
                before: T0 + 2,
                ..Default::default()
            },
        );
        let def = execute(
            &c,
            &QueryRequest {
                points: 4,
                ..Default::default()
            },
        );
        assert_eq!(bad.rows.len(), def.rows.len());
        assert_eq!(
            bad.rows.last().unwrap().timestamp,
            def.rows.last().unwrap().timestamp
        );
    }

    #[test]
    fn more_points_than_slots_returns_what_exists() {
        let c = chart(100);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);
        feed(&c, &[("d", &ones)], 4);

        let res = execute(
            &c,
            &QueryRequest {
                points: 50,
                ..Default::default()
            },
        );
        // 4 cycles store 4 slots (the first suppressed as NOT_EXISTS).
        assert_eq!(res.rows.len(), 4);
    }

    #[test]
    fn reset_annotation_propagates_to_cells() {
        let c = chart(30);
        c.find_or_add_dimension("d", "d", Algorithm::Incremental, 1, 1, false);

        for (k, v) in [10i64, 20, 5, 15, 25].iter().enumerate() {
            if c.counter_done() > 0 {
                c.next_usec(USEC_PER_SEC);
            }
            c.set_at("d", *v, tv(T0 + k as i64));
            c.done_at(tv(T0 + k as i64));
        }

        let res = execute(
            &c,
            &QueryRequest {
                points: 10,
                ..Default::default()
            },
        );
        let reset_rows: Vec<&Row> = res
            .rows
            .iter()
            .filter(|r| r.cells[0].reset)
            .collect();
        assert_eq!(reset_rows.len(), 1);
        assert_eq!(reset_rows[0].cells[0].value.unwrap().round(), 0.0);
    }

    #[test]
    fn empty_chart_yields_empty_result() {
        let c = chart(10);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);
        let res = execute(&c, &QueryRequest::default());
        assert!(res.rows.is_empty());
        assert!(res.dimensions.is_empty());
    }

    #[test]
    fn compiled_plan_stays_inside_the_ring() {
        let c = chart(10);
        c.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);
        feed(&c, &[("d", &ones)], 15);

        let st = c.read_state();
        for (after, before) in [
            (0, 0),
            (-5, 0),
            (T0 - 1_000_000, 0),
            (0, T0 + 1_000_000),
            (T0 + 7, T0 + 9),
        ] {
            let plan = compile(
                &c,
                &st,
                &QueryRequest {
                    points: 8,
                    after,
                    before,
                    ..Default::default()
                },
            )
            .unwrap();
            assert!(plan.first_slot < c.entries);
            assert!(plan.slots >= 1);
            assert!(plan.slots <= c.entries);
            assert!(plan.after_t >= c.first_entry_t(&st));
            assert!(plan.before_t <= c.last_entry_t(&st));
        }
    }
}
