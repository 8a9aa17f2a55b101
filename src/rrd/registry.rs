// =============================================================================
// Chart Registry — the process-global set of charts
// =============================================================================
//
// The only mutable global state in the core: an ordered list of charts plus
// two hash indexes (by full `type.id` and by display name), all behind one
// coarse RwLock. Per-chart state is guarded by each chart's own lock.
//
// Lock order: registry lock first, then a chart's lock. Never the reverse.
//
// `create_or_get` is idempotent on `(type, id)`: a second create returns
// the existing chart untouched. All shape and naming decisions are resolved
// against the runtime config here, so producer-supplied values only apply
// where the operator has not overridden them.
// =============================================================================

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, error, info, warn};

use crate::rrd::chart::{Chart, ChartOptions};
use crate::rrd::persistence::ChartHeader;
use crate::runtime_config::{RuntimeConfig, HISTORY_MAX, HISTORY_MIN, UPDATE_EVERY_MAX};
use crate::types::{sanitize_name, ChartType, MemoryMode, Timeval};

// =============================================================================
// Chart creation parameters (producer-supplied)
// =============================================================================

/// What a producer asks for when declaring a chart. Everything here can be
/// overridden by the runtime config during creation.
#[derive(Debug, Clone, Default)]
pub struct ChartSpec {
    pub type_name: String,
    pub id: String,
    pub name: Option<String>,
    pub family: Option<String>,
    pub title: Option<String>,
    pub units: Option<String>,
    pub context: Option<String>,
    pub priority: i64,
    pub update_every: u32,
    pub chart_type: ChartType,
}

// =============================================================================
// Registry
// =============================================================================

#[derive(Default)]
struct RegistryInner {
    ordered: Vec<Arc<Chart>>,
    by_id: HashMap<String, Arc<Chart>>,
    by_name: HashMap<String, Arc<Chart>>,
}

pub struct ChartRegistry {
    config: Arc<RuntimeConfig>,
    inner: RwLock<RegistryInner>,
}

impl ChartRegistry {
    pub fn new(config: Arc<RuntimeConfig>) -> Self {
        Self {
            config,
            inner: RwLock::new(RegistryInner::default()),
        }
    }

    pub fn config(&self) -> &Arc<RuntimeConfig> {
        &self.config
    }

    /// Look up a chart by its full `type.id`.
    pub fn find_by_id(&self, full_id: &str) -> Option<Arc<Chart>> {
        self.inner.read().by_id.get(full_id).cloned()
    }

    /// Look up a chart by its sanitized display name.
    pub fn find_by_name(&self, name: &str) -> Option<Arc<Chart>> {
        self.inner.read().by_name.get(&sanitize_name(name)).cloned()
    }

    /// Resolve a request selector: display name first, then full id.
    pub fn find(&self, selector: &str) -> Option<Arc<Chart>> {
        self.find_by_name(selector)
            .or_else(|| self.find_by_id(selector))
    }

    /// Snapshot of all charts in creation order.
    pub fn charts(&self) -> Vec<Arc<Chart>> {
        self.inner.read().ordered.clone()
    }

    /// Create a chart, or return the existing one for the same `(type, id)`.
    pub fn create_or_get(&self, spec: ChartSpec) -> Arc<Chart> {
        let full_id = format!("{}.{}", spec.type_name, spec.id);

        if let Some(existing) = self.find_by_id(&full_id) {
            debug!(chart = %full_id, "chart already exists");
            return existing;
        }

        let over = self.config.chart(&full_id);

        let enabled = over.and_then(|o| o.enabled).unwrap_or(true);
        let mut entries = over
            .and_then(|o| o.history)
            .unwrap_or(self.config.history)
            .clamp(HISTORY_MIN, HISTORY_MAX);
        if !enabled {
            // A disabled chart keeps collecting into a token ring so that
            // re-enabling it does not need a restart.
            entries = HISTORY_MIN;
        }

        let update_every = spec.update_every.clamp(1, UPDATE_EVERY_MAX);

        // The display name is "<type>.<name>", sanitized; a config entry
        // wins over whatever the producer supplied.
        let producer_name = spec.name.clone().filter(|n| !n.is_empty());
        let name = over
            .and_then(|o| o.name.clone())
            .unwrap_or_else(|| {
                let short = producer_name.unwrap_or_else(|| spec.id.clone());
                sanitize_name(&format!("{}.{}", spec.type_name, short))
            });

        let family = spec
            .family
            .clone()
            .filter(|f| !f.is_empty())
            .unwrap_or_else(|| spec.id.clone());
        let units = over
            .and_then(|o| o.units.clone())
            .or_else(|| spec.units.clone())
            .unwrap_or_default();
        let title = over.and_then(|o| o.title.clone()).unwrap_or_else(|| {
            format!("{} ({})", spec.title.clone().unwrap_or_default(), name)
        });
        let context = spec
            .context
            .clone()
            .filter(|c| !c.is_empty())
            .unwrap_or_else(|| full_id.clone());
        let chart_type = over.and_then(|o| o.chart_type).unwrap_or(spec.chart_type);
        let priority = over.and_then(|o| o.priority).unwrap_or(spec.priority);
        let gap = over
            .and_then(|o| o.gap_when_lost_iterations_above)
            .unwrap_or(self.config.gap_when_lost_iterations_above)
            .max(1);

        let memory_mode = self.config.memory_mode;
        let cache_dir = self.prepare_cache_dir(&full_id, memory_mode);

        // A surviving header lets the chart resume its ring after a restart.
        let restore = cache_dir.as_ref().and_then(|dir| {
            ChartHeader::load(
                &dir.join("main.db"),
                &full_id,
                entries as u64,
                update_every,
                Timeval::now(),
            )
        });

        info!(
            chart = %full_id,
            name = %name,
            entries,
            update_every,
            memory_mode = %memory_mode,
            restored = restore.is_some(),
            "creating chart"
        );

        let chart = Arc::new(Chart::new(
            ChartOptions {
                type_name: spec.type_name,
                id: full_id.clone(),
                name: name.clone(),
                family,
                title,
                units,
                context,
                chart_type,
                priority,
                entries,
                update_every,
                memory_mode,
                enabled,
                gap_when_lost_iterations_above: gap,
                cache_dir,
                config: self.config.clone(),
            },
            restore,
        ));

        let mut inner = self.inner.write();
        // A second writer may have won the race while we were building.
        if let Some(existing) = inner.by_id.get(&full_id) {
            return existing.clone();
        }
        inner.ordered.push(chart.clone());
        inner.by_id.insert(full_id, chart.clone());
        inner.by_name.insert(name, chart.clone());
        chart
    }

    fn prepare_cache_dir(&self, full_id: &str, mode: MemoryMode) -> Option<PathBuf> {
        if !mode.is_persistent() {
            return None;
        }
        let dir = self
            .config
            .database_directory
            .join(sanitize_name(full_id));
        match std::fs::create_dir_all(&dir) {
            Ok(()) => Some(dir),
            Err(e) => {
                warn!(path = %dir.display(), error = %e, "cannot create chart directory, keeping chart in memory");
                None
            }
        }
    }

    /// Flush every chart's header and rings.
    pub fn save_all(&self) {
        let charts = self.charts();
        info!(count = charts.len(), "saving all charts");
        for chart in charts {
            if let Err(e) = chart.save() {
                error!(chart = %chart.id, error = %e, "failed to save chart");
            }
        }
    }

    /// Final save and teardown at shutdown.
    pub fn free_all(&self) {
        self.save_all();
        let mut inner = self.inner.write();
        inner.ordered.clear();
        inner.by_id.clear();
        inner.by_name.clear();
        info!("chart registry cleared");
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime_config::ChartOverride;
    use crate::storage_number::Slot;
    use crate::types::{Algorithm, Timeval, USEC_PER_SEC};

    fn ram_registry() -> ChartRegistry {
        let mut cfg = RuntimeConfig::default();
        cfg.memory_mode = MemoryMode::Ram;
        cfg.history = 20;
        ChartRegistry::new(Arc::new(cfg))
    }

    fn spec(type_name: &str, id: &str) -> ChartSpec {
        ChartSpec {
            type_name: type_name.into(),
            id: id.into(),
            priority: 1000,
            update_every: 1,
            ..Default::default()
        }
    }

    #[test]
    fn create_or_get_is_idempotent() {
        let reg = ram_registry();
        let a = reg.create_or_get(spec("system", "cpu"));
        a.find_or_add_dimension("user", "user", Algorithm::Incremental, 1, 1, false);

        let b = reg.create_or_get(spec("system", "cpu"));
        assert!(Arc::ptr_eq(&a, &b));
        // The second call did not perturb the chart.
        assert!(b.has_dimension("user"));
        assert_eq!(reg.charts().len(), 1);
    }

    #[test]
    fn find_by_id_and_name() {
        let reg = ram_registry();
        let mut s = spec("net", "eth0");
        s.name = Some("ethernet".into());
        reg.create_or_get(s);

        assert!(reg.find_by_id("net.eth0").is_some());
        assert!(reg.find_by_name("net.ethernet").is_some());
        assert!(reg.find("net.ethernet").is_some());
        assert!(reg.find("net.eth0").is_some());
        assert!(reg.find("net.wlan0").is_none());
    }

    #[test]
    fn display_name_is_sanitized() {
        let reg = ram_registry();
        let mut s = spec("disk", "sda 1");
        s.name = Some("sda 1".into());
        let chart = reg.create_or_get(s);
        assert_eq!(chart.name, "disk.sda_1");
        assert!(reg.find_by_name("disk.sda 1").is_some());
    }

    #[test]
    fn config_overrides_win_over_producer_values() {
        let mut cfg = RuntimeConfig::default();
        cfg.memory_mode = MemoryMode::Ram;
        cfg.charts.insert(
            "apps.mem".into(),
            ChartOverride {
                name: Some("apps.memory".into()),
                history: Some(50),
                priority: Some(7),
                chart_type: Some(ChartType::Stacked),
                ..Default::default()
            },
        );
        let reg = ChartRegistry::new(Arc::new(cfg));

        let mut s = spec("apps", "mem");
        s.name = Some("producer-chosen".into());
        s.chart_type = ChartType::Line;
        let chart = reg.create_or_get(s);

        assert_eq!(chart.name, "apps.memory");
        assert_eq!(chart.entries, 50);
        assert_eq!(chart.priority, 7);
        assert_eq!(chart.chart_type, ChartType::Stacked);
    }

    #[test]
    fn disabled_chart_gets_minimum_history() {
        let mut cfg = RuntimeConfig::default();
        cfg.memory_mode = MemoryMode::Ram;
        cfg.charts.insert(
            "noisy.chart".into(),
            ChartOverride {
                enabled: Some(false),
                history: Some(100_000),
                ..Default::default()
            },
        );
        let reg = ChartRegistry::new(Arc::new(cfg));
        let chart = reg.create_or_get(spec("noisy", "chart"));
        assert_eq!(chart.entries, HISTORY_MIN);
        assert!(!chart.is_enabled());
    }

    #[test]
    fn update_every_is_clamped() {
        let reg = ram_registry();
        let mut s = spec("a", "b");
        s.update_every = 0;
        assert_eq!(reg.create_or_get(s).update_every, 1);

        let mut s = spec("a", "c");
        s.update_every = 100_000;
        assert_eq!(reg.create_or_get(s).update_every, UPDATE_EVERY_MAX);
    }

    #[test]
    fn save_then_reload_reproduces_ring_contents() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = RuntimeConfig::default();
        cfg.memory_mode = MemoryMode::Save;
        cfg.database_directory = dir.path().to_path_buf();
        cfg.history = 10;
        let cfg = Arc::new(cfg);

        // Keep the newest sample close to "now" so the age validation on
        // reload sees a warm file.
        let t0 = Timeval::now().sec - 5;
        let collected: Vec<Slot>;
        {
            let reg = ChartRegistry::new(cfg.clone());
            let chart = reg.create_or_get(spec("t", "persist"));
            chart.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);

            for k in 0..6 {
                if chart.counter_done() > 0 {
                    chart.next_usec(USEC_PER_SEC);
                }
                chart.set_at("d", k * 7, Timeval { sec: t0 + k, usec: 0 });
                chart.done_at(Timeval { sec: t0 + k, usec: 0 });
            }
            collected = {
                let st = chart.read_state();
                let d = &st.dimensions[0];
                (0..chart.entries).map(|i| d.slot(i)).collect()
            };
            reg.free_all();
        }

        // A fresh registry over the same directory resumes the ring.
        let reg = ChartRegistry::new(cfg);
        let chart = reg.create_or_get(spec("t", "persist"));
        chart.find_or_add_dimension("d", "d", Algorithm::Absolute, 1, 1, false);

        let st = chart.read_state();
        assert_eq!(st.counter, 6);
        assert_eq!(st.current_entry, 6);
        assert_eq!(st.last_updated.sec, t0 + 5);
        // Cold-start collection state: the next done is store-suppressed.
        assert_eq!(st.counter_done, 0);
        assert!(st.last_collected_time.is_zero());

        let d = &st.dimensions[0];
        for (i, expected) in collected.iter().enumerate() {
            assert_eq!(d.slot(i), *expected, "slot {i}");
        }
    }

    #[test]
    fn free_all_empties_the_registry() {
        let reg = ram_registry();
        reg.create_or_get(spec("a", "one"));
        reg.create_or_get(spec("a", "two"));
        assert_eq!(reg.charts().len(), 2);
        reg.free_all();
        assert!(reg.charts().is_empty());
        assert!(reg.find_by_id("a.one").is_none());
    }
}
