// =============================================================================
// Dimension — a single time series inside a chart
// =============================================================================
//
// A dimension owns its identity (producer-assigned id, display name), the
// algorithm and scaling applied to collected samples, the working state of
// the current collection cycle, and a fixed-capacity ring of packed storage
// numbers. The ring is indexed by the owning chart's write cursor: slot `k`
// always holds the sample for `first_entry_t + k * update_every`.
// =============================================================================

use std::path::PathBuf;

use anyhow::Result;

use crate::rrd::persistence::{DimensionHeader, SlotStore};
use crate::storage_number::{unpack, Slot, StorageNumber};
use crate::types::{Algorithm, MemoryMode, Timeval};

pub struct Dimension {
    /// Stable producer-assigned id.
    pub id: String,
    /// Display name; config overrides win over the producer's choice.
    pub name: String,
    pub algorithm: Algorithm,
    pub multiplier: i64,
    /// Never zero.
    pub divisor: i64,
    /// Hidden dimensions are not offered to queries by default.
    pub hidden: bool,

    // ── Working state for the current cycle ─────────────────────────────
    /// Latest raw sample; reset to 0 after each `done`.
    pub collected_value: i64,
    pub last_collected_value: i64,
    /// Post-algorithm, pre-interpolation residual.
    pub calculated_value: f64,
    pub last_calculated_value: f64,
    /// True when a sample arrived since the last `done`.
    pub updated: bool,
    /// When this dimension last received a sample.
    pub last_collected_time: Timeval,

    update_every: u32,
    store: SlotStore,
}

impl Dimension {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: String,
        name: String,
        algorithm: Algorithm,
        multiplier: i64,
        divisor: i64,
        hidden: bool,
        entries: usize,
        update_every: u32,
        memory_mode: MemoryMode,
        cache_file: Option<PathBuf>,
    ) -> Self {
        let divisor = if divisor == 0 { 1 } else { divisor };
        let multiplier = if multiplier == 0 { 1 } else { multiplier };

        let header = DimensionHeader {
            id: id.clone(),
            multiplier,
            divisor,
            algorithm,
            update_every,
            entries: entries as u64,
            last_collected_time: Timeval::zero(),
        };
        let store = SlotStore::open(memory_mode, cache_file, &header);

        Self {
            id,
            name,
            algorithm,
            multiplier,
            divisor,
            hidden,
            collected_value: 0,
            last_collected_value: 0,
            calculated_value: 0.0,
            last_calculated_value: 0.0,
            updated: false,
            last_collected_time: Timeval::zero(),
            update_every,
            store,
        }
    }

    /// Record a raw sample for the current cycle.
    pub fn set(&mut self, value: i64, now: Timeval) {
        self.collected_value = value;
        self.updated = true;
        self.last_collected_time = now;
    }

    pub fn entries(&self) -> usize {
        self.store.entries()
    }

    /// Combined scaling factor applied before packing.
    pub fn scale(&self) -> f64 {
        self.multiplier as f64 / self.divisor as f64
    }

    pub fn slot(&self, index: usize) -> Slot {
        unpack(self.store.get(index))
    }

    pub fn store_slot(&mut self, index: usize, value: StorageNumber) {
        self.store.set(index, value);
    }

    /// Zero the whole ring; every slot reads back as NOT_EXISTS.
    pub fn clear_ring(&mut self) {
        self.store.clear();
    }

    fn header(&self) -> DimensionHeader {
        DimensionHeader {
            id: self.id.clone(),
            multiplier: self.multiplier,
            divisor: self.divisor,
            algorithm: self.algorithm,
            update_every: self.update_every,
            entries: self.store.entries() as u64,
            last_collected_time: self.last_collected_time,
        }
    }

    /// Flush the ring to its backing file (no-op for ram rings).
    pub fn save(&mut self) -> Result<()> {
        let header = self.header();
        self.store.save(&header)
    }
}

// =============================================================================
// Tests
// =============================================================================
