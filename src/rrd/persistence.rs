// =============================================================================
// Persistence — file-backed ring storage with header validation
// =============================================================================
//
// Three storage modes, chosen per chart at create time:
//
//   ram   rings live in anonymous memory, nothing touches disk
//   map   rings live in a shared file mapping (memmap2); the kernel keeps
//         the file current, an explicit save only flushes
//   save  rings are seeded from the file at open and written back with an
//         atomic tmp + rename on save
//
// Every persisted file starts with a version-stamped magic header. On open,
// any mismatch (magic, size, id, multiplier, divisor, algorithm, update
// cadence, or a last-collected time that is missing or too old) zeroes the
// region and the engine proceeds with a fresh ring. A zeroed ring is
// immediately valid: the all-zero slot pattern decodes as NOT_EXISTS.
// =============================================================================

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use memmap2::{Advice, MmapMut};
use tracing::{error, info, warn};

use crate::storage_number::StorageNumber;
use crate::types::{Algorithm, MemoryMode, Timeval, USEC_PER_SEC};

pub const DIMENSION_MAGIC: &str = "MERIDIAN DIMENSION FILE V1";
pub const CHART_MAGIC: &str = "MERIDIAN CHART FILE V1";

const MAGIC_LEN: usize = 32;
const ID_LEN: usize = 200;

/// Byte length of the dimension file header; the ring of `u32` slots
/// follows immediately after.
pub const DIMENSION_HEADER_LEN: usize = 88 + ID_LEN;

/// Byte length of the chart header file (`main.db`).
pub const CHART_HEADER_LEN: usize = 112 + ID_LEN;

// =============================================================================
// Little-endian field helpers
// =============================================================================

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_i64(buf: &mut [u8], off: usize, v: i64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    u64::from_le_bytes(buf[off..off + 8].try_into().unwrap_or_default())
}

fn get_i64(buf: &[u8], off: usize) -> i64 {
    i64::from_le_bytes(buf[off..off + 8].try_into().unwrap_or_default())
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes(buf[off..off + 4].try_into().unwrap_or_default())
}

fn put_str(buf: &mut [u8], off: usize, len: usize, s: &str) {
    let bytes = s.as_bytes();
    let n = bytes.len().min(len);
    buf[off..off + n].copy_from_slice(&bytes[..n]);
    for b in buf[off + n..off + len].iter_mut() {
        *b = 0;
    }
}

fn get_str(buf: &[u8], off: usize, len: usize) -> String {
    let raw = &buf[off..off + len];
    let end = raw.iter().position(|&b| b == 0).unwrap_or(len);
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

// =============================================================================
// Dimension header
// =============================================================================

/// The on-disk header of a dimension ring file. Also the expectation record
/// used to decide whether an existing file can be trusted.
#[derive(Debug, Clone, PartialEq)]
pub struct DimensionHeader {
    pub id: String,
    pub multiplier: i64,
    pub divisor: i64,
    pub algorithm: Algorithm,
    pub update_every: u32,
    pub entries: u64,
    pub last_collected_time: Timeval,
}

impl DimensionHeader {
    /// Total file size for this header's ring.
    pub fn file_size(&self) -> usize {
        DIMENSION_HEADER_LEN + self.entries as usize * 4
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        put_str(buf, 0, MAGIC_LEN, DIMENSION_MAGIC);
        put_u64(buf, 32, self.file_size() as u64);
        put_i64(buf, 40, self.multiplier);
        put_i64(buf, 48, self.divisor);
        put_u32(buf, 56, self.algorithm.as_u32());
        put_u32(buf, 60, self.update_every);
        put_i64(buf, 64, self.last_collected_time.sec);
        put_i64(buf, 72, self.last_collected_time.usec);
        put_u64(buf, 80, self.entries);
        put_str(buf, 88, ID_LEN, &self.id);
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            id: get_str(buf, 88, ID_LEN),
            multiplier: get_i64(buf, 40),
            divisor: get_i64(buf, 48),
            algorithm: Algorithm::from_u32(get_u32(buf, 56)),
            update_every: get_u32(buf, 60),
            entries: get_u64(buf, 80),
            last_collected_time: Timeval {
                sec: get_i64(buf, 64),
                usec: get_i64(buf, 72),
            },
        }
    }

    /// Decide whether an on-disk region matches this expectation. Returns
    /// `None` when the region is usable, otherwise the reason to log.
    fn mismatch(&self, buf: &[u8], now: Timeval) -> Option<&'static str> {
        if get_str(buf, 0, MAGIC_LEN) != DIMENSION_MAGIC {
            return Some("magic mismatch");
        }
        let found = Self::read_from(buf);
        if get_u64(buf, 32) != self.file_size() as u64 || found.entries != self.entries {
            return Some("size mismatch");
        }
        if found.id != self.id {
            return Some("contents are for another dimension");
        }
        if found.multiplier != self.multiplier {
            return Some("multiplier changed");
        }
        if found.divisor != self.divisor {
            return Some("divisor changed");
        }
        if found.algorithm != self.algorithm {
            return Some("algorithm changed");
        }
        if found.update_every != self.update_every {
            return Some("update cadence changed");
        }
        if found.last_collected_time.is_zero() {
            // Never written; nothing worth keeping.
            return Some("never collected");
        }
        let age = now.usec_since(&found.last_collected_time);
        if age > self.entries * self.update_every as u64 * USEC_PER_SEC {
            return Some("too old");
        }
        None
    }
}

// =============================================================================
// Slot store
// =============================================================================

/// The backing storage for one dimension's ring of packed slots.
pub enum SlotStore {
    /// Anonymous memory.
    Ram { slots: Vec<StorageNumber> },
    /// Seeded from a file at open; written back on save (mode `save`).
    Seeded {
        slots: Vec<StorageNumber>,
        path: PathBuf,
    },
    /// Live shared mapping over the file (mode `map`).
    Mapped { map: MmapMut, entries: usize },
}

impl SlotStore {
    /// Open the ring for a dimension. For persistent modes the file is
    /// created, validated against `header`, and zeroed on any mismatch.
    pub fn open(mode: MemoryMode, path: Option<PathBuf>, header: &DimensionHeader) -> Self {
        let entries = header.entries as usize;
        match (mode, path) {
            (MemoryMode::Map, Some(path)) => match Self::open_mapped(&path, header) {
                Ok(store) => store,
                Err(e) => {
                    error!(path = %path.display(), error = %e, "cannot map ring file, falling back to ram");
                    Self::Ram {
                        slots: vec![0; entries],
                    }
                }
            },
            (MemoryMode::Save, Some(path)) => {
                let slots = Self::load_seed(&path, header).unwrap_or_else(|| vec![0; entries]);
                Self::Seeded { slots, path }
            }
            _ => Self::Ram {
                slots: vec![0; entries],
            },
        }
    }

    fn open_mapped(path: &Path, header: &DimensionHeader) -> Result<Self> {
        let size = header.file_size();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("opening ring file {}", path.display()))?;
        file.set_len(size as u64)
            .with_context(|| format!("sizing ring file {}", path.display()))?;

        let mut map = unsafe { MmapMut::map_mut(&file) }
            .with_context(|| format!("mapping ring file {}", path.display()))?;

        for advice in [Advice::Sequential, Advice::WillNeed, Advice::DontFork] {
            if let Err(e) = map.advise(advice) {
                warn!(path = %path.display(), error = %e, "madvise failed");
            }
        }

        if let Some(reason) = header.mismatch(&map[..DIMENSION_HEADER_LEN], Timeval::now()) {
            info!(path = %path.display(), reason, "reinitializing ring file");
            map.fill(0);
        }
        header.write_to(&mut map[..DIMENSION_HEADER_LEN]);

        Ok(Self::Mapped {
            map,
            entries: header.entries as usize,
        })
    }

    /// Read a save-mode seed file; `None` means start fresh.
    fn load_seed(path: &Path, header: &DimensionHeader) -> Option<Vec<StorageNumber>> {
        let data = std::fs::read(path).ok()?;
        if data.len() != header.file_size() {
            info!(path = %path.display(), "reinitializing ring file (size mismatch)");
            return None;
        }
        if let Some(reason) = header.mismatch(&data[..DIMENSION_HEADER_LEN], Timeval::now()) {
            info!(path = %path.display(), reason, "reinitializing ring file");
            return None;
        }
        let slots = data[DIMENSION_HEADER_LEN..]
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(slots)
    }

    pub fn entries(&self) -> usize {
        match self {
            Self::Ram { slots } | Self::Seeded { slots, .. } => slots.len(),
            Self::Mapped { entries, .. } => *entries,
        }
    }

    pub fn get(&self, slot: usize) -> StorageNumber {
        match self {
            Self::Ram { slots } | Self::Seeded { slots, .. } => slots[slot],
            Self::Mapped { map, .. } => {
                let off = DIMENSION_HEADER_LEN + slot * 4;
                u32::from_le_bytes([map[off], map[off + 1], map[off + 2], map[off + 3]])
            }
        }
    }

    pub fn set(&mut self, slot: usize, value: StorageNumber) {
        match self {
            Self::Ram { slots } | Self::Seeded { slots, .. } => slots[slot] = value,
            Self::Mapped { map, .. } => {
                let off = DIMENSION_HEADER_LEN + slot * 4;
                map[off..off + 4].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    pub fn clear(&mut self) {
        match self {
            Self::Ram { slots } | Self::Seeded { slots, .. } => slots.fill(0),
            Self::Mapped { map, .. } => map[DIMENSION_HEADER_LEN..].fill(0),
        }
    }

    /// Flush the ring to its backing file with a current header. Ram rings
    /// are untouched; mapped rings flush in place; seeded rings rewrite the
    /// whole file atomically.
    pub fn save(&mut self, header: &DimensionHeader) -> Result<()> {
        match self {
            Self::Ram { .. } => Ok(()),
            Self::Mapped { map, .. } => {
                header.write_to(&mut map[..DIMENSION_HEADER_LEN]);
                map.flush().context("flushing mapped ring")
            }
            Self::Seeded { slots, path } => {
                let mut data = vec![0u8; header.file_size()];
                header.write_to(&mut data[..DIMENSION_HEADER_LEN]);
                for (i, slot) in slots.iter().enumerate() {
                    let off = DIMENSION_HEADER_LEN + i * 4;
                    data[off..off + 4].copy_from_slice(&slot.to_le_bytes());
                }
                atomic_write(path, &data)
            }
        }
    }
}

// =============================================================================
// Chart header file (main.db)
// =============================================================================

/// The persisted chart header: ring geometry plus the time state needed to
/// resume an existing ring after a restart.
#[derive(Debug, Clone, PartialEq)]
pub struct ChartHeader {
    pub id: String,
    pub entries: u64,
    pub update_every: u32,
    pub current_entry: u32,
    pub counter: u64,
    pub counter_done: u64,
    pub last_updated: Timeval,
    pub last_collected_time: Timeval,
    pub first_entry_t: u64,
}

impl ChartHeader {
    pub fn write_to(&self, buf: &mut [u8]) {
        put_str(buf, 0, MAGIC_LEN, CHART_MAGIC);
        put_u64(buf, 32, CHART_HEADER_LEN as u64);
        put_u64(buf, 40, self.entries);
        put_u32(buf, 48, self.update_every);
        put_u32(buf, 52, self.current_entry);
        put_u64(buf, 56, self.counter);
        put_u64(buf, 64, self.counter_done);
        put_i64(buf, 72, self.last_updated.sec);
        put_i64(buf, 80, self.last_updated.usec);
        put_i64(buf, 88, self.last_collected_time.sec);
        put_i64(buf, 96, self.last_collected_time.usec);
        put_u64(buf, 104, self.first_entry_t);
        put_str(buf, 112, ID_LEN, &self.id);
    }

    pub fn read_from(buf: &[u8]) -> Self {
        Self {
            id: get_str(buf, 112, ID_LEN),
            entries: get_u64(buf, 40),
            update_every: get_u32(buf, 48),
            current_entry: get_u32(buf, 52),
            counter: get_u64(buf, 56),
            counter_done: get_u64(buf, 64),
            last_updated: Timeval {
                sec: get_i64(buf, 72),
                usec: get_i64(buf, 80),
            },
            last_collected_time: Timeval {
                sec: get_i64(buf, 88),
                usec: get_i64(buf, 96),
            },
            first_entry_t: get_u64(buf, 104),
        }
    }

    /// Load and validate a chart header. Returns `None` (start fresh) on
    /// any mismatch, logging the reason.
    pub fn load(
        path: &Path,
        id: &str,
        entries: u64,
        update_every: u32,
        now: Timeval,
    ) -> Option<Self> {
        let data = std::fs::read(path).ok()?;
        if data.len() != CHART_HEADER_LEN {
            info!(path = %path.display(), "reinitializing chart header (size mismatch)");
            return None;
        }
        if get_str(&data, 0, MAGIC_LEN) != CHART_MAGIC {
            info!(path = %path.display(), "reinitializing chart header (magic mismatch)");
            return None;
        }
        let header = Self::read_from(&data);
        if header.id != id {
            info!(path = %path.display(), "reinitializing chart header (contents are for another chart)");
            return None;
        }
        if header.entries != entries || header.update_every != update_every {
            info!(path = %path.display(), "reinitializing chart header (geometry changed)");
            return None;
        }
        let age = now.as_usec().saturating_sub(header.last_updated.as_usec());
        if header.last_updated.is_zero()
            || age > entries * update_every as u64 * USEC_PER_SEC
        {
            info!(path = %path.display(), "reinitializing chart header (too old)");
            return None;
        }
        Some(header)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let mut data = vec![0u8; CHART_HEADER_LEN];
        self.write_to(&mut data);
        atomic_write(path, &data)
    }
}

// =============================================================================
// Atomic file write
// =============================================================================

/// Write `data` to `path` via a pid-suffixed temporary sibling and rename,
/// so a crash mid-write never leaves a torn file behind.
pub fn atomic_write(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, data)
        .with_context(|| format!("writing temporary file {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("renaming {} into place", tmp.display()))?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
