// =============================================================================
// Shared types used across the Meridian metrics engine
// =============================================================================

use serde::{Deserialize, Serialize};

// =============================================================================
// Dimension algorithms
// =============================================================================

/// The rule converting a raw collected sample into the value stored in the
/// round-robin ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Algorithm {
    /// Store the sample as-is.
    #[serde(rename = "absolute")]
    Absolute,
    /// Store the rate of change of a monotonic counter.
    #[serde(rename = "incremental")]
    Incremental,
    /// Store the sample as a percentage of the sum of all samples in the row.
    #[serde(rename = "percentage-of-absolute-row")]
    PctOfRow,
    /// Store the sample's delta as a percentage of the sum of all deltas.
    #[serde(rename = "percentage-of-incremental-row")]
    PctOfDiffRow,
}

impl Default for Algorithm {
    fn default() -> Self {
        Self::Absolute
    }
}

impl Algorithm {
    /// Parse a producer-supplied algorithm name. Unknown names fall back to
    /// `Absolute`, matching the permissive producer protocol.
    pub fn from_name(name: &str) -> Self {
        match name {
            "incremental" => Self::Incremental,
            "percentage-of-absolute-row" => Self::PctOfRow,
            "percentage-of-incremental-row" => Self::PctOfDiffRow,
            _ => Self::Absolute,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Absolute => "absolute",
            Self::Incremental => "incremental",
            Self::PctOfRow => "percentage-of-absolute-row",
            Self::PctOfDiffRow => "percentage-of-incremental-row",
        }
    }

    /// Algorithms that accumulate deltas must suppress their very first
    /// stored sample (there is no previous collection to diff against).
    pub fn is_delta_based(&self) -> bool {
        matches!(self, Self::Incremental | Self::PctOfDiffRow)
    }

    /// Stable numeric tag used by the persisted dimension header.
    pub fn as_u32(&self) -> u32 {
        match self {
            Self::Absolute => 0,
            Self::Incremental => 1,
            Self::PctOfRow => 2,
            Self::PctOfDiffRow => 3,
        }
    }

    pub fn from_u32(v: u32) -> Self {
        match v {
            1 => Self::Incremental,
            2 => Self::PctOfRow,
            3 => Self::PctOfDiffRow,
            _ => Self::Absolute,
        }
    }
}

impl std::fmt::Display for Algorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Chart types
// =============================================================================

/// How the chart is drawn by a front-end. The engine only stores and
/// reports this; it has no effect on the numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChartType {
    Line,
    Area,
    Stacked,
}

impl Default for ChartType {
    fn default() -> Self {
        Self::Line
    }
}

impl ChartType {
    pub fn from_name(name: &str) -> Self {
        match name {
            "area" => Self::Area,
            "stacked" => Self::Stacked,
            _ => Self::Line,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Line => "line",
            Self::Area => "area",
            Self::Stacked => "stacked",
        }
    }
}

impl std::fmt::Display for ChartType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Memory modes
// =============================================================================

/// Chart persistence mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    /// Anonymous memory only; nothing touches disk.
    Ram,
    /// Rings live in a shared file mapping; the kernel persists writes.
    Map,
    /// Rings are seeded from disk at startup and written back on save.
    Save,
}

impl Default for MemoryMode {
    fn default() -> Self {
        Self::Save
    }
}

impl MemoryMode {
    pub fn from_name(name: &str) -> Self {
        match name {
            "ram" => Self::Ram,
            "map" => Self::Map,
            _ => Self::Save,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Ram => "ram",
            Self::Map => "map",
            Self::Save => "save",
        }
    }

    pub fn is_persistent(&self) -> bool {
        !matches!(self, Self::Ram)
    }
}

impl std::fmt::Display for MemoryMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Query group methods
// =============================================================================

/// How consecutive slots are collapsed into one output row by a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMethod {
    Average,
    Max,
    Sum,
}

impl Default for GroupMethod {
    fn default() -> Self {
        Self::Average
    }
}

impl GroupMethod {
    pub fn from_name(name: &str) -> Self {
        match name {
            "max" => Self::Max,
            "sum" => Self::Sum,
            _ => Self::Average,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Average => "average",
            Self::Max => "max",
            Self::Sum => "sum",
        }
    }
}

impl std::fmt::Display for GroupMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// Wall-clock time with microsecond resolution
// =============================================================================

pub const USEC_PER_SEC: u64 = 1_000_000;

/// A `(seconds, microseconds)` wall-clock timestamp. All interpolation math
/// happens on the flattened microsecond value; the split form is what gets
/// persisted and reported.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Timeval {
    pub sec: i64,
    pub usec: i64,
}

impl Timeval {
    pub fn now() -> Self {
        let micros = chrono::Utc::now().timestamp_micros();
        Self::from_usec(micros.max(0) as u64)
    }

    pub fn zero() -> Self {
        Self { sec: 0, usec: 0 }
    }

    pub fn is_zero(&self) -> bool {
        self.sec == 0 && self.usec == 0
    }

    pub fn from_usec(ut: u64) -> Self {
        Self {
            sec: (ut / USEC_PER_SEC) as i64,
            usec: (ut % USEC_PER_SEC) as i64,
        }
    }

    pub fn as_usec(&self) -> u64 {
        self.sec.max(0) as u64 * USEC_PER_SEC + self.usec.max(0) as u64
    }

    /// Microseconds elapsed from `earlier` to `self`; zero if `earlier` is
    /// in the future.
    pub fn usec_since(&self, earlier: &Timeval) -> u64 {
        self.as_usec().saturating_sub(earlier.as_usec())
    }
}

// =============================================================================
// Name sanitization
// =============================================================================

/// Sanitize a chart or dimension name for display and filesystem use:
/// anything that is not alphanumeric or a dot becomes an underscore.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c == '.' || c.is_ascii_alphanumeric() {
                c
            } else {
                '_'
            }
        })
        .collect()
}

// =============================================================================
// Tests
// =============================================================================
