// =============================================================================
// Round-Robin Database Module
// =============================================================================
//
// The time-series core: dimensions hold fixed-capacity rings of packed
// storage numbers, charts interpolate collected samples onto their grid and
// own their dimensions, the registry is the process-global index, and the
// persistence layer maps rings to disk.

pub mod chart;
pub mod dimension;
pub mod persistence;
pub mod registry;

pub use chart::{Chart, ChartState};
pub use dimension::Dimension;
pub use registry::{ChartRegistry, ChartSpec};
