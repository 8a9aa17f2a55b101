// =============================================================================
// Query Module
// =============================================================================
//
// Turns HTTP requests into windowed, downsampled reads over chart rings.
// `engine` compiles and runs the two-stage aggregation; `format` shapes the
// results into the JSON payloads the HTTP surface serves.

pub mod engine;
pub mod format;

pub use engine::{execute, QueryRequest, QueryResult};
