// =============================================================================
// Ingestion Module
// =============================================================================
//
// The two producers feeding the chart registry: external executables
// speaking the line protocol on stdout, and the in-process /proc collector
// calling the chart API directly.

pub mod line_protocol;
pub mod plugins;
pub mod proc_collector;

pub use line_protocol::{ProducerSession, ProtocolError};
