// =============================================================================
// HTTP API Module
// =============================================================================
//
// The axum-served query surface. Framing, compression and connection
// handling belong to the HTTP stack; this module only shapes requests into
// queries and queries into payloads.

pub mod rest;

pub use rest::{router, ApiState};
