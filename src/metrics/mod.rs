//! Operator metrics and the HTTP endpoint serving them
//!
//! Also answers the liveness and readiness probes.

mod prometheus;

pub use prometheus::*;
