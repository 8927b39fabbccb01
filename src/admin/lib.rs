//! Paginated scan, repair, reset and count walks over a cluster's key
//! namespace, run behind a bounded background pool so a fleet-wide sweep
//! never outpaces what the cluster's own connections can sustain.

#[macro_use]
extern crate tracing;

pub mod metrics;
pub mod operation;

pub use operation::{AdminOperation, KeyCounts, Target};
