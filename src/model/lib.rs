//! Stripe placement/GET/PUT/DEL and the cluster façade: the layer that
//! turns a key and a byte value into fragments scattered across a drive
//! fleet, and reassembles them on the way back out.

#[macro_use]
extern crate tracing;

pub mod cluster;
pub mod metrics;
pub mod stripe;

pub use cluster::{Cluster, ClusterStats, KeyType};
pub use stripe::{GetOutcome, ScanClassification, ScanOutcome, StripeOperation, WriteOutcome};
