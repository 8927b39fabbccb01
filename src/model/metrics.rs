//! Cluster-layer metrics, following the same directly-fed-counter shape as
//! the working signals in the connection layer below it.

use opentelemetry::{global, metrics::*};

pub struct ClusterMetrics {
	pub(crate) stripe_reads: Counter<u64>,
	pub(crate) stripe_writes: Counter<u64>,
	pub(crate) repairs_triggered: Counter<u64>,
}

impl ClusterMetrics {
	pub fn new() -> Self {
		let meter = global::meter("kio_model");

		Self {
			stripe_reads: meter
				.u64_counter("kio_stripe_reads_total")
				.with_description("Stripe GETs completed, any width")
				.init(),
			stripe_writes: meter
				.u64_counter("kio_stripe_writes_total")
				.with_description("Stripe PUTs and DELs completed")
				.init(),
			repairs_triggered: meter
				.u64_counter("kio_repairs_triggered_total")
				.with_description("Keys brought back to full redundancy via repair_present")
				.init(),
		}
	}
}

impl Default for ClusterMetrics {
	fn default() -> Self {
		Self::new()
	}
}
