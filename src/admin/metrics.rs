//! Admin scan/repair/reset metrics, following the same per-signal shape as
//! the cluster and cache layers below it.

use opentelemetry::{global, metrics::*};

pub struct AdminMetrics {
	pub(crate) repaired: Counter<u64>,
	pub(crate) removed: Counter<u64>,
	pub(crate) unrepairable: Counter<u64>,
	pub(crate) sweep_duration: Histogram<f64>,
}

impl AdminMetrics {
	pub fn new() -> Self {
		let meter = global::meter("kio_admin");
		Self {
			repaired: meter
				.u64_counter("kio_admin_keys_repaired_total")
				.with_description("Keys brought back to full redundancy by a repair sweep")
				.init(),
			removed: meter
				.u64_counter("kio_admin_keys_removed_total")
				.with_description("Keys force-removed by a repair or reset sweep")
				.init(),
			unrepairable: meter
				.u64_counter("kio_admin_keys_unrepairable_total")
				.with_description("Keys a sweep gave up on, counted and left in place")
				.init(),
			sweep_duration: meter
				.f64_histogram("kio_admin_sweep_duration")
				.with_description("Wall-clock duration of a complete count/scan/repair/reset sweep")
				.init(),
		}
	}
}

impl Default for AdminMetrics {
	fn default() -> Self {
		Self::new()
	}
}
