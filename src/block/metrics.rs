//! Block cache metrics, following the same `ObservableGauge`-per-signal
//! shape as the cluster layer above it.

use opentelemetry::{global, metrics::*};

pub struct BlockCacheMetrics {
	pub(crate) cache_size_bytes: ObservableGauge<u64>,
	pub(crate) cache_entries: ObservableGauge<u64>,

	pub(crate) evictions: Counter<u64>,
	pub(crate) readahead_scheduled: Counter<u64>,
	pub(crate) flush_duration: Histogram<f64>,
}

impl BlockCacheMetrics {
	pub fn new() -> Self {
		let meter = global::meter("kio_block");

		Self {
			cache_size_bytes: meter
				.u64_observable_gauge("kio_cache_size_bytes")
				.with_description("Bytes currently accounted for by cached blocks")
				.init(),
			cache_entries: meter
				.u64_observable_gauge("kio_cache_entries")
				.with_description("Distinct cached blocks")
				.init(),

			evictions: meter
				.u64_counter("kio_cache_evictions_total")
				.with_description("Cache entries evicted by the shrink pass")
				.init(),
			readahead_scheduled: meter
				.u64_counter("kio_cache_readahead_scheduled_total")
				.with_description("Background readahead jobs scheduled from a predicted access pattern")
				.init(),
			flush_duration: meter
				.f64_histogram("kio_cache_flush_duration")
				.with_description("Duration of background and forced block flushes")
				.init(),
		}
	}
}

impl Default for BlockCacheMetrics {
	fn default() -> Self {
		Self::new()
	}
}
