//! Connection-layer metrics, fed directly at the call sites that observe
//! each signal rather than sampled by a background callback.

use opentelemetry::{global, metrics::*};

pub struct ConnectionMetrics {
	pub(crate) reconnect_attempts: Counter<u64>,
	pub(crate) io_errors: Counter<u64>,
}

impl ConnectionMetrics {
	pub fn new() -> Self {
		let meter = global::meter("kio_rpc");

		Self {
			reconnect_attempts: meter
				.u64_counter("kio_reconnect_attempts_total")
				.with_description("Connection attempts made, foreground or background")
				.init(),
			io_errors: meter
				.u64_counter("kio_drive_io_errors_total")
				.with_description("Connections marked unhealthy after an I/O fault")
				.init(),
		}
	}
}

impl Default for ConnectionMetrics {
	fn default() -> Self {
		Self::new()
	}
}
