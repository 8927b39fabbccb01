//! Small time helpers shared by the cache, connection supervisor and admin
//! loop.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
pub fn now_msec() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("system clock is before the Unix epoch")
		.as_millis() as u64
}

pub fn msec_to_rfc3339(msec: u64) -> String {
	let dt = chrono::DateTime::<chrono::Utc>::from(UNIX_EPOCH + Duration::from_millis(msec));
	dt.to_rfc3339()
}
