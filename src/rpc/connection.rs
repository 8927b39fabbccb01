//! Per-drive connection supervision: connect once in the
//! foreground on first use, then rate-limit background reconnect attempts;
//! primary/secondary endpoints are tried in random order on every connect;
//! a 500ms grace window after (re)connecting makes `set_error` a no-op so
//! in-flight operations that still used the old connection can't immediately
//! knock out a freshly (re)established one.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use opentelemetry::Context;
use rand::Rng;
use tokio::sync::OnceCell;

use kio_util::background::BackgroundPool;
use kio_util::error::Error;

use crate::client::{DriveClient, Endpoint};
use crate::metrics::ConnectionMetrics;

const ERROR_GRACE_WINDOW: Duration = Duration::from_millis(500);
const NO_OP_TIMEOUT: Duration = Duration::from_secs(5);

struct Inner<C> {
	connection: Option<Arc<C>>,
	healthy: bool,
	timestamp: Instant,
}

/// Owns the live connection to one drive, reconnecting as needed. Cheap to
/// clone (an `Arc` internally); the stripe engine holds one per drive in a
/// cluster for the cluster's lifetime.
pub struct ConnectionSupervisor<C: DriveClient> {
	name: String,
	primary: Endpoint,
	secondary: Endpoint,
	rate_limit: Duration,
	background: Arc<BackgroundPool>,
	connect_once: OnceCell<()>,
	inner: Mutex<Inner<C>>,
	metrics: ConnectionMetrics,
}

impl<C: DriveClient> ConnectionSupervisor<C> {
	pub fn new(primary: Endpoint, secondary: Endpoint, rate_limit: Duration, background: Arc<BackgroundPool>) -> Arc<Self> {
		let name = format!("{}/{}", primary, secondary);
		Arc::new(ConnectionSupervisor {
			name,
			primary,
			secondary,
			rate_limit,
			background,
			connect_once: OnceCell::new(),
			inner: Mutex::new(Inner {
				connection: None,
				healthy: false,
				timestamp: Instant::now() - rate_limit - Duration::from_secs(1),
			}),
			metrics: ConnectionMetrics::new(),
		})
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Returns the current connection, triggering the foreground one-shot
	/// connect on first call and scheduling a rate-limited background
	/// reconnect attempt whenever the connection is down.
	pub async fn get(self: &Arc<Self>) -> Result<Arc<C>, Error> {
		let this = self.clone();
		self.connect_once.get_or_init(|| async move { this.connect().await }).await;

		{
			let inner = self.inner.lock().unwrap();
			if inner.healthy {
				return Ok(inner.connection.clone().expect("healthy connection is always present"));
			}
		}

		let should_schedule = {
			let inner = self.inner.lock().unwrap();
			inner.timestamp.elapsed() > self.rate_limit
		};
		if should_schedule {
			let this = self.clone();
			let scheduled = self.background.try_run(async move {
				this.connect().await;
				Ok(())
			});
			if scheduled {
				self.inner.lock().unwrap().timestamp = Instant::now();
				debug!("{}: scheduled background reconnect", self.name);
			} else {
				debug!("{}: background pool busy, reconnect deferred", self.name);
			}
		}

		Err(Error::ClientIoError(format!("{} is not connected", self.name)))
	}

	/// Mark the connection unhealthy, unless it was (re)established within
	/// the grace window.
	pub fn set_error(&self) {
		let mut inner = self.inner.lock().unwrap();
		if !inner.healthy {
			return;
		}
		if inner.timestamp.elapsed() < ERROR_GRACE_WINDOW {
			debug!("{}: disregarding set_error, connection was just (re)established", self.name);
			return;
		}
		info!("{}: connection marked unhealthy", self.name);
		inner.healthy = false;
		inner.connection = None;
		self.metrics.io_errors.add(&Context::current(), 1, &[]);
	}

	pub fn is_healthy(&self) -> bool {
		self.inner.lock().unwrap().healthy
	}

	async fn connect(&self) {
		debug!("{}: attempting connection", self.name);
		self.metrics.reconnect_attempts.add(&Context::current(), 1, &[]);
		let (primary, secondary) = if rand::thread_rng().gen_bool(0.5) {
			(&self.primary, &self.secondary)
		} else {
			(&self.secondary, &self.primary)
		};

		let connected = match C::connect(primary).await {
			Ok(c) => Some(c),
			Err(e) => {
				debug!("{}: primary endpoint {} failed: {}", self.name, primary, e);
				match C::connect(secondary).await {
					Ok(c) => Some(c),
					Err(e) => {
						debug!("{}: secondary endpoint {} failed: {}", self.name, secondary, e);
						None
					}
				}
			}
		};

		let connected = match connected {
			Some(c) => c,
			None => return,
		};

		// Don't consider the connection usable unless a no-op round trip
		// actually succeeds within the timeout: a drive can accept a TCP
		// connection while refusing requests or simply hanging (locked, out
		// of space, mid-firmware-update).
		match tokio::time::timeout(NO_OP_TIMEOUT, connected.no_op()).await {
			Ok(Ok(())) => {}
			Ok(Err(_)) => {
				debug!("{}: connection established but no-op failed", self.name);
				return;
			}
			Err(_) => {
				debug!("{}: connection established but no-op timed out", self.name);
				return;
			}
		}

		let mut inner = self.inner.lock().unwrap();
		inner.connection = Some(Arc::new(connected));
		inner.healthy = true;
		inner.timestamp = Instant::now();
		info!("{}: connection (re)established", self.name);
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::testing::FakeDrive;

	#[tokio::test]
	async fn connects_once_and_reports_healthy() {
		let background = BackgroundPool::new(0, 2);
		let supervisor = ConnectionSupervisor::<FakeDrive>::new(
			Endpoint { host: "a".into(), port: 1 },
			Endpoint { host: "b".into(), port: 2 },
			Duration::from_secs(5),
			background,
		);
		let client = supervisor.get().await.unwrap();
		assert!(client.no_op().await.is_ok());
		assert!(supervisor.is_healthy());
	}

	#[tokio::test]
	async fn set_error_is_noop_within_grace_window() {
		let background = BackgroundPool::new(0, 2);
		let supervisor = ConnectionSupervisor::<FakeDrive>::new(
			Endpoint { host: "a".into(), port: 1 },
			Endpoint { host: "b".into(), port: 2 },
			Duration::from_secs(5),
			background,
		);
		supervisor.get().await.unwrap();
		supervisor.set_error();
		assert!(supervisor.is_healthy(), "set_error right after connecting should be disregarded");
	}
}
