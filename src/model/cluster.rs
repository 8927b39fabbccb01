//! The cluster façade: `get`/`put`/`remove`/`range` over `Data`, `Metadata`
//! and `Attribute` keys, each backed by its own [`Codec`] width, plus
//! background-refreshed capacity and I/O statistics.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use opentelemetry::Context;

use kio_codec::Codec;
use kio_rpc::{ConnectionSupervisor, DriveClient, DriveStatus, OperationVector, WriteMode};
use kio_util::background::BackgroundPool;
use kio_util::data::Version;
use kio_util::error::{Error, Result};

use crate::metrics::ClusterMetrics;
use crate::stripe::{ScanOutcome, StripeOperation};

/// The three key spaces a cluster serves, each with its own redundancy
/// width. `Attribute` shares `Metadata`'s replicated placement but is kept
/// distinct so callers (and handoff/indicator bookkeeping) never conflate
/// file attributes with POSIX metadata records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
	Data,
	Metadata,
	Attribute,
}

#[derive(Debug, Clone, Default)]
pub struct ClusterStats {
	pub bytes_total: u64,
	pub bytes_free: u64,
	pub read_ops_total: u64,
	pub read_ops_period: u64,
	pub write_ops_total: u64,
	pub write_ops_period: u64,
	pub utilization_percent: f64,
}

struct StatsSnapshot {
	stats: ClusterStats,
	last_refresh: Instant,
	refreshing: bool,
}

pub struct Cluster<C: DriveClient> {
	id: String,
	instance_id: u64,
	block_size: usize,
	connections: Vec<Arc<ConnectionSupervisor<C>>>,
	data_codec: Codec,
	metadata_codec: Codec,
	timeout: Duration,
	background: Arc<BackgroundPool>,
	stats: Mutex<StatsSnapshot>,
	metrics: ClusterMetrics,
}

/// Source for `Cluster::instance_id`: every construction gets a fresh value,
/// so a configuration reload that builds a new `Cluster` for the same
/// cluster id never shares cache entries with the one it replaces.
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

impl<C: DriveClient> Cluster<C> {
	pub fn new(
		id: String,
		block_size: usize,
		connections: Vec<Arc<ConnectionSupervisor<C>>>,
		data_codec: Codec,
		metadata_codec: Codec,
		timeout: Duration,
		background: Arc<BackgroundPool>,
	) -> Arc<Self> {
		Arc::new(Self {
			id,
			instance_id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
			block_size,
			connections,
			data_codec,
			metadata_codec,
			timeout,
			background,
			stats: Mutex::new(StatsSnapshot {
				stats: ClusterStats::default(),
				last_refresh: Instant::now() - Duration::from_secs(3),
				refreshing: false,
			}),
			metrics: ClusterMetrics::new(),
		})
	}

	pub fn id(&self) -> &str {
		&self.id
	}

	/// Namespaces cached blocks across configuration reloads: unique per
	/// construction, even for two clusters sharing the same `id`.
	pub fn instance_id(&self) -> u64 {
		self.instance_id
	}

	pub fn block_size(&self) -> usize {
		self.block_size
	}

	pub fn connection_count(&self) -> usize {
		self.connections.len()
	}

	fn codec(&self, key_type: KeyType) -> &Codec {
		match key_type {
			KeyType::Data => &self.data_codec,
			KeyType::Metadata | KeyType::Attribute => &self.metadata_codec,
		}
	}

	/// Split `value` into `n_data` zero-padded chunks of up to `block_size`
	/// bytes, compute the parity fragments, then blank out data fragments
	/// past the value's actual occupied range so the padding never gets
	/// written back as if it were real content.
	fn split_value(&self, value: &[u8], codec: &Codec) -> Result<Vec<Vec<u8>>> {
		if codec.n_data() == 0 {
			return Err(Error::invalid_argument("codec has zero data fragments"));
		}
		let chunk_size = if value.is_empty() { 0 } else { value.len().min(self.block_size).max(1) };
		let mut stripe = Vec::with_capacity(codec.stripe_size());

		if chunk_size == 0 {
			stripe.resize(codec.stripe_size(), Vec::new());
			return Ok(stripe);
		}

		let occupied = (value.len() + chunk_size - 1) / chunk_size;
		for i in 0..codec.n_data() {
			let start = i * chunk_size;
			let mut chunk = if start < value.len() {
				value[start..(start + chunk_size).min(value.len())].to_vec()
			} else {
				Vec::new()
			};
			chunk.resize(chunk_size, 0);
			stripe.push(chunk);
		}
		for _ in 0..codec.n_parity() {
			stripe.push(Vec::new());
		}
		codec.compute(&mut stripe)?;

		for fragment in stripe.iter_mut().take(codec.n_data()).skip(occupied) {
			fragment.clear();
		}
		Ok(stripe)
	}

	/// Read a key's value. Fails with [`Error::NotFound`] once a majority of
	/// the stripe agrees the key is absent; a write race or a genuinely
	/// unreachable stripe instead surfaces as [`Error::VersionMismatch`] or
	/// [`Error::Unfixable`].
	pub async fn get(&self, key: &str, key_type: KeyType) -> Result<Vec<u8>> {
		let (_version, value) = self.get_with_version(key, key_type).await?;
		value.ok_or(Error::NotFound)
	}

	pub async fn get_version(&self, key: &str, key_type: KeyType) -> Result<Version> {
		self.metrics.stripe_reads.add(&Context::current(), 1, &[]);
		let outcome = StripeOperation::get(&self.connections, key, true, self.codec(key_type), self.timeout).await?;
		Ok(outcome.version)
	}

	/// Read a key's value and the version it was read at in a single stripe
	/// round trip, so a caller that needs both never risks observing a value
	/// from one version and a version from another written in between.
	/// `None` means the key is absent, without treating that as an error --
	/// callers that want [`Error::NotFound`] on absence should use [`Cluster::get`].
	pub async fn get_with_version(&self, key: &str, key_type: KeyType) -> Result<(Version, Option<Vec<u8>>)> {
		self.metrics.stripe_reads.add(&Context::current(), 1, &[]);
		let outcome = StripeOperation::get(&self.connections, key, false, self.codec(key_type), self.timeout).await?;
		Ok((outcome.version, outcome.value))
	}

	/// Versioned write: fails with [`Error::VersionMismatch`] if `version_old`
	/// is no longer the current on-drive version, unless a concurrent racer
	/// hasn't yet durably won either, in which case the write is forced.
	pub async fn put(&self, key: &str, version_old: &Version, value: &[u8], key_type: KeyType) -> Result<Version> {
		self.do_put(key, version_old, value, key_type, WriteMode::RequireVersion).await
	}

	/// Unconditional write, ignoring whatever version is currently on drive.
	pub async fn put_forced(&self, key: &str, value: &[u8], key_type: KeyType) -> Result<Version> {
		self.do_put(key, &Version::empty(), value, key_type, WriteMode::IgnoreVersion).await
	}

	async fn do_put(&self, key: &str, version_old: &Version, value: &[u8], key_type: KeyType, mode: WriteMode) -> Result<Version> {
		self.metrics.stripe_writes.add(&Context::current(), 1, &[]);
		let codec = self.codec(key_type);
		let version_new = Version::generate(value.len());
		let fragments = self.split_value(value, codec)?;

		let outcome = StripeOperation::put(&self.connections, key, &version_new, version_old, fragments.clone(), mode, codec, self.timeout).await;

		match outcome {
			Ok(o) if o.status == DriveStatus::Ok => Ok(o.version),
			_ if mode == WriteMode::IgnoreVersion => Err(Error::Unfixable(format!("key {} is not accessible", key))),
			_ => {
				if StripeOperation::may_force(&self.connections, key, &version_new, codec, self.timeout).await {
					warn!("put {}: forcing after concurrency-resolution budget exhausted", key);
					let forced =
						StripeOperation::put(&self.connections, key, &version_new, &Version::empty(), fragments, WriteMode::IgnoreVersion, codec, self.timeout)
							.await?;
					Ok(forced.version)
				} else {
					Err(Error::VersionMismatch)
				}
			}
		}
	}

	pub async fn remove(&self, key: &str, version: &Version, key_type: KeyType) -> Result<()> {
		self.do_remove(key, version, key_type, WriteMode::RequireVersion).await
	}

	pub async fn remove_forced(&self, key: &str, key_type: KeyType) -> Result<()> {
		self.do_remove(key, &Version::empty(), key_type, WriteMode::IgnoreVersion).await
	}

	async fn do_remove(&self, key: &str, version: &Version, key_type: KeyType, mode: WriteMode) -> Result<()> {
		self.metrics.stripe_writes.add(&Context::current(), 1, &[]);
		let codec = self.codec(key_type);
		let outcome = StripeOperation::del(&self.connections, key, version, mode, codec, self.timeout).await;

		match outcome {
			Ok(o) if o.status == DriveStatus::Ok || o.status == DriveStatus::NotFound => Ok(()),
			_ if mode == WriteMode::IgnoreVersion => Err(Error::Unfixable(format!("key {} is not accessible", key))),
			_ => {
				if StripeOperation::may_force(&self.connections, key, &Version::empty(), codec, self.timeout).await {
					warn!("remove {}: forcing after concurrency-resolution budget exhausted", key);
					StripeOperation::del(&self.connections, key, &Version::empty(), WriteMode::IgnoreVersion, codec, self.timeout).await?;
					Ok(())
				} else {
					Err(Error::VersionMismatch)
				}
			}
		}
	}

	/// Full-width classification read used by the admin scan/repair loop.
	/// Never attempts reconstruction, so it's safe to run over every key in
	/// a namespace without the cost a full `get` would carry.
	pub async fn scan(&self, key: &str, key_type: KeyType) -> ScanOutcome {
		StripeOperation::scan(&self.connections, key, self.codec(key_type), self.timeout).await
	}

	/// Bring a present-but-under-replicated key back to full redundancy: GET
	/// it (which already reconstructs missing fragments and raises a fresh
	/// indicator if still short), re-PUT the observed value back at its own
	/// version to refill whatever positions were missing or corrupt, then
	/// drop the handoff siblings and indicator this cycle produced.
	pub async fn repair_present(&self, key: &str, key_type: KeyType) -> Result<()> {
		let codec = self.codec(key_type);
		let outcome = StripeOperation::get(&self.connections, key, false, codec, self.timeout).await?;
		let value = outcome.value.unwrap_or_default();
		let fragments = self.split_value(&value, codec)?;
		StripeOperation::put(
			&self.connections,
			key,
			&outcome.version,
			&outcome.version,
			fragments,
			WriteMode::RequireVersion,
			codec,
			self.timeout,
		)
		.await?;
		StripeOperation::remove_indicator_and_handoffs(&self.connections, key, self.timeout).await;
		self.metrics.repairs_triggered.add(&Context::current(), 1, &[]);
		Ok(())
	}

	/// Drop every handoff sibling and the repair indicator for `key`,
	/// without touching the key itself. Used both after a successful repair
	/// and when resetting an indicator target directly.
	pub async fn remove_repair_artifacts(&self, key: &str) {
		StripeOperation::remove_indicator_and_handoffs(&self.connections, key, self.timeout).await;
	}

	/// Keys in `[start, end)` across every drive, tolerating up to
	/// `n_parity` drive failures -- the same fault tolerance the stripe
	/// itself carries.
	pub async fn range(&self, start: &str, end: &str, key_type: KeyType, max: usize) -> Result<Vec<String>> {
		let codec = self.codec(key_type);
		let max = if max == 0 { 100 } else { max };

		let outcomes = OperationVector::fan_out(&self.connections, self.timeout, {
			let start = start.to_string();
			let end = end.to_string();
			move |client| {
				let start = start.clone();
				let end = end.clone();
				async move { client.get_key_range(&start, &end, max).await }
			}
		})
		.await;

		let statuses: Vec<DriveStatus> = outcomes.iter().map(|o| kio_rpc::status_of(&o.result)).collect();
		let quorum = self.connections.len().saturating_sub(codec.n_parity());
		if OperationVector::evaluate(&statuses, quorum).is_none() {
			return Err(Error::Unfixable(format!("range {}..{} did not reach quorum", start, end)));
		}

		let mut merged: BTreeSet<String> = BTreeSet::new();
		for outcome in outcomes {
			if let Ok(keys) = outcome.result {
				merged.extend(keys);
			}
		}
		Ok(merged.into_iter().take(max).collect())
	}

	/// The last refreshed statistics snapshot. Never blocks: if more than
	/// two seconds have passed since the last refresh, a background refresh
	/// is kicked off (if one isn't already in flight) and this call still
	/// returns the current, possibly-stale snapshot.
	pub fn stats(self: &Arc<Self>) -> ClusterStats {
		let mut guard = self.stats.lock().expect("cluster stats lock poisoned");
		if !guard.refreshing && guard.last_refresh.elapsed() >= Duration::from_secs(2) {
			guard.refreshing = true;
			let cluster = self.clone();
			let scheduled = self.background.try_run(async move {
				cluster.refresh_stats().await;
				Ok(())
			});
			if !scheduled {
				guard.refreshing = false;
			}
		}
		guard.stats.clone()
	}

	async fn refresh_stats(self: Arc<Self>) {
		let outcomes = OperationVector::fan_out(&self.connections, self.timeout, |client| async move { client.get_log().await }).await;

		let mut bytes_total = 0u64;
		let mut bytes_free = 0u64;
		let mut read_ops_total = 0u64;
		let mut write_ops_total = 0u64;
		let mut utilization_sum = 0.0f64;
		let mut reporting = 0u64;

		for outcome in &outcomes {
			if let Ok(log) = &outcome.result {
				bytes_total += log.bytes_total;
				bytes_free += log.bytes_total.saturating_sub(log.bytes_used);
				read_ops_total += log.read_ops;
				write_ops_total += log.write_ops;
				utilization_sum += log.utilization_percent;
				reporting += 1;
			}
		}

		let mut guard = self.stats.lock().expect("cluster stats lock poisoned");
		let previous = &guard.stats;
		let new_stats = ClusterStats {
			bytes_total,
			bytes_free,
			read_ops_total,
			read_ops_period: read_ops_total.saturating_sub(previous.read_ops_total),
			write_ops_total,
			write_ops_period: write_ops_total.saturating_sub(previous.write_ops_total),
			utilization_percent: if reporting > 0 { utilization_sum / reporting as f64 } else { 0.0 },
		};
		debug!("cluster {}: stats refreshed from {} of {} drives", self.id, reporting, outcomes.len());
		guard.stats = new_stats;
		guard.last_refresh = Instant::now();
		guard.refreshing = false;
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use kio_rpc::testing::FakeDrive;
	use kio_rpc::Endpoint;

	fn endpoint(n: u16) -> Endpoint {
		Endpoint {
			host: format!("drive-{}", n),
			port: n,
		}
	}

	fn cluster(count: u16) -> Arc<Cluster<FakeDrive>> {
		let background = BackgroundPool::new(0, count as usize);
		let connections = (0..count)
			.map(|i| ConnectionSupervisor::<FakeDrive>::new(endpoint(i), endpoint(i + 100), Duration::from_secs(5), background.clone()))
			.collect();
		Cluster::new(
			"test".to_string(),
			64 * 1024,
			connections,
			Codec::new(3, 2),
			Codec::new(1, 3),
			Duration::from_secs(1),
			background,
		)
	}

	#[tokio::test]
	async fn data_round_trips_across_the_facade() {
		let cluster = cluster(6);
		let value = b"posix files are just striped kinetic objects".to_vec();

		let version = cluster.put_forced("file/1", &value, KeyType::Data).await.unwrap();
		let read = cluster.get("file/1", KeyType::Data).await.unwrap();
		assert_eq!(read, value);

		cluster.remove("file/1", &version, KeyType::Data).await.unwrap();
		assert!(matches!(cluster.get("file/1", KeyType::Data).await, Err(Error::NotFound)));
	}

	#[tokio::test]
	async fn metadata_replicates_across_every_drive() {
		let cluster = cluster(4);
		let value = b"{\"mode\":420}".to_vec();
		cluster.put_forced("meta/1", &value, KeyType::Metadata).await.unwrap();

		let range = cluster.range("meta/", "meta/~", KeyType::Metadata, 10).await.unwrap();
		assert_eq!(range, vec!["meta/1".to_string()]);
	}

	#[tokio::test]
	async fn repair_present_restores_a_lagging_fragment() {
		let cluster = cluster(6);
		let value = b"repair refills the fragment that missed the write".to_vec();
		cluster.put_forced("file/2", &value, KeyType::Data).await.unwrap();

		let before = cluster.scan("file/2", KeyType::Data).await;
		assert_eq!(before.classify(), crate::stripe::ScanClassification::Ok);

		cluster.repair_present("file/2", KeyType::Data).await.unwrap();
		let after = cluster.scan("file/2", KeyType::Data).await;
		assert_eq!(after.classify(), crate::stripe::ScanClassification::Ok);

		let readback = cluster.get("file/2", KeyType::Data).await.unwrap();
		assert_eq!(readback, value);
	}

	#[tokio::test]
	async fn stats_never_blocks_and_eventually_refreshes() {
		let cluster = cluster(3);
		let first = cluster.stats();
		assert_eq!(first.bytes_total, 0);

		tokio::time::sleep(Duration::from_millis(50)).await;
		cluster.stats();
		tokio::time::sleep(Duration::from_millis(50)).await;

		let refreshed = cluster.stats();
		assert!(refreshed.bytes_total > 0);
	}
}
