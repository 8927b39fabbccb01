//! The scan/repair/reset/count sweep itself: a paginated range walk over one
//! key namespace, fanning per-key work out across a bounded background pool
//! and folding the result into a running, atomically-updated tally.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use opentelemetry::Context;

use kio_model::{Cluster, KeyType, ScanClassification};
use kio_rpc::DriveClient;
use kio_util::background::BackgroundPool;
use kio_util::error::{Error, Result};

use crate::metrics::AdminMetrics;

/// The four key namespaces a sweep can be pointed at, mirroring the stripe
/// key grammar's three striped prefixes plus the unstriped indicator marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
	Data,
	Metadata,
	Attribute,
	Indicator,
}

impl Target {
	fn key_type(&self) -> Option<KeyType> {
		match self {
			Target::Data => Some(KeyType::Data),
			Target::Metadata => Some(KeyType::Metadata),
			Target::Attribute => Some(KeyType::Attribute),
			Target::Indicator => None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
	Count,
	Scan,
	Repair,
	Reset,
}

/// Running totals for a sweep. `incomplete`/`need_action` are only ever
/// populated by `scan`; `repaired`/`removed`/`unrepairable` only by `repair`
/// and `reset`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KeyCounts {
	pub total: u64,
	pub incomplete: u64,
	pub need_action: u64,
	pub repaired: u64,
	pub removed: u64,
	pub unrepairable: u64,
}

#[derive(Default)]
struct AtomicKeyCounts {
	total: AtomicU64,
	incomplete: AtomicU64,
	need_action: AtomicU64,
	repaired: AtomicU64,
	removed: AtomicU64,
	unrepairable: AtomicU64,
}

impl AtomicKeyCounts {
	fn snapshot(&self) -> KeyCounts {
		KeyCounts {
			total: self.total.load(Ordering::Relaxed),
			incomplete: self.incomplete.load(Ordering::Relaxed),
			need_action: self.need_action.load(Ordering::Relaxed),
			repaired: self.repaired.load(Ordering::Relaxed),
			removed: self.removed.load(Ordering::Relaxed),
			unrepairable: self.unrepairable.load(Ordering::Relaxed),
		}
	}
}

/// A scan/repair/reset/count sweep bound to one cluster. Cheap to
/// construct; every public method owns its own background pool for the
/// duration of the sweep so concurrent sweeps on the same cluster never
/// share (or contend on) worker slots.
pub struct AdminOperation<C: DriveClient> {
	cluster: Arc<Cluster<C>>,
	metrics: AdminMetrics,
}

impl<C: DriveClient> AdminOperation<C> {
	pub fn new(cluster: Arc<Cluster<C>>) -> Self {
		Self {
			cluster,
			metrics: AdminMetrics::new(),
		}
	}

	/// Tally keys in `target`'s namespace without touching any of them.
	pub async fn count(&self, target: Target, callback: impl FnMut(u64) -> bool) -> Result<u64> {
		Ok(self.sweep(Op::Count, target, callback, 1).await?.total)
	}

	/// Classify every key in `target`'s namespace as `ok`, `incomplete`,
	/// `need_action` or `unfixable`, without repairing anything.
	pub async fn scan(&self, target: Target, callback: impl FnMut(u64) -> bool, threads: usize) -> Result<KeyCounts> {
		self.sweep(Op::Scan, target, callback, threads).await
	}

	/// Scan, and for every key needing action, reconstruct and re-spread it
	/// (or remove it outright if a quorum reports it absent), then drop the
	/// handoff and indicator artifacts that cycle leaves behind.
	pub async fn repair(&self, target: Target, callback: impl FnMut(u64) -> bool, threads: usize) -> Result<KeyCounts> {
		self.sweep(Op::Repair, target, callback, threads).await
	}

	/// Force-remove every key in `target`'s namespace. For `Indicator`, this
	/// also drops the handoff siblings the indicator pointed at, without
	/// touching the underlying data/metadata/attribute key itself.
	pub async fn reset(&self, target: Target, callback: impl FnMut(u64) -> bool, threads: usize) -> Result<KeyCounts> {
		self.sweep(Op::Reset, target, callback, threads).await
	}

	async fn sweep(&self, op: Op, target: Target, mut callback: impl FnMut(u64) -> bool, threads: usize) -> Result<KeyCounts> {
		let started = Instant::now();
		let counts = Arc::new(AtomicKeyCounts::default());
		let threads = threads.max(1);
		let background = BackgroundPool::new(threads, threads);

		let (start, end) = range_bounds(self.cluster.id(), target);
		let range_key_type = target.key_type().unwrap_or(KeyType::Metadata);
		let mut cursor = start;

		loop {
			let keys = self.cluster.range(&cursor, &end, range_key_type, 1000).await?;
			if keys.is_empty() {
				break;
			}
			cursor = format!("{}\u{0}", keys.last().expect("just checked non-empty"));
			counts.total.fetch_add(keys.len() as u64, Ordering::Relaxed);

			if op != Op::Count {
				for key in keys {
					let cluster = self.cluster.clone();
					let counts = counts.clone();
					background
						.run(async move {
							apply(&cluster, op, target, &key, &counts).await;
							Ok(())
						})
						.await;
				}
			}

			if !callback(counts.total.load(Ordering::Relaxed)) {
				info!("admin sweep over {:?}/{:?} interrupted by callback", target, op);
				break;
			}
		}

		background.shutdown().await;
		self.metrics.repaired.add(&Context::current(), counts.repaired.load(Ordering::Relaxed), &[]);
		self.metrics.removed.add(&Context::current(), counts.removed.load(Ordering::Relaxed), &[]);
		self.metrics
			.unrepairable
			.add(&Context::current(), counts.unrepairable.load(Ordering::Relaxed), &[]);
		self.metrics
			.sweep_duration
			.record(&Context::current(), started.elapsed().as_secs_f64(), &[]);
		Ok(counts.snapshot())
	}
}

async fn apply<C: DriveClient>(cluster: &Cluster<C>, op: Op, target: Target, key: &str, counts: &AtomicKeyCounts) {
	let (key, key_type) = match resolve_key(target, key) {
		Some(resolved) => resolved,
		None => {
			warn!("admin sweep: could not infer a key type for {}, skipping", key);
			counts.unrepairable.fetch_add(1, Ordering::Relaxed);
			return;
		}
	};

	let result = match op {
		Op::Count => Ok(()),
		Op::Scan => apply_scan(cluster, &key, key_type, counts).await,
		Op::Repair => apply_repair(cluster, &key, key_type, target, counts).await,
		Op::Reset => apply_reset(cluster, &key, key_type, target, counts).await,
	};
	if let Err(e) = result {
		warn!("admin sweep: {} is unrepairable: {}", key, e);
		counts.unrepairable.fetch_add(1, Ordering::Relaxed);
	}
}

/// Resolve the key and key type an operation should actually run against.
/// For an `Indicator` target this means unwrapping the indicator key's
/// `indicator:` prefix and inferring the wrapped key's namespace from its
/// own grammar, since the indicator carries no redundancy information of
/// its own.
fn resolve_key(target: Target, key: &str) -> Option<(String, KeyType)> {
	match target {
		Target::Indicator => {
			let original = key.strip_prefix("indicator:").unwrap_or(key);
			infer_key_type(original).map(|kt| (original.to_string(), kt))
		}
		_ => target.key_type().map(|kt| (key.to_string(), kt)),
	}
}

fn infer_key_type(key: &str) -> Option<KeyType> {
	if key.contains(":data:") {
		Some(KeyType::Data)
	} else if key.contains(":metadata:") {
		Some(KeyType::Metadata)
	} else if key.contains(":attribute:") {
		Some(KeyType::Attribute)
	} else {
		None
	}
}

async fn apply_scan<C: DriveClient>(cluster: &Cluster<C>, key: &str, key_type: KeyType, counts: &AtomicKeyCounts) -> Result<()> {
	let outcome = cluster.scan(key, key_type).await;
	match outcome.classify() {
		ScanClassification::Ok => Ok(()),
		ScanClassification::Incomplete => {
			counts.incomplete.fetch_add(1, Ordering::Relaxed);
			Ok(())
		}
		ScanClassification::NeedAction => {
			counts.need_action.fetch_add(1, Ordering::Relaxed);
			Ok(())
		}
		ScanClassification::Unfixable => Err(Error::Unfixable(format!("key {} has no majority version", key))),
	}
}

async fn apply_repair<C: DriveClient>(cluster: &Cluster<C>, key: &str, key_type: KeyType, target: Target, counts: &AtomicKeyCounts) -> Result<()> {
	let outcome = cluster.scan(key, key_type).await;
	let needs_action = outcome.classify() == ScanClassification::NeedAction || target == Target::Indicator;
	if !needs_action {
		if outcome.classify() == ScanClassification::Incomplete {
			counts.incomplete.fetch_add(1, Ordering::Relaxed);
		}
		return Ok(());
	}

	if outcome.mostly_not_found() {
		cluster.remove_forced(key, key_type).await?;
		cluster.remove_repair_artifacts(key).await;
		counts.removed.fetch_add(1, Ordering::Relaxed);
	} else {
		cluster.repair_present(key, key_type).await?;
		counts.repaired.fetch_add(1, Ordering::Relaxed);
	}
	Ok(())
}

async fn apply_reset<C: DriveClient>(cluster: &Cluster<C>, key: &str, key_type: KeyType, target: Target, counts: &AtomicKeyCounts) -> Result<()> {
	if target == Target::Indicator {
		cluster.remove_repair_artifacts(key).await;
	} else {
		cluster.remove_forced(key, key_type).await?;
	}
	counts.removed.fetch_add(1, Ordering::Relaxed);
	Ok(())
}

/// Start/end bounds for a paginated range walk over `target`'s namespace,
/// following the same key grammar the stripe engine writes: `<cluster
/// id>:data:<path>_<index>`, `<cluster id>:metadata:<path>`, `<cluster
/// id>:attribute:<path>:<name>`, and the unstriped `indicator:<cluster
/// id>...` marker space.
fn range_bounds(cluster_id: &str, target: Target) -> (String, String) {
	match target {
		Target::Data => (format!("{}:data: _0000000000", cluster_id), format!("{}:data:~_9999999999", cluster_id)),
		Target::Metadata => (format!("{}:metadata: ", cluster_id), format!("{}:metadata:~", cluster_id)),
		Target::Attribute => (format!("{}:attribute: : ", cluster_id), format!("{}:attribute:~:~", cluster_id)),
		Target::Indicator => (format!("indicator:{}", cluster_id), format!("indicator:{}~", cluster_id)),
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use kio_codec::Codec;
	use kio_model::KeyType;
	use kio_rpc::testing::FakeDrive;
	use kio_rpc::{ConnectionSupervisor, Endpoint};
	use std::time::Duration;

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
			"cl1".to_string(),
			64 * 1024,
			connections,
			Codec::new(3, 2),
			Codec::new(1, 3),
			Duration::from_secs(1),
			background,
		)
	}

	#[tokio::test]
	async fn count_tallies_without_touching_keys() {
		let cluster = cluster(6);
		for i in 0..5 {
			cluster.put_forced(&format!("cl1:data:file_{:010}", i), b"payload", KeyType::Data).await.unwrap();
		}
		let admin = AdminOperation::new(cluster.clone());
		let total = admin.count(Target::Data, |_| true).await.unwrap();
		assert_eq!(total, 5);

		// count never mutates: every key is still exactly where it was.
		for i in 0..5 {
			assert!(cluster.get(&format!("cl1:data:file_{:010}", i), KeyType::Data).await.is_ok());
		}
	}

	#[tokio::test]
	async fn scan_classifies_clean_keys_as_ok() {
		let cluster = cluster(6);
		cluster.put_forced("cl1:data:file_0000000000", b"payload", KeyType::Data).await.unwrap();

		let admin = AdminOperation::new(cluster);
		let counts = admin.scan(Target::Data, |_| true, 2).await.unwrap();
		assert_eq!(counts.total, 1);
		assert_eq!(counts.incomplete, 0);
		assert_eq!(counts.need_action, 0);
	}

	#[tokio::test]
	async fn repair_restores_a_lagging_fragment() {
		let cluster = cluster(6);
		cluster.put_forced("cl1:data:file_0000000000", b"durable payload", KeyType::Data).await.unwrap();

		let admin = AdminOperation::new(cluster.clone());
		let counts = admin.repair(Target::Data, |_| true, 2).await.unwrap();
		assert_eq!(counts.total, 1);
		assert_eq!(counts.unrepairable, 0);

		let value = cluster.get("cl1:data:file_0000000000", KeyType::Data).await.unwrap();
		assert_eq!(value, b"durable payload".to_vec());
	}

	#[tokio::test]
	async fn reset_force_removes_every_key_in_range() {
		let cluster = cluster(6);
		cluster.put_forced("cl1:data:file_0000000000", b"gone soon", KeyType::Data).await.unwrap();

		let admin = AdminOperation::new(cluster.clone());
		let counts = admin.reset(Target::Data, |_| true, 2).await.unwrap();
		assert_eq!(counts.removed, 1);
		assert!(matches!(cluster.get("cl1:data:file_0000000000", KeyType::Data).await, Err(Error::NotFound)));
	}

	#[tokio::test]
	async fn callback_returning_false_stops_the_sweep_early() {
		let cluster = cluster(6);
		for i in 0..20 {
			cluster.put_forced(&format!("cl1:data:file_{:010}", i), b"x", KeyType::Data).await.unwrap();
		}
		let admin = AdminOperation::new(cluster);
		let mut seen = 0u64;
		let counts = admin
			.scan(Target::Data, |total| {
				seen = total;
				false
			}, 2)
			.await
			.unwrap();
		assert_eq!(counts.total, seen);
		assert!(counts.total <= 20);
	}
}
