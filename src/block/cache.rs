//! LRU cache of [`Block`]s, shared by every open file handle. Identity is
//! keyed by the block's logical data key plus the owning cluster's instance
//! id, so a configuration reload (which mints a fresh `Cluster`) never
//! serves a block from before the reload.

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use opentelemetry::Context;
use tokio::sync::Mutex;

use kio_model::Cluster;
use kio_rpc::DriveClient;
use kio_util::error::{Error, Result};

use crate::block::{Block, BlockMode};
use crate::metrics::BlockCacheMetrics;
use crate::prefetch::{PredictionType, PrefetchOracle};

/// Opaque handle identifying the file (or other client) that owns a set of
/// cached blocks. The cache itself never interprets this value.
pub type OwnerId = u64;

const SHRINK_PRESSURE: f64 = 0.70;
const IDLE_THRESHOLD: Duration = Duration::from_secs(5);
const UNUSED_POOL_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
	key: String,
	cluster_instance: u64,
}

struct Entry<C: DriveClient> {
	owners: HashSet<OwnerId>,
	block: Arc<Block<C>>,
	last_access: Instant,
}

#[derive(Copy, Clone, PartialEq, Eq)]
enum RequestMode {
	Standard,
	Readahead,
}

struct Inner<C: DriveClient> {
	lookup: HashMap<CacheKey, Entry<C>>,
	/// Access order, oldest first: sequence number -> key.
	order: std::collections::BTreeMap<u64, CacheKey>,
	reverse: HashMap<CacheKey, u64>,
	next_seq: u64,
	current_size: u64,
	unused_pool: Vec<Vec<u8>>,
}

impl<C: DriveClient> Inner<C> {
	fn new() -> Self {
		Self {
			lookup: HashMap::new(),
			order: std::collections::BTreeMap::new(),
			reverse: HashMap::new(),
			next_seq: 0,
			current_size: 0,
			unused_pool: Vec::new(),
		}
	}
}

pub struct Cache<C: DriveClient> {
	capacity_bytes: AtomicU64,
	max_readahead: usize,
	inner: Mutex<Inner<C>>,
	prefetch: Mutex<HashMap<OwnerId, PrefetchOracle>>,
	errors: Mutex<HashMap<OwnerId, VecDeque<String>>>,
	background: Arc<kio_util::background::BackgroundPool>,
	metrics: BlockCacheMetrics,
}

impl<C: DriveClient> Cache<C> {
	pub fn new(capacity_bytes: u64, max_readahead: usize, background: Arc<kio_util::background::BackgroundPool>) -> Arc<Self> {
		Arc::new(Self {
			capacity_bytes: AtomicU64::new(capacity_bytes),
			max_readahead,
			inner: Mutex::new(Inner::new()),
			prefetch: Mutex::new(HashMap::new()),
			errors: Mutex::new(HashMap::new()),
			background,
			metrics: BlockCacheMetrics::new(),
		})
	}

	pub fn change_configuration(&self, capacity_bytes: u64) {
		self.capacity_bytes.store(capacity_bytes, Ordering::Relaxed);
	}

	/// Discards every cached block unconditionally, without flushing.
	/// Exposed for a full cluster-map reload, where every `Cluster` in the
	/// map is about to be replaced and nothing currently cached is worth
	/// keeping.
	pub async fn drop_all(&self) {
		let mut inner = self.inner.lock().await;
		inner.lookup.clear();
		inner.order.clear();
		inner.reverse.clear();
		inner.current_size = 0;
		inner.unused_pool.clear();
		self.metrics.cache_size_bytes.observe(&Context::current(), 0, &[]);
		self.metrics.cache_entries.observe(&Context::current(), 0, &[]);
	}

	pub async fn utilization(&self) -> f64 {
		let capacity = self.capacity_bytes.load(Ordering::Relaxed).max(1);
		let inner = self.inner.lock().await;
		inner.current_size as f64 / capacity as f64
	}

	/// Fetch (creating on miss) the block for `basename`'s `block_index`,
	/// scattered across `cluster`. Throws the oldest deferred background
	/// flush error for `owner`, if any, before doing anything else.
	pub async fn get(self: &Arc<Self>, owner: OwnerId, basename: &str, cluster: &Arc<Cluster<C>>, block_index: u64, mode: BlockMode) -> Result<Arc<Block<C>>> {
		self.get_with_request_mode(owner, basename, cluster, block_index, mode, RequestMode::Standard).await
	}

	fn get_with_request_mode<'a>(
		self: &'a Arc<Self>,
		owner: OwnerId,
		basename: &'a str,
		cluster: &'a Arc<Cluster<C>>,
		block_index: u64,
		mode: BlockMode,
		request_mode: RequestMode,
	) -> Pin<Box<dyn Future<Output = Result<Arc<Block<C>>>> + Send + 'a>> {
		Box::pin(async move {
			self.drain_owner_error(owner).await?;

			if request_mode == RequestMode::Standard {
				self.record_access_and_readahead(owner, basename, cluster, block_index).await;
			}

			let cache_key = CacheKey {
				key: format!("{}#{}", basename, block_index),
				cluster_instance: cluster.instance_id(),
			};

			let mut inner = self.inner.lock().await;
			if inner.lookup.contains_key(&cache_key) {
				self.record_owner_and_bump(&mut inner, &cache_key, owner);
				return Ok(inner.lookup.get(&cache_key).unwrap().block.clone());
			}

			self.try_shrink(&mut inner).await?;

			let reused = inner.unused_pool.pop().unwrap_or_default();
			let block = Block::new(cluster.clone(), cache_key.key.clone(), mode, reused);
			self.insert_entry(&mut inner, cache_key, owner, block.clone());
			Ok(block)
		})
	}

	/// Flushes every dirty block currently owned by `owner`.
	pub async fn flush(&self, owner: OwnerId) -> Result<()> {
		let blocks: Vec<Arc<Block<C>>> = {
			let inner = self.inner.lock().await;
			inner.lookup.values().filter(|e| e.owners.contains(&owner)).map(|e| e.block.clone()).collect()
		};
		for block in blocks {
			if block.dirty().await {
				block.flush().await?;
			}
		}
		Ok(())
	}

	/// Removes `owner` from every entry it references. If `force`, also
	/// evicts those entries outright (without flushing dirty content),
	/// regardless of any other owner still referencing them.
	pub async fn drop_owner(&self, owner: OwnerId, force: bool) {
		{
			self.prefetch.lock().await.remove(&owner);
		}
		{
			self.errors.lock().await.remove(&owner);
		}

		let mut inner = self.inner.lock().await;
		let keys: Vec<CacheKey> = inner.lookup.iter().filter(|(_, e)| e.owners.contains(&owner)).map(|(k, _)| k.clone()).collect();

		for key in keys {
			if let Some(entry) = inner.lookup.get_mut(&key) {
				entry.owners.remove(&owner);
			}
			if force {
				if let Some(block) = self.remove_entry(&mut inner, &key) {
					self.stash_or_drop(&mut inner, block);
				}
			}
		}
	}

	async fn drain_owner_error(&self, owner: OwnerId) -> Result<()> {
		let mut errors = self.errors.lock().await;
		if let Some(queue) = errors.get_mut(&owner) {
			if let Some(message) = queue.pop_front() {
				return Err(Error::message(message));
			}
		}
		Ok(())
	}

	fn record_owner_and_bump(&self, inner: &mut Inner<C>, key: &CacheKey, owner: OwnerId) {
		if let Some(old_seq) = inner.reverse.remove(key) {
			inner.order.remove(&old_seq);
		}
		let seq = inner.next_seq;
		inner.next_seq += 1;
		inner.order.insert(seq, key.clone());
		inner.reverse.insert(key.clone(), seq);
		if let Some(entry) = inner.lookup.get_mut(key) {
			entry.owners.insert(owner);
			entry.last_access = Instant::now();
		}
	}

	fn insert_entry(&self, inner: &mut Inner<C>, key: CacheKey, owner: OwnerId, block: Arc<Block<C>>) {
		inner.current_size += block.capacity();
		inner.lookup.insert(
			key.clone(),
			Entry {
				owners: HashSet::new(),
				block,
				last_access: Instant::now(),
			},
		);
		self.record_owner_and_bump(inner, &key, owner);
		self.metrics.cache_size_bytes.observe(&Context::current(), inner.current_size, &[]);
		self.metrics.cache_entries.observe(&Context::current(), inner.lookup.len() as u64, &[]);
	}

	fn remove_entry(&self, inner: &mut Inner<C>, key: &CacheKey) -> Option<Arc<Block<C>>> {
		let entry = inner.lookup.remove(key)?;
		if let Some(seq) = inner.reverse.remove(key) {
			inner.order.remove(&seq);
		}
		inner.current_size = inner.current_size.saturating_sub(entry.block.capacity());
		self.metrics.evictions.add(&Context::current(), 1, &[]);
		self.metrics.cache_size_bytes.observe(&Context::current(), inner.current_size, &[]);
		self.metrics.cache_entries.observe(&Context::current(), inner.lookup.len() as u64, &[]);
		Some(entry.block)
	}

	fn stash_or_drop(&self, inner: &mut Inner<C>, block: Arc<Block<C>>) {
		let capacity = self.capacity_bytes.load(Ordering::Relaxed).max(1);
		let pool_budget = (capacity as f64 * UNUSED_POOL_FRACTION) as u64;
		let unit = block.capacity().max(1);
		let pooled_bytes = inner.unused_pool.len() as u64 * unit;
		if pooled_bytes < pool_budget {
			inner.unused_pool.push(block.into_buffer());
		}
	}

	/// Soft pass: drop clean, unreferenced, sufficiently idle entries from
	/// the cold end and schedule a background flush for dirty ones that
	/// qualify otherwise. Forceful pass: once at or over capacity, flush
	/// the coldest entry synchronously (propagating any failure to the
	/// caller) and evict it, repeating until back under capacity.
	async fn try_shrink(self: &Arc<Self>, inner: &mut Inner<C>) -> Result<()> {
		let capacity = self.capacity_bytes.load(Ordering::Relaxed).max(1);
		if (inner.current_size as f64 / capacity as f64) < SHRINK_PRESSURE {
			return Ok(());
		}

		debug!("cache at {} bytes / {} capacity, running shrink pass", inner.current_size, capacity);
		let ordered: Vec<CacheKey> = inner.order.values().cloned().collect();
		let mut flush_jobs: Vec<(Arc<Block<C>>, Vec<OwnerId>)> = Vec::new();

		for key in &ordered {
			if (inner.current_size as f64 / capacity as f64) < SHRINK_PRESSURE {
				break;
			}
			let (unique, idle, dirty, owners, block) = match inner.lookup.get(key) {
				Some(entry) => (
					Arc::strong_count(&entry.block) == 1,
					entry.last_access.elapsed() >= IDLE_THRESHOLD,
					entry.block.try_dirty(),
					entry.owners.iter().copied().collect::<Vec<_>>(),
					entry.block.clone(),
				),
				None => continue,
			};

			match dirty {
				Some(false) if unique && (owners.is_empty() || idle) => {
					if let Some(block) = self.remove_entry(inner, key) {
						self.stash_or_drop(inner, block);
					}
				}
				Some(true) if idle => {
					flush_jobs.push((block, owners));
				}
				_ => {}
			}
		}

		for (block, owners) in flush_jobs {
			let cache = self.clone();
			self.background.try_run(async move {
				let started = std::time::Instant::now();
				let result = block.flush().await;
				cache.metrics.flush_duration.record(&Context::current(), started.elapsed().as_secs_f64(), &[]);
				if let Err(e) = result {
					warn!("background flush of {}: {}, deferring to {} owner(s)", block.key(), e, owners.len());
					let mut errors = cache.errors.lock().await;
					for owner in &owners {
						errors.entry(*owner).or_insert_with(VecDeque::new).push_back(e.to_string());
					}
				}
				Ok(())
			});
		}

		while inner.current_size >= capacity {
			let oldest_key = match inner.order.iter().next() {
				Some((_, k)) => k.clone(),
				None => break,
			};
			let block = match inner.lookup.get(&oldest_key) {
				Some(entry) => entry.block.clone(),
				None => break,
			};
			let started = std::time::Instant::now();
			let result = block.flush().await;
			self.metrics.flush_duration.record(&Context::current(), started.elapsed().as_secs_f64(), &[]);
			result?;
			if let Some(block) = self.remove_entry(inner, &oldest_key) {
				self.stash_or_drop(inner, block);
			}
		}

		Ok(())
	}

	async fn record_access_and_readahead(self: &Arc<Self>, owner: OwnerId, basename: &str, cluster: &Arc<Cluster<C>>, block_index: u64) {
		let predicted = {
			let mut prefetch = self.prefetch.lock().await;
			let oracle = prefetch.entry(owner).or_insert_with(|| PrefetchOracle::new(self.max_readahead));
			oracle.add(block_index as i64);
			drop(prefetch);
			let pressure = self.utilization().await;
			let window = readahead_window(pressure, self.max_readahead);
			let mut prefetch = self.prefetch.lock().await;
			let oracle = prefetch.get_mut(&owner).expect("just inserted above");
			oracle.predict(window, PredictionType::Continue)
		};

		for idx in predicted {
			if idx < 0 {
				continue;
			}
			let idx = idx as u64;
			let cache = self.clone();
			let cluster = cluster.clone();
			let basename = basename.to_string();
			self.metrics.readahead_scheduled.add(&Context::current(), 1, &[]);
			self.background.try_run(async move {
				if let Ok(block) = cache.get_with_request_mode(owner, &basename, &cluster, idx, BlockMode::Standard, RequestMode::Readahead).await {
					let mut probe = [0u8; 1];
					let _ = block.read(0, &mut probe).await;
				}
				Ok(())
			});
		}
	}
}

/// Linear shrink of the readahead window as pressure climbs from 0.75 to
/// 0.95; zero past 0.95, full width at or below 0.75.
fn readahead_window(pressure: f64, requested_max: usize) -> usize {
	if pressure <= 0.75 {
		return requested_max;
	}
	if pressure >= 0.95 {
		return 0;
	}
	let fraction = 1.0 - (pressure - 0.75) / 0.20;
	((requested_max as f64) * fraction).round() as usize
}

#[cfg(test)]
mod test {
	use super::*;
	use kio_codec::Codec;
	use kio_rpc::testing::FakeDrive;
	use kio_rpc::Endpoint;
	use kio_util::background::BackgroundPool;

	fn endpoint(n: u16) -> Endpoint {
		Endpoint {
			host: format!("drive-{}", n),
			port: n,
		}
	}

	fn cluster() -> Arc<Cluster<FakeDrive>> {
		let background = BackgroundPool::new(0, 4);
		let connections = (0..4)
			.map(|i| kio_rpc::ConnectionSupervisor::<FakeDrive>::new(endpoint(i), endpoint(i + 100), Duration::from_secs(5), background.clone()))
			.collect();
		Cluster::new(
			"test".to_string(),
			64 * 1024,
			connections,
			Codec::new(2, 2),
			Codec::new(1, 3),
			Duration::from_secs(1),
			background,
		)
	}

	fn cache_pool() -> Arc<kio_util::background::BackgroundPool> {
		kio_util::background::BackgroundPool::new(0, 4)
	}

	#[test]
	fn readahead_window_shrinks_linearly_and_clamps() {
		assert_eq!(readahead_window(0.5, 100), 100);
		assert_eq!(readahead_window(0.75, 100), 100);
		assert_eq!(readahead_window(0.85, 100), 50);
		assert_eq!(readahead_window(0.95, 100), 0);
		assert_eq!(readahead_window(0.99, 100), 0);
	}

	#[tokio::test]
	async fn evicts_clean_unowned_entries_under_pressure() {
		let c = cluster();
		let unit = c.block_size() as u64;
		let cache = Cache::<FakeDrive>::new(2 * unit, 0, cache_pool());

		let b0 = cache.get(1, "file", &c, 0, BlockMode::Create).await.unwrap();
		b0.write(0, b"a").await.unwrap();
		let b1 = cache.get(1, "file", &c, 1, BlockMode::Create).await.unwrap();
		b1.write(0, b"b").await.unwrap();
		drop(b0);
		drop(b1);

		cache.flush(1).await.unwrap();
		cache.drop_owner(1, false).await;

		let key0 = CacheKey {
			key: "file#0".to_string(),
			cluster_instance: c.instance_id(),
		};
		let key1 = CacheKey {
			key: "file#1".to_string(),
			cluster_instance: c.instance_id(),
		};
		let key2 = CacheKey {
			key: "file#2".to_string(),
			cluster_instance: c.instance_id(),
		};

		let _b2 = cache.get(2, "file", &c, 2, BlockMode::Create).await.unwrap();

		let inner = cache.inner.lock().await;
		assert!(!inner.lookup.contains_key(&key0), "oldest clean unowned entry should have been evicted");
		assert!(inner.lookup.contains_key(&key1));
		assert!(inner.lookup.contains_key(&key2));
	}

	#[tokio::test]
	async fn force_drop_evicts_entry_even_with_other_owners_present() {
		let c = cluster();
		let cache = Cache::<FakeDrive>::new(16 * c.block_size() as u64, 0, cache_pool());

		cache.get(1, "file", &c, 0, BlockMode::Create).await.unwrap();
		cache.get(2, "file", &c, 0, BlockMode::Create).await.unwrap();

		cache.drop_owner(1, true).await;

		let key0 = CacheKey {
			key: "file#0".to_string(),
			cluster_instance: c.instance_id(),
		};
		let inner = cache.inner.lock().await;
		assert!(!inner.lookup.contains_key(&key0), "force drop evicts regardless of remaining owners");
	}

	#[tokio::test]
	async fn non_force_drop_only_clears_ownership() {
		let c = cluster();
		let cache = Cache::<FakeDrive>::new(16 * c.block_size() as u64, 0, cache_pool());

		cache.get(1, "file", &c, 0, BlockMode::Create).await.unwrap();
		cache.drop_owner(1, false).await;

		let key0 = CacheKey {
			key: "file#0".to_string(),
			cluster_instance: c.instance_id(),
		};
		let inner = cache.inner.lock().await;
		let entry = inner.lookup.get(&key0).expect("entry stays cached without force");
		assert!(entry.owners.is_empty());
	}

	#[tokio::test]
	async fn deferred_background_error_surfaces_on_next_get() {
		let c = cluster();
		let cache = Cache::<FakeDrive>::new(16 * c.block_size() as u64, 0, cache_pool());

		{
			let mut errors = cache.errors.lock().await;
			errors.entry(1).or_insert_with(VecDeque::new).push_back("simulated flush failure".to_string());
		}

		let result = cache.get(1, "file", &c, 0, BlockMode::Create).await;
		assert!(result.is_err());
		assert_eq!(result.unwrap_err().to_string(), "simulated flush failure");

		// The error was a one-shot: the retry succeeds.
		cache.get(1, "file", &c, 0, BlockMode::Create).await.unwrap();
	}
}
