//! A single cached block: a lazily-fetched, lazily-flushed view of one
//! stripe's worth of a file's data.

use std::sync::Arc;

use tokio::sync::Mutex;

use kio_model::{Cluster, KeyType};
use kio_rpc::DriveClient;
use kio_util::data::Version;
use kio_util::error::Result;

/// Whether a block was opened against data already known to exist
/// (`Standard`) or is being created fresh (`Create`, which skips the
/// initial fetch and starts out empty and dirty).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockMode {
	Standard,
	Create,
}

struct BlockState {
	version: Version,
	buffer: Vec<u8>,
	fetched: bool,
	dirty: bool,
	updates: Vec<(usize, usize)>,
	mode: BlockMode,
}

/// One block of a file, cached in memory. Every read, write, truncate and
/// flush goes through this block's own mutex, so a background flush can
/// never race a foreground write and tear the buffer.
pub struct Block<C: DriveClient> {
	cluster: Arc<Cluster<C>>,
	key: String,
	state: Mutex<BlockState>,
}

impl<C: DriveClient> Block<C> {
	pub(crate) fn new(cluster: Arc<Cluster<C>>, key: String, mode: BlockMode, reused_buffer: Vec<u8>) -> Arc<Self> {
		let mut buffer = reused_buffer;
		buffer.clear();
		let fetched = mode == BlockMode::Create;
		Arc::new(Self {
			cluster,
			key,
			state: Mutex::new(BlockState {
				version: Version::empty(),
				buffer,
				fetched,
				dirty: mode == BlockMode::Create,
				updates: Vec::new(),
				mode,
			}),
		})
	}

	pub fn key(&self) -> &str {
		&self.key
	}

	/// The byte budget this block counts against in the cache's capacity
	/// accounting: the cluster's fixed block size, not the buffer's actual
	/// occupied length.
	pub fn capacity(&self) -> u64 {
		self.cluster.block_size() as u64
	}

	async fn ensure_fetched(&self) -> Result<()> {
		let mut st = self.state.lock().await;
		if st.fetched {
			return Ok(());
		}
		let (version, value) = self.cluster.get_with_version(&self.key, KeyType::Data).await?;
		match value {
			Some(data) => {
				st.version = version;
				st.buffer = data;
			}
			None => {
				st.version = Version::empty();
				st.buffer.clear();
			}
		}
		st.fetched = true;
		Ok(())
	}

	pub async fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize> {
		self.ensure_fetched().await?;
		let st = self.state.lock().await;
		if offset >= st.buffer.len() {
			return Ok(0);
		}
		let n = buf.len().min(st.buffer.len() - offset);
		buf[..n].copy_from_slice(&st.buffer[offset..offset + n]);
		Ok(n)
	}

	pub async fn write(&self, offset: usize, data: &[u8]) -> Result<()> {
		self.ensure_fetched().await?;
		let mut st = self.state.lock().await;
		let end = offset + data.len();
		if st.buffer.len() < end {
			st.buffer.resize(end, 0);
		}
		st.buffer[offset..end].copy_from_slice(data);
		record_update(&mut st.updates, offset, data.len());
		st.dirty = true;
		Ok(())
	}

	pub async fn truncate(&self, size: usize) -> Result<()> {
		self.ensure_fetched().await?;
		let mut st = self.state.lock().await;
		st.buffer.resize(size, 0);
		record_update(&mut st.updates, size, 0);
		st.dirty = true;
		Ok(())
	}

	pub async fn size(&self) -> usize {
		self.state.lock().await.buffer.len()
	}

	pub async fn dirty(&self) -> bool {
		self.state.lock().await.dirty
	}

	/// Best-effort, non-blocking dirty check used by the cache's shrink
	/// pass, which can't await a per-block lock while holding the cache's
	/// own lock. Returns `None` if the block is momentarily busy.
	pub(crate) fn try_dirty(&self) -> Option<bool> {
		self.state.try_lock().ok().map(|st| st.dirty)
	}

	/// Write the buffer back if dirty, using the block's last-known version
	/// as the precondition. No-op if the block isn't dirty.
	pub async fn flush(&self) -> Result<()> {
		let (version, buffer, dirty) = {
			let st = self.state.lock().await;
			(st.version.clone(), st.buffer.clone(), st.dirty)
		};
		if !dirty {
			return Ok(());
		}
		let new_version = self.cluster.put(&self.key, &version, &buffer, KeyType::Data).await?;
		let mut st = self.state.lock().await;
		st.version = new_version;
		st.dirty = false;
		st.updates.clear();
		st.mode = BlockMode::Standard;
		Ok(())
	}

	/// Steal the buffer's allocation back for reuse by the cache's unused
	/// pool. Only safe to call once the block has been fully evicted (no
	/// owners, not referenced from the lookup table); returns an empty
	/// buffer if some other caller is still holding a reference.
	pub(crate) fn into_buffer(self: Arc<Self>) -> Vec<u8> {
		match Arc::try_unwrap(self) {
			Ok(block) => block.state.into_inner().buffer,
			Err(_) => Vec::new(),
		}
	}
}

/// Merge a new `(offset, len)` span into the non-overlapping updates list,
/// coalescing it with any existing span it touches or overlaps.
fn record_update(updates: &mut Vec<(usize, usize)>, offset: usize, len: usize) {
	let new_end = offset + len;
	let mut merged_start = offset;
	let mut merged_end = new_end;
	updates.retain(|&(s, l)| {
		let e = s + l;
		let touches = s <= merged_end && e >= merged_start;
		if touches {
			merged_start = merged_start.min(s);
			merged_end = merged_end.max(e);
		}
		!touches
	});
	updates.push((merged_start, merged_end - merged_start));
}

#[cfg(test)]
mod test {
	use super::*;
	use kio_codec::Codec;
	use kio_rpc::testing::FakeDrive;
	use kio_rpc::Endpoint;
	use kio_util::background::BackgroundPool;
	use std::time::Duration;

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

	#[tokio::test]
	async fn create_mode_starts_empty_and_dirty() {
		let block = Block::new(cluster(), "file/0".to_string(), BlockMode::Create, Vec::new());
		assert!(block.dirty().await);
		assert_eq!(block.size().await, 0);
	}

	#[tokio::test]
	async fn write_then_read_round_trips_before_flush() {
		let block = Block::new(cluster(), "file/0".to_string(), BlockMode::Create, Vec::new());
		block.write(0, b"hello world").await.unwrap();
		let mut buf = [0u8; 5];
		let n = block.read(6, &mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"world");
	}

	#[tokio::test]
	async fn flush_persists_and_clears_dirty() {
		let c = cluster();
		let block = Block::new(c.clone(), "file/0".to_string(), BlockMode::Create, Vec::new());
		block.write(0, b"durable").await.unwrap();
		block.flush().await.unwrap();
		assert!(!block.dirty().await);

		let readback = c.get("file/0", KeyType::Data).await.unwrap();
		assert_eq!(readback, b"durable".to_vec());
	}

	#[tokio::test]
	async fn standard_mode_fetches_existing_content() {
		let c = cluster();
		c.put_forced("file/0", b"preexisting", KeyType::Data).await.unwrap();

		let block = Block::new(c, "file/0".to_string(), BlockMode::Standard, Vec::new());
		let mut buf = [0u8; 11];
		let n = block.read(0, &mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"preexisting");
		assert!(!block.dirty().await);
	}
}
