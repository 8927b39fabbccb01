//! In-memory [`DriveClient`] used throughout the workspace's tests, grounded
//! in the original's own `test/` tree (`ClusterChunkCacheTest.cc`,
//! `ClusterMapTest.cc`), which likewise fakes out the Kinetic connection
//! rather than requiring a real drive fleet.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::{DriveClient, DriveLog, DriveResult, DriveStatus, Endpoint, GetReply, WriteMode};

struct Record {
	value: Vec<u8>,
	version: String,
	tag: String,
}

/// A fake drive backed by a `HashMap`. `connect` always succeeds; failure
/// modes are injected via [`FakeDrive::fail_next`] for exercising the
/// supervisor and operation vector's error paths.
pub struct FakeDrive {
	records: Mutex<HashMap<String, Record>>,
	fail_next: Mutex<Option<DriveStatus>>,
	read_ops: AtomicU64,
	write_ops: AtomicU64,
	capacity_bytes: u64,
}

impl FakeDrive {
	pub fn new() -> Self {
		FakeDrive {
			records: Mutex::new(HashMap::new()),
			fail_next: Mutex::new(None),
			read_ops: AtomicU64::new(0),
			write_ops: AtomicU64::new(0),
			capacity_bytes: 10 * 1024 * 1024 * 1024,
		}
	}

	/// The next operation on this drive returns `status` instead of running.
	pub fn fail_next(&self, status: DriveStatus) {
		*self.fail_next.lock().unwrap() = Some(status);
	}

	fn take_injected_failure(&self) -> Option<DriveStatus> {
		self.fail_next.lock().unwrap().take()
	}

	pub fn contains(&self, key: &str) -> bool {
		self.records.lock().unwrap().contains_key(key)
	}
}

impl Default for FakeDrive {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl DriveClient for FakeDrive {
	async fn connect(_endpoint: &Endpoint) -> std::io::Result<Self> {
		Ok(FakeDrive::new())
	}

	async fn no_op(&self) -> DriveResult<()> {
		if let Some(status) = self.take_injected_failure() {
			return Err(status);
		}
		Ok(())
	}

	async fn put(
		&self,
		key: &str,
		value: Vec<u8>,
		tag: String,
		version_new: String,
		version_old: String,
		mode: WriteMode,
	) -> DriveResult<()> {
		if let Some(status) = self.take_injected_failure() {
			return Err(status);
		}
		self.write_ops.fetch_add(1, Ordering::Relaxed);
		let mut records = self.records.lock().unwrap();
		if mode == WriteMode::RequireVersion {
			let current = records.get(key).map(|r| r.version.as_str()).unwrap_or("");
			if current != version_old {
				return Err(DriveStatus::VersionMismatch);
			}
		}
		records.insert(
			key.to_string(),
			Record {
				value,
				version: version_new,
				tag,
			},
		);
		Ok(())
	}

	async fn get(&self, key: &str) -> DriveResult<GetReply> {
		if let Some(status) = self.take_injected_failure() {
			return Err(status);
		}
		self.read_ops.fetch_add(1, Ordering::Relaxed);
		let records = self.records.lock().unwrap();
		match records.get(key) {
			Some(r) => Ok(GetReply {
				value: r.value.clone(),
				version: r.version.clone(),
				tag: r.tag.clone(),
			}),
			None => Err(DriveStatus::NotFound),
		}
	}

	async fn get_version(&self, key: &str) -> DriveResult<String> {
		if let Some(status) = self.take_injected_failure() {
			return Err(status);
		}
		let records = self.records.lock().unwrap();
		match records.get(key) {
			Some(r) => Ok(r.version.clone()),
			None => Err(DriveStatus::NotFound),
		}
	}

	async fn delete(&self, key: &str, version: String, mode: WriteMode) -> DriveResult<()> {
		if let Some(status) = self.take_injected_failure() {
			return Err(status);
		}
		self.write_ops.fetch_add(1, Ordering::Relaxed);
		let mut records = self.records.lock().unwrap();
		if mode == WriteMode::RequireVersion {
			let current = records.get(key).map(|r| r.version.as_str()).unwrap_or("");
			if current != version {
				return Err(DriveStatus::VersionMismatch);
			}
		}
		records.remove(key);
		Ok(())
	}

	async fn get_key_range(&self, start: &str, end: &str, max: usize) -> DriveResult<Vec<String>> {
		if let Some(status) = self.take_injected_failure() {
			return Err(status);
		}
		let records = self.records.lock().unwrap();
		let mut keys: Vec<String> = records
			.keys()
			.filter(|k| k.as_str() >= start && k.as_str() < end)
			.cloned()
			.collect();
		keys.sort();
		keys.truncate(max);
		Ok(keys)
	}

	async fn get_log(&self) -> DriveResult<DriveLog> {
		if let Some(status) = self.take_injected_failure() {
			return Err(status);
		}
		let records = self.records.lock().unwrap();
		let bytes_used: u64 = records.values().map(|r| r.value.len() as u64).sum();
		Ok(DriveLog {
			bytes_total: self.capacity_bytes,
			bytes_used,
			read_ops: self.read_ops.load(Ordering::Relaxed),
			read_bytes: 0,
			write_ops: self.write_ops.load(Ordering::Relaxed),
			write_bytes: 0,
			utilization_percent: (bytes_used as f64 / self.capacity_bytes as f64) * 100.0,
		})
	}
}
