//! KIO configuration: three JSON documents (drive locations, drive
//! security, cluster definitions) plus a top-level `configuration` block.
//! Each document is read from an environment variable that either holds the
//! JSON inline or a path to it -- selected by the first character of the
//! variable's value (`/` or `.` means a path).

use std::io::Read;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};

/// One drive's network location, as listed in the "drive locations" JSON
/// document.
#[derive(Deserialize, Debug, Clone)]
pub struct DriveLocation {
	pub wwn: String,
	pub host: String,
	pub port: u16,
	#[serde(default)]
	pub host_secondary: Option<String>,
	#[serde(default)]
	pub port_secondary: Option<u16>,
}

/// Per-drive security credentials, as listed in the "drive security" JSON
/// document. Out of scope for the core (the wire protocol client consumes
/// it), but parsed here since the library owns the configuration surface.
#[derive(Deserialize, Debug, Clone)]
pub struct DriveSecurity {
	pub wwn: String,
	#[serde(default)]
	pub user_id: u32,
	#[serde(default)]
	pub key: String,
}

/// One cluster's definition, as listed in the "cluster definitions" JSON
/// document.
#[derive(Deserialize, Debug, Clone)]
pub struct ClusterConfig {
	#[serde(rename = "clusterID")]
	pub cluster_id: String,
	#[serde(rename = "numData")]
	pub num_data: usize,
	#[serde(rename = "numParity")]
	pub num_parity: usize,
	#[serde(rename = "chunkSizeKB")]
	pub chunk_size_kb: usize,
	#[serde(rename = "minReconnectInterval", default = "default_min_reconnect_interval_ms")]
	pub min_reconnect_interval_ms: u64,
	#[serde(rename = "timeout", default = "default_timeout_ms")]
	pub timeout_ms: u64,
	pub drives: Vec<String>,
}

impl ClusterConfig {
	pub fn block_size(&self) -> usize {
		self.chunk_size_kb * 1024
	}

	pub fn min_reconnect_interval(&self) -> Duration {
		Duration::from_millis(self.min_reconnect_interval_ms)
	}

	pub fn timeout(&self) -> Duration {
		Duration::from_millis(self.timeout_ms)
	}
}

fn default_min_reconnect_interval_ms() -> u64 {
	5_000
}
fn default_timeout_ms() -> u64 {
	60_000
}

/// The top-level `configuration` object: cache capacity, readahead bound,
/// and background-pool bounds.
#[derive(Deserialize, Debug, Clone)]
pub struct GlobalConfig {
	#[serde(rename = "cacheCapacityMB", default = "default_cache_capacity_mb")]
	pub cache_capacity_mb: u64,
	#[serde(rename = "maxReadahead", default = "default_max_readahead")]
	pub max_readahead: usize,
	#[serde(rename = "backgroundThreads", default = "default_background_threads")]
	pub background_threads: usize,
	#[serde(rename = "backgroundQueueDepth", default)]
	pub background_queue_depth: usize,
}

fn default_cache_capacity_mb() -> u64 {
	512
}
fn default_max_readahead() -> usize {
	10
}
fn default_background_threads() -> usize {
	4
}

impl Default for GlobalConfig {
	fn default() -> Self {
		GlobalConfig {
			cache_capacity_mb: default_cache_capacity_mb(),
			max_readahead: default_max_readahead(),
			background_threads: default_background_threads(),
			background_queue_depth: 0,
		}
	}
}

#[derive(Deserialize, Debug, Clone, Default)]
struct ClusterDefinitionsDocument {
	#[serde(default)]
	configuration: GlobalConfig,
	#[serde(default)]
	clusters: Vec<ClusterConfig>,
}

/// The fully assembled configuration: everything needed to build the
/// cluster map and the shared background infrastructure.
#[derive(Debug, Clone)]
pub struct Config {
	pub global: GlobalConfig,
	pub clusters: Vec<ClusterConfig>,
	pub drives: Vec<DriveLocation>,
	pub security: Vec<DriveSecurity>,
}

/// Resolve an environment variable that names either an inline JSON
/// document or a path to one.
fn resolve_document(env_var: &str) -> Result<String> {
	let value = std::env::var(env_var)
		.map_err(|_| Error::invalid_argument(format!("environment variable {} is not set", env_var)))?;
	let looks_like_path = value.starts_with('/') || value.starts_with('.');
	if looks_like_path {
		read_file(Path::new(&value))
	} else {
		Ok(value)
	}
}

fn read_file(path: &Path) -> Result<String> {
	let mut file = std::fs::OpenOptions::new().read(true).open(path)?;
	let mut contents = String::new();
	file.read_to_string(&mut contents)?;
	Ok(contents)
}

/// Load configuration from the three environment variables:
/// `KIO_DRIVE_LOCATIONS`, `KIO_DRIVE_SECURITY`, `KIO_CLUSTER_MAP`.
pub fn read_config() -> Result<Config> {
	let drives: Vec<DriveLocation> = serde_json::from_str(&resolve_document("KIO_DRIVE_LOCATIONS")?)?;
	let security: Vec<DriveSecurity> = serde_json::from_str(&resolve_document("KIO_DRIVE_SECURITY")?)?;
	let doc: ClusterDefinitionsDocument = serde_json::from_str(&resolve_document("KIO_CLUSTER_MAP")?)?;

	for cluster in &doc.clusters {
		if cluster.num_data == 0 {
			return Err(Error::invalid_argument(format!(
				"cluster {} has numData == 0",
				cluster.cluster_id
			)));
		}
		if cluster.drives.len() < cluster.num_data + cluster.num_parity {
			return Err(Error::invalid_argument(format!(
				"cluster {} lists fewer drives ({}) than numData+numParity ({})",
				cluster.cluster_id,
				cluster.drives.len(),
				cluster.num_data + cluster.num_parity
			)));
		}
	}

	Ok(Config {
		global: doc.configuration,
		clusters: doc.clusters,
		drives,
		security,
	})
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn parses_cluster_definitions() {
		let json = r#"
        {
            "configuration": { "cacheCapacityMB": 1024, "maxReadahead": 8, "backgroundThreads": 2, "backgroundQueueDepth": 100 },
            "clusters": [
                { "clusterID": "c1", "numData": 10, "numParity": 3, "chunkSizeKB": 1024,
                  "minReconnectInterval": 5000, "timeout": 60000,
                  "drives": ["wwn1","wwn2","wwn3","wwn4","wwn5","wwn6","wwn7","wwn8","wwn9","wwn10","wwn11","wwn12","wwn13"] }
            ]
        }"#;
		let doc: ClusterDefinitionsDocument = serde_json::from_str(json).unwrap();
		assert_eq!(doc.clusters.len(), 1);
		assert_eq!(doc.clusters[0].block_size(), 1024 * 1024);
		assert_eq!(doc.configuration.cache_capacity_mb, 1024);
	}
}
