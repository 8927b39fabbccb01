//! Turns a loaded [`Config`] into a live map of [`Cluster`]s: one
//! `ConnectionSupervisor` per listed drive, one shared background pool per
//! cluster, and the two codecs (striped for `Data`, fully-replicated for
//! `Metadata`/`Attribute`) each cluster's definition implies.

use std::collections::HashMap;
use std::sync::Arc;

use kio_codec::Codec;
use kio_model::Cluster;
use kio_rpc::{ConnectionSupervisor, Endpoint, TcpDriveClient};
use kio_util::background::BackgroundPool;
use kio_util::config::{Config, DriveLocation};
use kio_util::error::{Error, Result};

pub type ClusterMap = HashMap<String, Arc<Cluster<TcpDriveClient>>>;

fn endpoints(drive: &DriveLocation) -> (Endpoint, Endpoint) {
	let primary = Endpoint { host: drive.host.clone(), port: drive.port };
	let secondary = match (&drive.host_secondary, drive.port_secondary) {
		(Some(host), Some(port)) => Endpoint { host: host.clone(), port },
		_ => primary.clone(),
	};
	(primary, secondary)
}

/// Build one [`Cluster`] per entry in `config.clusters`, resolving each
/// listed drive WWN against `config.drives`.
pub fn build_clusters(config: &Config) -> Result<ClusterMap> {
	let drives_by_wwn: HashMap<&str, &DriveLocation> = config.drives.iter().map(|d| (d.wwn.as_str(), d)).collect();

	let mut clusters = ClusterMap::new();
	for cluster_config in &config.clusters {
		let background = BackgroundPool::new(config.global.background_queue_depth, config.global.background_threads);

		let mut connections = Vec::with_capacity(cluster_config.drives.len());
		for wwn in &cluster_config.drives {
			let drive = drives_by_wwn
				.get(wwn.as_str())
				.ok_or_else(|| Error::invalid_argument(format!("cluster {} names unknown drive {}", cluster_config.cluster_id, wwn)))?;
			let (primary, secondary) = endpoints(drive);
			connections.push(ConnectionSupervisor::<TcpDriveClient>::new(
				primary,
				secondary,
				cluster_config.min_reconnect_interval(),
				background.clone(),
			));
		}

		let data_codec = Codec::new(cluster_config.num_data, cluster_config.num_parity);
		let metadata_codec = Codec::new(1, cluster_config.drives.len().saturating_sub(1));

		let cluster = Cluster::new(
			cluster_config.cluster_id.clone(),
			cluster_config.block_size(),
			connections,
			data_codec,
			metadata_codec,
			cluster_config.timeout(),
			background,
		);
		clusters.insert(cluster_config.cluster_id.clone(), cluster);
	}

	if clusters.is_empty() {
		return Err(Error::invalid_argument("cluster map is empty, nothing to serve"));
	}
	Ok(clusters)
}

#[cfg(test)]
mod test {
	use super::*;
	use kio_util::config::{ClusterConfig, GlobalConfig};

	fn drive(wwn: &str) -> DriveLocation {
		DriveLocation {
			wwn: wwn.to_string(),
			host: format!("{}.local", wwn),
			port: 8123,
			host_secondary: None,
			port_secondary: None,
		}
	}

	fn config(num_data: usize, num_parity: usize, drive_count: usize) -> Config {
		let drives: Vec<DriveLocation> = (0..drive_count).map(|i| drive(&format!("wwn{}", i))).collect();
		let cluster = ClusterConfig {
			cluster_id: "cl1".to_string(),
			num_data,
			num_parity,
			chunk_size_kb: 1024,
			min_reconnect_interval_ms: 5_000,
			timeout_ms: 60_000,
			drives: drives.iter().map(|d| d.wwn.clone()).collect(),
		};
		Config {
			global: GlobalConfig::default(),
			clusters: vec![cluster],
			drives,
			security: vec![],
		}
	}

	#[test]
	fn builds_one_cluster_per_definition() {
		let clusters = build_clusters(&config(3, 2, 6)).unwrap();
		assert_eq!(clusters.len(), 1);
		assert!(clusters.contains_key("cl1"));
	}

	#[test]
	fn rejects_a_cluster_naming_an_unknown_drive() {
		let mut cfg = config(3, 2, 6);
		cfg.clusters[0].drives.push("does-not-exist".to_string());
		assert!(build_clusters(&cfg).is_err());
	}
}
