//! Entry point: loads the three configuration documents, builds the
//! cluster map, and runs the requested admin sweep against one cluster.
//! Does not implement the POSIX file façade -- this binary only exists so
//! the admin sweep has somewhere to run from the command line.

mod cli;
mod cluster_map;

use std::process::ExitCode;

use structopt::StructOpt;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use kio_admin::{AdminOperation, KeyCounts};
use kio_rpc::TcpDriveClient;
use kio_util::config::read_config;
use kio_util::error::{Error, Result};

use cli::{Command, Opt, SweepOpt};
use cluster_map::{build_clusters, ClusterMap};

fn init_logging() {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
		.init();
}

fn progress(label: &str) -> impl FnMut(u64) -> bool + '_ {
	move |total| {
		info!("{}: {} keys seen so far", label, total);
		true
	}
}

fn print_counts(op: &str, counts: KeyCounts) {
	println!(
		"{}: total={} incomplete={} need_action={} repaired={} removed={} unrepairable={}",
		op, counts.total, counts.incomplete, counts.need_action, counts.repaired, counts.removed, counts.unrepairable
	);
}

async fn resolve_admin(clusters: &ClusterMap, opt: &SweepOpt) -> Result<AdminOperation<TcpDriveClient>> {
	let cluster = clusters
		.get(&opt.cluster)
		.ok_or_else(|| Error::invalid_argument(format!("unknown cluster {}", opt.cluster)))?;
	Ok(AdminOperation::new(cluster.clone()))
}

async fn run(command: Command, clusters: &ClusterMap) -> Result<()> {
	match command {
		Command::Count(opt) => {
			let admin = resolve_admin(clusters, &opt).await?;
			let total = admin.count(opt.target.0, progress("count")).await?;
			println!("count: total={}", total);
		}
		Command::Scan(opt) => {
			let admin = resolve_admin(clusters, &opt).await?;
			let counts = admin.scan(opt.target.0, progress("scan"), opt.threads).await?;
			print_counts("scan", counts);
		}
		Command::Repair(opt) => {
			if !opt.yes {
				return Err(Error::invalid_argument("repair is destructive to unfixable keys, pass --yes to confirm"));
			}
			let admin = resolve_admin(clusters, &opt).await?;
			let counts = admin.repair(opt.target.0, progress("repair"), opt.threads).await?;
			print_counts("repair", counts);
		}
		Command::Reset(opt) => {
			if !opt.yes {
				return Err(Error::invalid_argument("reset force-removes every key in the namespace, pass --yes to confirm"));
			}
			let admin = resolve_admin(clusters, &opt).await?;
			let counts = admin.reset(opt.target.0, progress("reset"), opt.threads).await?;
			print_counts("reset", counts);
		}
	}
	Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
	init_logging();

	let opt = Opt::from_args();

	let config = match read_config() {
		Ok(config) => config,
		Err(e) => {
			error!("failed to load configuration: {}", e);
			return ExitCode::FAILURE;
		}
	};

	let clusters = match build_clusters(&config) {
		Ok(clusters) => clusters,
		Err(e) => {
			error!("failed to build cluster map: {}", e);
			return ExitCode::FAILURE;
		}
	};

	match run(opt.command, &clusters).await {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			error!("{}", e);
			ExitCode::FAILURE
		}
	}
}
