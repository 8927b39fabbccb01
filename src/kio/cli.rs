//! Command-line surface: one subcommand per admin sweep, each taking the
//! cluster to run against, the key namespace to target, and how many
//! keys to work on concurrently.

use structopt::StructOpt;

use kio_admin::Target;

#[derive(StructOpt, Debug)]
#[structopt(name = "kio", about = "Process wiring and admin sweeps for a KIO cluster map")]
pub struct Opt {
	#[structopt(subcommand)]
	pub command: Command,
}

#[derive(StructOpt, Debug)]
pub enum Command {
	/// Tally keys in a namespace without touching any of them
	Count(SweepOpt),
	/// Classify every key in a namespace as ok, incomplete, need_action or unfixable
	Scan(SweepOpt),
	/// Scan, then reconstruct or remove whatever a scan flags as needing action
	Repair(SweepOpt),
	/// Force-remove every key in a namespace
	Reset(SweepOpt),
}

#[derive(StructOpt, Debug)]
pub struct SweepOpt {
	/// Cluster ID to run against, as named in the cluster definitions document
	#[structopt(short = "c", long = "cluster")]
	pub cluster: String,

	/// Key namespace to sweep: data, metadata, attribute or indicator
	#[structopt(short = "t", long = "target")]
	pub target: TargetArg,

	/// Concurrent keys in flight at a time (ignored for count, which is single-threaded)
	#[structopt(long = "threads", default_value = "4")]
	pub threads: usize,

	/// Required to actually repair or reset; scan and count never need it
	#[structopt(long = "yes")]
	pub yes: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct TargetArg(pub Target);

impl std::str::FromStr for TargetArg {
	type Err = String;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		match s {
			"data" => Ok(TargetArg(Target::Data)),
			"metadata" => Ok(TargetArg(Target::Metadata)),
			"attribute" => Ok(TargetArg(Target::Attribute)),
			"indicator" => Ok(TargetArg(Target::Indicator)),
			other => Err(format!("unknown target {}", other)),
		}
	}
}
