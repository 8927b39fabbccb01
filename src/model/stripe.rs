//! Stripe placement, GET, PUT and DEL: the per-key algorithms that turn one
//! logical value into a set of fragments spread across a drive fleet, and
//! read them back even when some of the fleet disagrees or is unreachable.
//!
//! Every operation here addresses a fixed-size window of drives selected by
//! hashing the key; [`StripeOperation`] never itself knows about key types
//! or background statistics, that belongs to the cluster façade above it.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use kio_codec::Codec;
use kio_rpc::{ConnectionSupervisor, DriveClient, DriveResult, DriveStatus, GetReply, OperationVector, WriteMode};
use kio_util::data::{compute_tag, verify_tag, Version};
use kio_util::error::{Error, Result};

/// Outcome of a GET: the version agreed on, the reconstructed value (`None`
/// when the caller only asked for the version), and whether a drive in the
/// stripe needs repair.
#[derive(Debug, Clone)]
pub struct GetOutcome {
	pub version: Version,
	pub value: Option<Vec<u8>>,
	pub need_indicator: bool,
}

/// Outcome of a PUT or DEL: the version now durable at quorum, whether a
/// repair indicator was raised, and the settled status.
#[derive(Debug, Clone)]
pub struct WriteOutcome {
	pub version: Version,
	pub need_indicator: bool,
	pub status: DriveStatus,
}

/// Result of a full-width, version-only scan across a key's stripe, carrying
/// the raw quorum detail a GET's aggregated outcome doesn't expose: how many
/// drives answered at all, how many agree on the most common version, how
/// many report the key absent outright, and the stripe width `n_data` needed
/// to reconstruct. Used by the admin scan/repair loop to classify a key
/// without attempting reconstruction.
#[derive(Debug, Clone)]
pub struct ScanOutcome {
	pub version: Version,
	pub responded: usize,
	pub agreeing: usize,
	pub not_found: usize,
	pub total: usize,
	pub n_data: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanClassification {
	/// Every drive responded and agrees.
	Ok,
	/// Fewer than the full stripe width answered; no further judgement made.
	Incomplete,
	/// A version (or absence) has quorum but not every drive, repair closes the gap.
	NeedAction,
	/// No version, present or absent, reaches the `n_data` quorum needed.
	Unfixable,
}

impl ScanOutcome {
	/// True once enough drives report the key absent that it should be
	/// treated as gone rather than repaired in place.
	pub fn mostly_not_found(&self) -> bool {
		self.not_found >= self.n_data && self.agreeing < self.n_data
	}

	pub fn classify(&self) -> ScanClassification {
		if self.responded < self.total {
			ScanClassification::Incomplete
		} else if self.agreeing == self.responded && self.responded >= self.n_data {
			ScanClassification::Ok
		} else if self.agreeing >= self.n_data || self.not_found >= self.n_data {
			ScanClassification::NeedAction
		} else {
			ScanClassification::Unfixable
		}
	}
}

struct Plan {
	drive_index: usize,
	key: String,
}

struct FragmentResult {
	version: Option<Version>,
	record: Option<GetReply>,
}

struct Attempt {
	outcome: Option<GetOutcome>,
	version: Version,
}

enum ResolveOp<'a> {
	Put(&'a [Vec<u8>]),
	Del,
}

pub struct StripeOperation;

impl StripeOperation {
	/// Read a key. `skip_value` requests a version-only read (cheaper, used
	/// by metadata lookups and by the partial-write resolution protocol).
	pub async fn get<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		key: &str,
		skip_value: bool,
		codec: &Codec,
		deadline: Duration,
	) -> Result<GetOutcome> {
		let n = connections.len();
		if n == 0 {
			return Err(Error::invalid_argument("cluster has no connections"));
		}
		let hash = hash_key(key);
		let n_data = codec.n_data();
		let n_parity = codec.n_parity();

		let mut plan = initial_plan(hash, n, 0, n_data, key);
		let mut last_version = Version::empty();

		if n_data > 1 {
			let attempt = Self::attempt(connections, &plan, skip_value, codec, deadline).await;
			if let Some(outcome) = attempt.outcome {
				return Ok(Self::finish_get(connections, key, outcome, deadline).await);
			}
			last_version = attempt.version;
		}

		if plan.len() == n_data && n_parity > 0 {
			plan.extend(initial_plan(hash, n, plan.len(), n_parity, key));
		}
		let attempt = Self::attempt(connections, &plan, skip_value, codec, deadline).await;
		if let Some(outcome) = attempt.outcome {
			return Ok(Self::finish_get(connections, key, outcome, deadline).await);
		}
		last_version = attempt.version;

		if !last_version.is_empty() {
			let handoff = Self::find_handoff_fragments(connections, key, &last_version, deadline).await;
			if !handoff.is_empty() {
				for (chunk, drive_index) in handoff {
					if chunk < plan.len() {
						plan[chunk] = Plan {
							drive_index,
							key: handoff_key(key, &last_version, chunk),
						};
					}
				}
				let attempt = Self::attempt(connections, &plan, skip_value, codec, deadline).await;
				if let Some(outcome) = attempt.outcome {
					return Ok(Self::finish_get(connections, key, outcome, deadline).await);
				}
			}
		}

		Err(Error::Unfixable(format!("key {} is not accessible", key)))
	}

	/// Write a key. `version_old` is the expected current version; pass
	/// [`Version::empty`] with `mode` [`WriteMode::IgnoreVersion`] to force
	/// an unconditional write.
	pub async fn put<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		key: &str,
		version_new: &Version,
		version_old: &Version,
		fragments: Vec<Vec<u8>>,
		mode: WriteMode,
		codec: &Codec,
		deadline: Duration,
	) -> Result<WriteOutcome> {
		if fragments.len() != codec.stripe_size() {
			return Err(Error::invalid_argument(format!(
				"stripe has {} fragments, expected {}",
				fragments.len(),
				codec.stripe_size()
			)));
		}
		let n = connections.len();
		let hash = hash_key(key);
		let plan = initial_plan(hash, n, 0, codec.stripe_size(), key);

		let futures = plan.iter().enumerate().map(|(i, p)| {
			let drive = connections[p.drive_index].clone();
			let key = p.key.clone();
			let value = fragments[i].clone();
			let version_new = version_new.to_string();
			let version_old = version_old.to_string();
			async move { Self::put_once(&drive, &key, value, version_new, version_old, mode, deadline).await }
		});
		let mut statuses: Vec<DriveStatus> = futures::future::join_all(futures).await;

		let has_ok = statuses.iter().any(|s| *s == DriveStatus::Ok);
		let has_conflict = statuses
			.iter()
			.any(|s| matches!(s, DriveStatus::VersionMismatch | DriveStatus::NotFound));
		if has_ok && has_conflict {
			match Self::resolve_write(connections, &plan, ResolveOp::Put(&fragments), version_new, deadline).await {
				Ok(resolved) => statuses = resolved,
				Err(Error::VersionMismatch) => {
					return Ok(WriteOutcome {
						version: version_new.clone(),
						need_indicator: false,
						status: DriveStatus::VersionMismatch,
					})
				}
				Err(e) => return Err(e),
			}
		}

		Self::finish_write(connections, key, version_new, Some(&fragments), &statuses, codec, deadline).await
	}

	/// Delete a key. Uses the same concurrency-resolution protocol as
	/// `put`, with an empty target version.
	pub async fn del<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		key: &str,
		version: &Version,
		mode: WriteMode,
		codec: &Codec,
		deadline: Duration,
	) -> Result<WriteOutcome> {
		let n = connections.len();
		let hash = hash_key(key);
		let plan = initial_plan(hash, n, 0, codec.stripe_size(), key);

		let futures = plan.iter().map(|p| {
			let drive = connections[p.drive_index].clone();
			let key = p.key.clone();
			let version = version.to_string();
			async move { Self::delete_once(&drive, &key, version, mode, deadline).await }
		});
		let mut statuses: Vec<DriveStatus> = futures::future::join_all(futures).await;

		// A drive that never had the key is as good as deleted there.
		for s in statuses.iter_mut() {
			if *s == DriveStatus::NotFound {
				*s = DriveStatus::Ok;
			}
		}

		let has_ok = statuses.iter().any(|s| *s == DriveStatus::Ok);
		let has_conflict = statuses.iter().any(|s| *s == DriveStatus::VersionMismatch);
		if has_ok && has_conflict {
			match Self::resolve_write(connections, &plan, ResolveOp::Del, &Version::empty(), deadline).await {
				Ok(resolved) => statuses = resolved,
				Err(Error::VersionMismatch) => {
					return Ok(WriteOutcome {
						version: Version::empty(),
						need_indicator: false,
						status: DriveStatus::VersionMismatch,
					})
				}
				Err(e) => return Err(e),
			}
		}

		Self::finish_write(connections, key, &Version::empty(), None, &statuses, codec, deadline).await
	}

	/// Tie-breaker for initial-write contention: polls the stripe like the
	/// partial-write protocol's exhaustion path, but for the case where no
	/// drive has durably accepted anything yet. Returns whether `version`
	/// should now be forced through with [`WriteMode::IgnoreVersion`].
	pub async fn may_force<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		key: &str,
		version: &Version,
		codec: &Codec,
		deadline: Duration,
	) -> bool {
		let n = connections.len();
		let hash = hash_key(key);
		let plan = initial_plan(hash, n, 0, codec.stripe_size(), key);
		let mut counter = 0usize;

		loop {
			let fetched = fetch_plan(connections, &plan, true, deadline).await;
			let version_results = version_results_of(&fetched);
			let (most_frequent, frequency) = most_frequent_version(&version_results, true);

			if frequency > 0 && most_frequent == *version {
				return true;
			}
			if frequency >= codec.n_data() {
				return false;
			}

			let position = version_results
				.iter()
				.position(|r| matches!(r, Ok(v) if v == version))
				.unwrap_or(plan.len());
			if counter > 10 * position {
				return true;
			}

			counter += 1;
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
	}

	/// Full-width, version-only read used purely to classify a key's
	/// redundancy state; never attempts reconstruction or raises an
	/// indicator, unlike `get`.
	pub async fn scan<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		key: &str,
		codec: &Codec,
		deadline: Duration,
	) -> ScanOutcome {
		let n = connections.len();
		let hash = hash_key(key);
		let plan = initial_plan(hash, n, 0, codec.stripe_size(), key);
		let fetched = fetch_plan(connections, &plan, true, deadline).await;
		let version_results = version_results_of(&fetched);

		let mut responded = 0usize;
		let mut not_found = 0usize;
		for r in &version_results {
			match r {
				Ok(_) => responded += 1,
				Err(DriveStatus::NotFound) => {
					responded += 1;
					not_found += 1;
				}
				_ => {}
			}
		}
		let (version, agreeing) = most_frequent_version(&version_results, false);

		ScanOutcome {
			version,
			responded,
			agreeing,
			not_found,
			total: plan.len(),
			n_data: codec.n_data(),
		}
	}

	/// Remove every handoff fragment ever written for `key`, at any version,
	/// then the repair indicator itself. Used once a key has been brought
	/// back to full redundancy and when resetting an indicator outright.
	pub async fn remove_indicator_and_handoffs<C: DriveClient>(connections: &[Arc<ConnectionSupervisor<C>>], key: &str, deadline: Duration) {
		let start = format!("handoff={}", key);
		let end = format!("{}~", start);
		let outcomes = OperationVector::fan_out(connections, deadline, {
			let start = start.clone();
			let end = end.clone();
			move |client| {
				let start = start.clone();
				let end = end.clone();
				async move { client.get_key_range(&start, &end, 100).await }
			}
		})
		.await;

		for outcome in outcomes {
			let drive_index = outcome.drive_index;
			if let Ok(keys) = outcome.result {
				for handoff in keys {
					Self::delete_once(&connections[drive_index], &handoff, String::new(), WriteMode::IgnoreVersion, deadline).await;
				}
			}
		}

		let indicator_key = format!("indicator:{}", key);
		let n = connections.len();
		let hash = hash_key(&indicator_key);
		let mut offset = 0usize;
		loop {
			let drive_index = select_drives(hash, n, offset, 1)[0];
			offset += 1;
			let status = Self::delete_once(&connections[drive_index], &indicator_key, String::new(), WriteMode::IgnoreVersion, deadline).await;
			if matches!(status, DriveStatus::Ok | DriveStatus::NotFound) || offset >= n {
				break;
			}
		}
	}

	/// Scan the handoff key range for `version` and return the
	/// `(chunk_index, drive_index)` pairs found, so a caller can rewire a
	/// GET or repair onto them.
	pub async fn find_handoff_fragments<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		key: &str,
		version: &Version,
		deadline: Duration,
	) -> Vec<(usize, usize)> {
		let start = format!("handoff={}version={}", key, version.as_str());
		let end = format!("{}~", start);
		let outcomes = OperationVector::fan_out(connections, deadline, {
			let start = start.clone();
			let end = end.clone();
			move |client| {
				let start = start.clone();
				let end = end.clone();
				async move { client.get_key_range(&start, &end, 100).await }
			}
		})
		.await;

		let mut found = Vec::new();
		for outcome in outcomes {
			let drive_index = outcome.drive_index;
			if let Ok(keys) = outcome.result {
				for k in keys {
					if let Some(chunk) = k.rsplit("chunk=").next().and_then(|s| s.parse::<usize>().ok()) {
						found.push((chunk, drive_index));
					}
				}
			}
		}
		found
	}

	async fn attempt<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		plan: &[Plan],
		skip_value: bool,
		codec: &Codec,
		deadline: Duration,
	) -> Attempt {
		let fetched = fetch_plan(connections, plan, skip_value, deadline).await;
		let version_results = version_results_of(&fetched);
		let (version, frequency) = most_frequent_version(&version_results, false);

		if frequency < codec.n_data() {
			let not_found = version_results.iter().filter(|r| matches!(r, Err(DriveStatus::NotFound))).count();
			if not_found >= codec.n_data() {
				return Attempt {
					outcome: Some(GetOutcome {
						version: Version::empty(),
						value: None,
						need_indicator: not_found < plan.len(),
					}),
					version: Version::empty(),
				};
			}
			return Attempt { outcome: None, version };
		}

		let (need_indicator, need_recovery) = evaluate_positions(&fetched, &version);

		let value = if skip_value {
			None
		} else {
			let mut stripe = build_stripe(&fetched, &version, codec.n_data());
			if need_recovery && codec.compute(&mut stripe).is_err() {
				return Attempt { outcome: None, version };
			}
			let value_len = version.value_len().unwrap_or(0);
			let mut value = Vec::with_capacity(value_len);
			for fragment in stripe.iter().take(codec.n_data()) {
				if value.len() >= value_len {
					break;
				}
				if value.len() + fragment.len() <= value_len {
					value.extend_from_slice(fragment);
				} else {
					let remaining = value_len - value.len();
					value.extend_from_slice(&fragment[..remaining]);
					break;
				}
			}
			Some(value)
		};

		Attempt {
			outcome: Some(GetOutcome {
				version: version.clone(),
				value,
				need_indicator,
			}),
			version,
		}
	}

	async fn finish_get<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		key: &str,
		outcome: GetOutcome,
		deadline: Duration,
	) -> GetOutcome {
		if outcome.need_indicator {
			Self::put_indicator(connections, key, deadline).await;
		}
		outcome
	}

	async fn finish_write<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		key: &str,
		version_new: &Version,
		fragments: Option<&[Vec<u8>]>,
		statuses: &[DriveStatus],
		codec: &Codec,
		deadline: Duration,
	) -> Result<WriteOutcome> {
		let mut counts: BTreeMap<DriveStatus, usize> = BTreeMap::new();
		for s in statuses {
			*counts.entry(*s).or_insert(0) += 1;
		}
		let decision = counts.into_iter().find(|(_, count)| *count >= codec.n_data());

		let (status, need_indicator) = match decision {
			Some((status, count)) => (status, status == DriveStatus::Ok && count < codec.stripe_size()),
			None => return Err(Error::Unfixable(format!("key {} is not accessible", key))),
		};

		if let Some(fragments) = fragments {
			if status == DriveStatus::Ok {
				for (i, s) in statuses.iter().enumerate() {
					if *s != DriveStatus::Ok {
						let handoff_key_name = handoff_key(key, version_new, i);
						Self::create_single_key(connections, &handoff_key_name, version_new.as_str(), &fragments[i], deadline).await;
					}
				}
			}
		}

		if need_indicator {
			Self::put_indicator(connections, key, deadline).await;
		}

		Ok(WriteOutcome {
			version: version_new.clone(),
			need_indicator,
			status,
		})
	}

	/// Resolve a write that landed at some drives but not others: figure out
	/// whether this write or a concurrent one won, repair stale positions if
	/// we won, or give up and force the write through once the poll budget
	/// tied to our position in the stripe is exhausted.
	async fn resolve_write<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		plan: &[Plan],
		op: ResolveOp<'_>,
		version_new: &Version,
		deadline: Duration,
	) -> Result<Vec<DriveStatus>> {
		let mut poll_budget: Option<usize> = None;
		let mut polls_done = 0usize;

		loop {
			let fetched = fetch_plan(connections, plan, true, deadline).await;
			let version_results = version_results_of(&fetched);
			let (most_frequent, _frequency) = most_frequent_version(&version_results, true);

			if most_frequent == *version_new {
				let mut statuses = Vec::with_capacity(plan.len());
				for (i, r) in version_results.iter().enumerate() {
					if matches!(r, Ok(v) if v == version_new) {
						statuses.push(DriveStatus::Ok);
						continue;
					}
					let observed = r.as_ref().ok().cloned().unwrap_or_else(Version::empty);
					let status = match &op {
						ResolveOp::Put(fragments) => {
							Self::put_once(
								&connections[plan[i].drive_index],
								&plan[i].key,
								fragments[i].clone(),
								version_new.to_string(),
								observed.to_string(),
								WriteMode::RequireVersion,
								deadline,
							)
							.await
						}
						ResolveOp::Del => {
							Self::delete_once(
								&connections[plan[i].drive_index],
								&plan[i].key,
								observed.to_string(),
								WriteMode::RequireVersion,
								deadline,
							)
							.await
						}
					};
					statuses.push(status);
				}
				return Ok(statuses);
			}

			let position = version_results.iter().enumerate().find_map(|(i, r)| match r {
				Ok(v) if v == version_new => Some(i),
				Err(DriveStatus::NotFound) if version_new.is_empty() => Some(i),
				_ => None,
			});

			let position = match position {
				Some(p) => p,
				None => return Err(Error::VersionMismatch),
			};

			let budget = *poll_budget.get_or_insert(10 * (1 + position));
			if polls_done >= budget {
				let mut statuses = Vec::with_capacity(plan.len());
				for (i, p) in plan.iter().enumerate() {
					let status = match &op {
						ResolveOp::Put(fragments) => {
							Self::put_once(
								&connections[p.drive_index],
								&p.key,
								fragments[i].clone(),
								version_new.to_string(),
								String::new(),
								WriteMode::IgnoreVersion,
								deadline,
							)
							.await
						}
						ResolveOp::Del => {
							Self::delete_once(&connections[p.drive_index], &p.key, String::new(), WriteMode::IgnoreVersion, deadline).await
						}
					};
					statuses.push(status);
				}
				return Ok(statuses);
			}

			polls_done += 1;
			tokio::time::sleep(Duration::from_millis(100)).await;
		}
	}

	async fn put_indicator<C: DriveClient>(connections: &[Arc<ConnectionSupervisor<C>>], key: &str, deadline: Duration) {
		let indicator_key = format!("indicator:{}", key);
		Self::create_single_key(connections, &indicator_key, "indicator", &[], deadline).await;
	}

	/// Write a single unconditioned, unstriped key, retrying on successive
	/// drives (in placement order) until a definitive answer or the drive
	/// count is exhausted. Used for handoff and indicator keys, neither of
	/// which carries redundancy of its own.
	async fn create_single_key<C: DriveClient>(
		connections: &[Arc<ConnectionSupervisor<C>>],
		key: &str,
		version: &str,
		value: &[u8],
		deadline: Duration,
	) -> DriveStatus {
		let n = connections.len();
		let hash = hash_key(key);
		let mut offset = 0usize;
		loop {
			let drive_index = select_drives(hash, n, offset, 1)[0];
			offset += 1;
			let status = Self::put_once(
				&connections[drive_index],
				key,
				value.to_vec(),
				version.to_string(),
				Version::empty().to_string(),
				WriteMode::RequireVersion,
				deadline,
			)
			.await;
			if matches!(status, DriveStatus::Ok | DriveStatus::NotFound | DriveStatus::VersionMismatch) || offset >= n {
				return status;
			}
		}
	}

	async fn put_once<C: DriveClient>(
		drive: &Arc<ConnectionSupervisor<C>>,
		key: &str,
		value: Vec<u8>,
		version_new: String,
		version_old: String,
		mode: WriteMode,
		deadline: Duration,
	) -> DriveStatus {
		let client = match drive.get().await {
			Ok(c) => c,
			Err(_) => return DriveStatus::ClientIoError,
		};
		let tag = compute_tag(&value);
		let status = match tokio::time::timeout(deadline, client.put(key, value, tag, version_new, version_old, mode)).await {
			Ok(Ok(())) => DriveStatus::Ok,
			Ok(Err(status)) => status,
			Err(_) => DriveStatus::ClientIoError,
		};
		if status == DriveStatus::ClientIoError {
			drive.set_error();
		}
		status
	}

	async fn delete_once<C: DriveClient>(
		drive: &Arc<ConnectionSupervisor<C>>,
		key: &str,
		version: String,
		mode: WriteMode,
		deadline: Duration,
	) -> DriveStatus {
		let client = match drive.get().await {
			Ok(c) => c,
			Err(_) => return DriveStatus::ClientIoError,
		};
		let status = match tokio::time::timeout(deadline, client.delete(key, version, mode)).await {
			Ok(Ok(())) => DriveStatus::Ok,
			Ok(Err(status)) => status,
			Err(_) => DriveStatus::ClientIoError,
		};
		if status == DriveStatus::ClientIoError {
			drive.set_error();
		}
		status
	}
}

async fn fetch_one<C: DriveClient>(
	drive: &Arc<ConnectionSupervisor<C>>,
	key: &str,
	skip_value: bool,
	deadline: Duration,
) -> DriveResult<FragmentResult> {
	let client = drive.get().await.map_err(|_| DriveStatus::ClientIoError)?;

	let result: DriveResult<FragmentResult> = if skip_value {
		match tokio::time::timeout(deadline, client.get_version(key)).await {
			Ok(Ok(raw)) => Version::decode(raw.as_bytes())
				.map(|version| FragmentResult {
					version: Some(version),
					record: None,
				})
				.map_err(|_| DriveStatus::RemoteError),
			Ok(Err(status)) => Err(status),
			Err(_) => Err(DriveStatus::ClientIoError),
		}
	} else {
		match tokio::time::timeout(deadline, client.get(key)).await {
			Ok(Ok(reply)) => match Version::decode(reply.version.as_bytes()) {
				Ok(version) => Ok(FragmentResult {
					version: Some(version),
					record: Some(reply),
				}),
				Err(_) => Err(DriveStatus::RemoteError),
			},
			Ok(Err(status)) => Err(status),
			Err(_) => Err(DriveStatus::ClientIoError),
		}
	};

	if let Err(DriveStatus::ClientIoError) = result {
		drive.set_error();
	}
	result
}

async fn fetch_plan<C: DriveClient>(
	connections: &[Arc<ConnectionSupervisor<C>>],
	plan: &[Plan],
	skip_value: bool,
	deadline: Duration,
) -> Vec<DriveResult<FragmentResult>> {
	let futures = plan.iter().map(|p| {
		let drive = connections[p.drive_index].clone();
		let key = p.key.clone();
		async move { fetch_one(&drive, &key, skip_value, deadline).await }
	});
	futures::future::join_all(futures).await
}

fn version_results_of(fetched: &[DriveResult<FragmentResult>]) -> Vec<DriveResult<Version>> {
	fetched
		.iter()
		.map(|r| {
			r.as_ref()
				.map(|f| f.version.clone().unwrap_or_else(Version::empty))
				.map_err(|s| *s)
		})
		.collect()
}

/// The version the largest number of positions agree on, and how many.
/// `treat_not_found_as_empty` folds `NotFound` results in as votes for the
/// empty version when they outnumber the best real version -- used by the
/// concurrency-resolution protocol, not by the ordinary GET quorum check.
fn most_frequent_version(results: &[DriveResult<Version>], treat_not_found_as_empty: bool) -> (Version, usize) {
	let mut counts: HashMap<Version, usize> = HashMap::new();
	let mut not_found = 0usize;
	for r in results {
		match r {
			Ok(v) => *counts.entry(v.clone()).or_insert(0) += 1,
			Err(DriveStatus::NotFound) => not_found += 1,
			_ => {}
		}
	}
	let mut best = counts.into_iter().max_by_key(|(_, c)| *c).unwrap_or((Version::empty(), 0));
	if treat_not_found_as_empty && not_found > best.1 {
		best = (Version::empty(), not_found);
	}
	best
}

/// Whether any position disagrees with `version` (wrong version, bad CRC,
/// missing fragment, or a fetch error), and whether that disagreement
/// requires redundancy recovery to reconstruct a value.
fn evaluate_positions(fetched: &[DriveResult<FragmentResult>], version: &Version) -> (bool, bool) {
	let mut need_indicator = false;
	let mut need_recovery = false;
	for r in fetched {
		match r {
			Ok(f) if f.version.as_ref() == Some(version) => {
				if let Some(rec) = &f.record {
					if !verify_tag(&rec.value, &rec.tag) {
						need_indicator = true;
						need_recovery = true;
					}
				}
			}
			_ => {
				need_indicator = true;
				need_recovery = true;
			}
		}
	}
	(need_indicator, need_recovery)
}

/// Build the stripe to feed the codec: a zero-length fragment with a valid
/// tag is a zero-padded tail, replayed as a chunk of zero bytes (sized from
/// any other fragment present) rather than left as "missing".
fn build_stripe(fetched: &[DriveResult<FragmentResult>], version: &Version, n_data: usize) -> Vec<Vec<u8>> {
	let mut stripe: Vec<Vec<u8>> = Vec::with_capacity(fetched.len());
	let mut zeroed_indices = Vec::new();

	for (i, r) in fetched.iter().enumerate() {
		let valid = match r {
			Ok(f) if f.version.as_ref() == Some(version) => f.record.as_ref().filter(|rec| verify_tag(&rec.value, &rec.tag)),
			_ => None,
		};
		match valid {
			Some(rec) => {
				if rec.value.is_empty() && i < n_data {
					zeroed_indices.push(i);
				}
				stripe.push(rec.value.clone());
			}
			None => stripe.push(Vec::new()),
		}
	}

	if !zeroed_indices.is_empty() {
		let chunk_size = stripe.iter().map(Vec::len).find(|&l| l > 0).unwrap_or(0);
		let zero = vec![0u8; chunk_size];
		for idx in zeroed_indices {
			stripe[idx] = zero.clone();
		}
	}
	stripe
}

fn handoff_key(key: &str, version: &Version, chunk: usize) -> String {
	format!("handoff={}version={}chunk={}", key, version.as_str(), chunk)
}

fn hash_key(key: &str) -> u32 {
	murmur3::murmur3_32(&mut std::io::Cursor::new(key.as_bytes()), 0).expect("hashing an in-memory byte slice cannot fail")
}

/// The `size` drive indices a key's stripe occupies, starting `offset`
/// positions past its hash. Calling again with `offset` set to a prior
/// call's `size` continues the same placement sequence without re-hashing,
/// which is how a stripe is widened from data-only to data+parity.
fn select_drives(hash: u32, n: usize, offset: usize, size: usize) -> Vec<usize> {
	let mut index = hash as usize + offset;
	(0..size)
		.map(|_| {
			index = (index + 1) % n;
			index
		})
		.collect()
}

fn initial_plan(hash: u32, n: usize, offset: usize, size: usize, key: &str) -> Vec<Plan> {
	select_drives(hash, n, offset, size)
		.into_iter()
		.map(|drive_index| Plan {
			drive_index,
			key: key.to_string(),
		})
		.collect()
}

#[cfg(test)]
mod test {
	use super::*;
	use kio_rpc::testing::FakeDrive;
	use kio_rpc::Endpoint;
	use kio_util::background::BackgroundPool;

	fn endpoint(n: u16) -> Endpoint {
		Endpoint {
			host: format!("drive-{}", n),
			port: n,
		}
	}

	fn cluster(count: u16) -> Vec<Arc<ConnectionSupervisor<FakeDrive>>> {
		let background = BackgroundPool::new(0, count as usize);
		(0..count)
			.map(|i| ConnectionSupervisor::<FakeDrive>::new(endpoint(i), endpoint(i + 100), Duration::from_secs(5), background.clone()))
			.collect()
	}

	#[tokio::test]
	async fn put_then_get_round_trips() {
		let connections = cluster(6);
		let codec = Codec::new(3, 2);
		let value = b"the quick brown fox jumps over the lazy dog".to_vec();
		let version_new = Version::generate(value.len());

		let mut stripe = split_for_test(&value, &codec);
		codec.compute(&mut stripe).unwrap();

		let outcome = StripeOperation::put(
			&connections,
			"object-a",
			&version_new,
			&Version::empty(),
			stripe,
			WriteMode::IgnoreVersion,
			&codec,
			Duration::from_secs(1),
		)
		.await
		.unwrap();
		assert_eq!(outcome.status, DriveStatus::Ok);

		let read = StripeOperation::get(&connections, "object-a", false, &codec, Duration::from_secs(1))
			.await
			.unwrap();
		assert_eq!(read.value.unwrap(), value);
		assert_eq!(read.version, version_new);
	}

	#[tokio::test]
	async fn get_survives_missing_parity_drive() {
		let connections = cluster(6);
		let codec = Codec::new(3, 2);
		let value = b"stripe engines are simpler with redundancy".to_vec();
		let version_new = Version::generate(value.len());

		let mut stripe = split_for_test(&value, &codec);
		codec.compute(&mut stripe).unwrap();
		StripeOperation::put(
			&connections,
			"object-b",
			&version_new,
			&Version::empty(),
			stripe,
			WriteMode::IgnoreVersion,
			&codec,
			Duration::from_secs(1),
		)
		.await
		.unwrap();

		// Knock out one of the data drives; reconstruction should still
		// succeed from the surviving data + parity fragments.
		let hash = hash_key("object-b");
		let drives = select_drives(hash, connections.len(), 0, codec.stripe_size());
		connections[drives[0]].get().await.unwrap().fail_next(DriveStatus::ClientIoError);

		let read = StripeOperation::get(&connections, "object-b", false, &codec, Duration::from_secs(1))
			.await
			.unwrap();
		assert_eq!(read.value.unwrap(), value);
		assert!(read.need_indicator);
	}

	#[tokio::test]
	async fn del_then_get_reports_absent() {
		let connections = cluster(4);
		let codec = Codec::new(1, 3);
		let value = b"metadata record".to_vec();
		let version_new = Version::generate(value.len());

		let mut stripe = split_for_test(&value, &codec);
		codec.compute(&mut stripe).unwrap();
		StripeOperation::put(
			&connections,
			"object-c",
			&version_new,
			&Version::empty(),
			stripe,
			WriteMode::IgnoreVersion,
			&codec,
			Duration::from_secs(1),
		)
		.await
		.unwrap();

		let del = StripeOperation::del(&connections, "object-c", &version_new, WriteMode::RequireVersion, &codec, Duration::from_secs(1))
			.await
			.unwrap();
		assert_eq!(del.status, DriveStatus::Ok);

		let outcome = StripeOperation::get(&connections, "object-c", false, &codec, Duration::from_secs(1))
			.await
			.unwrap();
		assert!(outcome.value.is_none());
	}

	#[tokio::test]
	async fn scan_reports_full_agreement_after_a_clean_put() {
		let connections = cluster(6);
		let codec = Codec::new(3, 2);
		let value = b"scan sees what get never exposes".to_vec();
		let version_new = Version::generate(value.len());

		let mut stripe = split_for_test(&value, &codec);
		codec.compute(&mut stripe).unwrap();
		StripeOperation::put(&connections, "object-d", &version_new, &Version::empty(), stripe, WriteMode::IgnoreVersion, &codec, Duration::from_secs(1))
			.await
			.unwrap();

		let outcome = StripeOperation::scan(&connections, "object-d", &codec, Duration::from_secs(1)).await;
		assert_eq!(outcome.responded, outcome.total);
		assert_eq!(outcome.agreeing, outcome.responded);
		assert_eq!(outcome.classify(), ScanClassification::Ok);
	}

	#[tokio::test]
	async fn scan_flags_need_action_when_a_drive_lags_behind() {
		let connections = cluster(6);
		let codec = Codec::new(3, 2);
		let value = b"one drive missed the write".to_vec();
		let version_new = Version::generate(value.len());

		let mut stripe = split_for_test(&value, &codec);
		codec.compute(&mut stripe).unwrap();

		let hash = hash_key("object-e");
		let drives = select_drives(hash, connections.len(), 0, codec.stripe_size());
		connections[drives[0]].get().await.unwrap().fail_next(DriveStatus::ClientIoError);

		StripeOperation::put(&connections, "object-e", &version_new, &Version::empty(), stripe, WriteMode::IgnoreVersion, &codec, Duration::from_secs(1))
			.await
			.unwrap();

		let outcome = StripeOperation::scan(&connections, "object-e", &codec, Duration::from_secs(1)).await;
		assert_eq!(outcome.classify(), ScanClassification::NeedAction);
	}

	fn split_for_test(value: &[u8], codec: &Codec) -> Vec<Vec<u8>> {
		let chunk_size = ((value.len() + codec.n_data() - 1) / codec.n_data()).max(1);
		let mut stripe = Vec::with_capacity(codec.stripe_size());
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
		stripe
	}
}
