//! The async operation vector: fan a single logical operation out across
//! every drive in a stripe concurrently, bound each attempt by a deadline,
//! retry once on a transient `ClientIoError`, and let the caller fold the
//! per-drive statuses into a quorum decision.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::client::{DriveClient, DriveResult, DriveStatus};
use crate::connection::ConnectionSupervisor;

pub struct OpOutcome<T> {
	pub drive_index: usize,
	pub result: DriveResult<T>,
}

/// The status a quorum of drives agreed on, and how many of them did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
	pub status: DriveStatus,
	pub agreeing: usize,
}

pub struct OperationVector;

impl OperationVector {
	/// Run `op` against every drive concurrently, each attempt bounded by
	/// `deadline`. A drive that doesn't answer in time, or whose connection
	/// isn't currently up, counts as a `ClientIoError`.
	pub async fn fan_out<C, T, F, Fut>(drives: &[Arc<ConnectionSupervisor<C>>], deadline: Duration, op: F) -> Vec<OpOutcome<T>>
	where
		C: DriveClient,
		F: Fn(Arc<C>) -> Fut + Clone,
		Fut: Future<Output = DriveResult<T>> + Send,
		T: Send,
	{
		let futures = drives.iter().enumerate().map(|(index, drive)| {
			let op = op.clone();
			async move {
				OpOutcome {
					drive_index: index,
					result: Self::run_one(drive, deadline, op).await,
				}
			}
		});
		futures::future::join_all(futures).await
	}

	/// [`fan_out`], then one additional retry round against any drive whose
	/// first attempt failed with a transient `ClientIoError`.
	pub async fn fan_out_with_retry<C, T, F, Fut>(
		drives: &[Arc<ConnectionSupervisor<C>>],
		deadline: Duration,
		op: F,
	) -> Vec<OpOutcome<T>>
	where
		C: DriveClient,
		F: Fn(Arc<C>) -> Fut + Clone,
		Fut: Future<Output = DriveResult<T>> + Send,
		T: Send,
	{
		let mut outcomes = Self::fan_out(drives, deadline, op.clone()).await;

		let retry_slots: Vec<usize> = outcomes
			.iter()
			.enumerate()
			.filter(|(_, o)| matches!(o.result, Err(DriveStatus::ClientIoError)))
			.map(|(slot, _)| slot)
			.collect();
		if retry_slots.is_empty() {
			return outcomes;
		}
		debug!("operation vector: retrying {} drive(s) after a transient error", retry_slots.len());

		let retries = futures::future::join_all(retry_slots.iter().map(|&slot| {
			let op = op.clone();
			let drive_index = outcomes[slot].drive_index;
			async move { Self::run_one(&drives[drive_index], deadline, op).await }
		}))
		.await;

		for (slot, result) in retry_slots.into_iter().zip(retries.into_iter()) {
			outcomes[slot].result = result;
		}
		outcomes
	}

	async fn run_one<C, T, F, Fut>(drive: &Arc<ConnectionSupervisor<C>>, deadline: Duration, op: F) -> DriveResult<T>
	where
		C: DriveClient,
		F: FnOnce(Arc<C>) -> Fut,
		Fut: Future<Output = DriveResult<T>>,
	{
		let client = match drive.get().await {
			Ok(c) => c,
			Err(_) => return Err(DriveStatus::ClientIoError),
		};
		let result = match tokio::time::timeout(deadline, op(client)).await {
			Ok(r) => r,
			Err(_) => Err(DriveStatus::ClientIoError),
		};
		if let Err(DriveStatus::ClientIoError) = result {
			drive.set_error();
		}
		result
	}

	/// The best (lowest-ranked: success beats not-found beats stale-version
	/// beats error) status that at least `quorum` drives agree on, if any.
	pub fn evaluate(results: &[DriveStatus], quorum: usize) -> Option<Quorum> {
		let mut counts: BTreeMap<DriveStatus, usize> = BTreeMap::new();
		for status in results {
			*counts.entry(*status).or_insert(0) += 1;
		}
		counts
			.into_iter()
			.filter(|(_, agreeing)| *agreeing >= quorum)
			.map(|(status, agreeing)| Quorum { status, agreeing })
			.min_by_key(|q| q.status)
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::client::Endpoint;
	use crate::testing::FakeDrive;
	use kio_util::background::BackgroundPool;

	fn endpoint(n: u16) -> Endpoint {
		Endpoint {
			host: format!("drive-{}", n),
			port: n,
		}
	}

	#[tokio::test]
	async fn fan_out_collects_every_drive() {
		let background = BackgroundPool::new(0, 4);
		let drives: Vec<_> = (0..4)
			.map(|i| ConnectionSupervisor::<FakeDrive>::new(endpoint(i), endpoint(i + 100), Duration::from_secs(5), background.clone()))
			.collect();

		let outcomes = OperationVector::fan_out(&drives, Duration::from_secs(1), |client| async move { client.no_op().await }).await;

		assert_eq!(outcomes.len(), 4);
		assert!(outcomes.iter().all(|o| o.result.is_ok()));
	}

	#[tokio::test]
	async fn evaluate_picks_best_status_meeting_quorum() {
		let results = vec![
			DriveStatus::Ok,
			DriveStatus::Ok,
			DriveStatus::Ok,
			DriveStatus::NotFound,
			DriveStatus::ClientIoError,
		];
		let quorum = OperationVector::evaluate(&results, 3).unwrap();
		assert_eq!(quorum.status, DriveStatus::Ok);
		assert_eq!(quorum.agreeing, 3);

		// No status reaches a quorum of 4.
		assert!(OperationVector::evaluate(&results, 4).is_none());
	}

	#[tokio::test]
	async fn retries_transient_errors_once() {
		let background = BackgroundPool::new(0, 4);
		let drives: Vec<_> = (0..2)
			.map(|i| ConnectionSupervisor::<FakeDrive>::new(endpoint(i), endpoint(i + 100), Duration::from_secs(5), background.clone()))
			.collect();

		// Prime the connections, then inject one transient failure on drive 0.
		for d in &drives {
			d.get().await.unwrap();
		}
		drives[0].get().await.unwrap().fail_next(DriveStatus::ClientIoError);

		let outcomes = OperationVector::fan_out_with_retry(&drives, Duration::from_secs(1), |client| async move { client.no_op().await }).await;
		assert!(outcomes.iter().all(|o| o.result.is_ok()), "retry should have recovered drive 0");
	}
}
