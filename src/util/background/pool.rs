//! Bounded background operation pool.
//!
//! Two modes, selected once at construction by `queue_depth`:
//! - queue mode (`queue_depth > 0`): a fixed set of worker tasks drains a
//!   bounded FIFO; `run` blocks the submitter while the queue is full,
//!   `try_run` returns `false` instead of blocking.
//! - no-queue mode (`queue_depth == 0`): `try_run` spawns a detached task if
//!   fewer than the worker cap are currently in flight; `run` falls back to
//!   executing the job on the calling task when the cap is reached, which is
//!   the pool's back-pressure mechanism in this mode.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, watch, Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::*;

use crate::error::Error;

pub type JobOutput = Result<(), Error>;
pub type Job = Pin<Box<dyn Future<Output = JobOutput> + Send>>;

enum Mode {
	Queue(QueueState),
	NoQueue { worker_cap: usize },
}

struct QueueState {
	tx: mpsc::Sender<Job>,
	rx: Arc<Mutex<mpsc::Receiver<Job>>>,
}

pub struct BackgroundPool {
	mode: Mode,
	in_flight: Arc<AtomicUsize>,
	idle: Arc<Notify>,
	workers: Mutex<(watch::Sender<bool>, Vec<JoinHandle<()>>)>,
}

impl BackgroundPool {
	/// `queue_depth == 0` selects no-queue mode. `workers` is the fixed
	/// worker-task count in queue mode, or the in-flight cap in no-queue
	/// mode; queue mode requires at least one worker.
	pub fn new(queue_depth: usize, workers: usize) -> Arc<Self> {
		let (stop_tx, stop_rx) = watch::channel(false);
		let in_flight = Arc::new(AtomicUsize::new(0));
		let idle = Arc::new(Notify::new());

		let mode = if queue_depth > 0 {
			assert!(workers >= 1, "queue-mode background pool requires at least one worker");
			let (tx, rx) = mpsc::channel(queue_depth);
			Mode::Queue(QueueState {
				tx,
				rx: Arc::new(Mutex::new(rx)),
			})
		} else {
			Mode::NoQueue {
				worker_cap: workers.max(1),
			}
		};

		let pool = Arc::new(Self {
			mode,
			in_flight,
			idle,
			workers: Mutex::new((stop_tx, Vec::new())),
		});

		if let Mode::Queue(ref q) = pool.mode {
			let handles = Self::spawn_queue_workers(q.rx.clone(), workers, stop_rx, pool.in_flight.clone(), pool.idle.clone());
			// SAFETY-free: pool was just constructed and not yet shared, `try_lock` always succeeds here.
			pool.workers.try_lock().unwrap().1 = handles;
		}

		pool
	}

	fn spawn_queue_workers(
		rx: Arc<Mutex<mpsc::Receiver<Job>>>,
		count: usize,
		stop: watch::Receiver<bool>,
		in_flight: Arc<AtomicUsize>,
		idle: Arc<Notify>,
	) -> Vec<JoinHandle<()>> {
		(0..count)
			.map(|index| {
				let rx = rx.clone();
				let mut stop = stop.clone();
				let in_flight = in_flight.clone();
				let idle = idle.clone();
				tokio::spawn(async move {
					loop {
						let job = {
							let mut rx = rx.lock().await;
							tokio::select! {
								job = rx.recv() => job,
								_ = stop.changed() => {
									if *stop.borrow() {
										None
									} else {
										continue;
									}
								}
							}
						};
						match job {
							Some(job) => {
								in_flight.fetch_add(1, Ordering::SeqCst);
								if let Err(e) = job.await {
									error!("Background queue worker #{}: job failed: {}", index, e);
								}
								if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
									idle.notify_waiters();
								}
							}
							None => break,
						}
					}
				})
			})
			.collect()
	}

	/// Submit a job, blocking the caller while the queue is full (queue
	/// mode) or running the job inline once the worker cap is reached
	/// (no-queue mode).
	pub async fn run<T>(&self, job: T)
	where
		T: Future<Output = JobOutput> + Send + 'static,
	{
		match &self.mode {
			Mode::Queue(q) => {
				let boxed: Job = Box::pin(job);
				if q.tx.send(boxed).await.is_err() {
					error!("Background pool queue is closed, dropping job");
				}
			}
			Mode::NoQueue { worker_cap } => {
				if let Some(job) = self.spawn_if_under_cap(*worker_cap, Box::pin(job)) {
					// Cap reached: execute inline. This is the no-queue
					// mode's back-pressure mechanism.
					if let Err(e) = job.await {
						error!("Background pool inline job failed: {}", e);
					}
				}
			}
		}
	}

	/// Submit a job without blocking. Returns `false` if the job could not
	/// be accepted (queue full, or worker cap reached in no-queue mode) --
	/// the caller is expected to skip the optional work in that case
	/// (e.g. readahead).
	pub fn try_run<T>(&self, job: T) -> bool
	where
		T: Future<Output = JobOutput> + Send + 'static,
	{
		match &self.mode {
			Mode::Queue(q) => {
				let boxed: Job = Box::pin(job);
				q.tx.try_send(boxed).is_ok()
			}
			Mode::NoQueue { worker_cap } => self.spawn_if_under_cap(*worker_cap, Box::pin(job)).is_none(),
		}
	}

	fn spawn_if_under_cap(&self, cap: usize, job: Job) -> Option<Job> {
		loop {
			let current = self.in_flight.load(Ordering::SeqCst);
			if current >= cap {
				return Some(job);
			}
			if self
				.in_flight
				.compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
				.is_ok()
			{
				break;
			}
		}
		let in_flight = self.in_flight.clone();
		let idle = self.idle.clone();
		tokio::spawn(async move {
			if let Err(e) = job.await {
				error!("Background pool spawned job failed: {}", e);
			}
			if in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
				idle.notify_waiters();
			}
		});
		None
	}

	/// Current number of jobs running or queued-and-unstarted.
	pub fn in_flight(&self) -> usize {
		self.in_flight.load(Ordering::SeqCst)
	}

	/// Reduce or grow the fixed worker count in queue mode. No-op in
	/// no-queue mode, where the cap is just a number checked on each submit.
	pub async fn reconfigure_workers(&self, new_count: usize) {
		let q = match &self.mode {
			Mode::Queue(q) => q,
			Mode::NoQueue { .. } => return,
		};
		let mut guard = self.workers.lock().await;
		let (stop_tx, handles) = &mut *guard;

		// Signal the current generation of workers to drain and exit.
		let _ = stop_tx.send(true);
		for h in handles.drain(..) {
			let _ = h.await;
		}

		// Spawn the new generation.
		let (new_stop_tx, new_stop_rx) = watch::channel(false);
		*handles = Self::spawn_queue_workers(
			q.rx.clone(),
			new_count,
			new_stop_rx,
			self.in_flight.clone(),
			self.idle.clone(),
		);
		*stop_tx = new_stop_tx;
	}

	/// Drain the queue, stop accepting new work, and wait until every
	/// in-flight job has completed.
	pub async fn shutdown(&self) {
		if let Mode::Queue(_) = &self.mode {
			let mut guard = self.workers.lock().await;
			let (stop_tx, handles) = &mut *guard;
			let _ = stop_tx.send(true);
			for h in handles.drain(..) {
				let _ = h.await;
			}
		}
		while self.in_flight() > 0 {
			self.idle.notified().await;
		}
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use std::sync::atomic::AtomicUsize as Counter;

	#[tokio::test]
	async fn queue_mode_blocks_when_full() {
		let pool = BackgroundPool::new(1, 1);
		let counter = Arc::new(Counter::new(0));

		let c = counter.clone();
		pool.run(async move {
			tokio::time::sleep(std::time::Duration::from_millis(20)).await;
			c.fetch_add(1, Ordering::SeqCst);
			Ok(())
		})
		.await;

		pool.shutdown().await;
		assert_eq!(counter.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn no_queue_mode_runs_inline_past_cap() {
		let pool = BackgroundPool::new(0, 1);
		let counter = Arc::new(Counter::new(0));

		// First job occupies the single worker slot for a while.
		let c1 = counter.clone();
		let accepted = pool.try_run(async move {
			tokio::time::sleep(std::time::Duration::from_millis(50)).await;
			c1.fetch_add(1, Ordering::SeqCst);
			Ok(())
		});
		assert!(accepted);

		// Second job can't get a slot, so `run` executes it inline and
		// returns only once done.
		let c2 = counter.clone();
		pool.run(async move {
			c2.fetch_add(10, Ordering::SeqCst);
			Ok(())
		})
		.await;
		assert_eq!(counter.load(Ordering::SeqCst), 10);

		pool.shutdown().await;
		assert_eq!(counter.load(Ordering::SeqCst), 11);
	}
}
