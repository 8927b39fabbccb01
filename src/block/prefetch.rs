//! Predicts the next block indices a reader will touch from its recent
//! access history, so the cache can schedule readahead before the miss
//! actually happens.

use std::collections::{HashMap, VecDeque};

/// Whether a prediction should include indices already returned by an
/// earlier prediction for the same owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PredictionType {
	Complete,
	Continue,
}

/// Minimum number of distinct samples required before a pattern is trusted.
const MIN_SAMPLES: usize = 3;
/// A delta must explain at least this fraction of the adjacent pairs in the
/// sequence before it's accepted as the pattern.
const MIN_DELTA_FREQUENCY: f64 = 0.75;
/// The history (and past-prediction) buffers never shrink below this size,
/// even when a caller asks for a shorter prediction.
const MIN_HISTORY: usize = 10;

/// Fixed-capacity history of recently touched block indices, used to detect
/// arithmetic access patterns (sequential or strided) and predict the next
/// few indices in the pattern.
pub struct PrefetchOracle {
	capacity: usize,
	sequence: VecDeque<i64>,
	past_prediction: VecDeque<i64>,
}

impl PrefetchOracle {
	pub fn new(max_prediction: usize) -> Self {
		Self {
			capacity: max_prediction.max(MIN_HISTORY),
			sequence: VecDeque::new(),
			past_prediction: VecDeque::new(),
		}
	}

	/// Record an access, most recent at the front. No-op if already present
	/// (recognizing a pattern doesn't care how many times a block was
	/// re-read, only the order distinct blocks were first touched in).
	pub fn add(&mut self, index: i64) {
		if self.sequence.contains(&index) {
			return;
		}
		self.sequence.push_front(index);
		if self.sequence.len() > self.capacity {
			self.sequence.pop_back();
		}
	}

	/// Predict up to `length` successors of the most recent access.
	pub fn predict(&mut self, length: usize, kind: PredictionType) -> Vec<i64> {
		let prediction = self.compute_prediction(length, kind);

		for &p in &prediction {
			self.past_prediction.push_front(p);
		}
		while self.past_prediction.len() > self.capacity {
			self.past_prediction.pop_back();
		}

		prediction
	}

	fn compute_prediction(&self, length: usize, kind: PredictionType) -> Vec<i64> {
		if length == 0 || self.sequence.len() < MIN_SAMPLES {
			return Vec::new();
		}

		let samples: Vec<i64> = self.sequence.iter().copied().collect();
		let mut tally: HashMap<i64, usize> = HashMap::new();
		for i in 0..samples.len() - 1 {
			*tally.entry(samples[i] - samples[i + 1]).or_insert(0) += 1;
		}
		for i in 0..samples.len().saturating_sub(2) {
			*tally.entry(samples[i] - samples[i + 2]).or_insert(0) += 1;
		}

		let (&delta, &count) = match tally.iter().max_by_key(|(_, count)| **count) {
			Some(entry) => entry,
			None => return Vec::new(),
		};
		if (count as f64) / (samples.len() as f64) < MIN_DELTA_FREQUENCY {
			return Vec::new();
		}

		let head = samples[0];
		let mut prediction: Vec<i64> = (1..=length as i64)
			.map(|k| head + k * delta)
			.filter(|&candidate| candidate > 0)
			.collect();

		if kind == PredictionType::Continue {
			prediction.retain(|candidate| !self.past_prediction.contains(candidate));
		}
		prediction
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn predicts_even_stride_past_the_requested_length() {
		let mut oracle = PrefetchOracle::new(10);
		for n in [0, 2, 4, 6, 8, 10] {
			oracle.add(n);
		}
		let prediction = oracle.predict(3, PredictionType::Complete);
		assert_eq!(prediction, vec![12, 14, 16]);
	}

	#[test]
	fn predicts_exact_sequential_run() {
		let mut oracle = PrefetchOracle::new(10);
		for n in 0..10 {
			oracle.add(n);
		}
		let prediction = oracle.predict(3, PredictionType::Complete);
		assert_eq!(prediction, vec![10, 11, 12]);
	}

	#[test]
	fn too_few_samples_predicts_nothing() {
		let mut oracle = PrefetchOracle::new(10);
		oracle.add(0);
		oracle.add(5);
		assert!(oracle.predict(3, PredictionType::Complete).is_empty());
	}

	#[test]
	fn continue_filters_out_past_predictions() {
		let mut oracle = PrefetchOracle::new(10);
		for n in 0..10 {
			oracle.add(n);
		}
		let first = oracle.predict(3, PredictionType::Continue);
		assert_eq!(first, vec![10, 11, 12]);

		// Same history, asked again: everything already predicted is filtered.
		let second = oracle.predict(3, PredictionType::Continue);
		assert!(second.is_empty());
	}

	#[test]
	fn non_positive_successors_are_dropped() {
		let mut oracle = PrefetchOracle::new(10);
		// Added oldest-first so the final history reads front-to-back as
		// 3,4,5,6,7,8 (head 3, stride -1).
		for n in [8, 7, 6, 5, 4, 3] {
			oracle.add(n);
		}
		let prediction = oracle.predict(5, PredictionType::Complete);
		assert_eq!(prediction, vec![2, 1]);
	}
}
