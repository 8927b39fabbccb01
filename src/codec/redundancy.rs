//! Reed-Solomon / replication redundancy codec.
//!
//! Fragments are columns of a systematic `GF(2^8)` Cauchy-matrix Reed-Solomon
//! code: the encode matrix's first `nData` rows are the identity (so data
//! fragments are the original value split in `nData` pieces, unchanged by
//! encoding) and its last `nParity` rows are a Cauchy matrix, guaranteeing
//! that any `nData` of the `nData + nParity` rows are linearly independent.
//! Builds on Intel ISA-L's `gf_gen_cauchy1_matrix`/`ec_encode_data` idea, but
//! expressed as a single linear-algebra pass (solve for the original data
//! from any `nData` surviving fragments, then recompute every missing
//! fragment from it) instead of the specialized incremental decode-matrix
//! construction -- mathematically equivalent, easier to get right without a
//! toolchain to test against.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use kio_util::error::{Error, Result};

mod gf {
	/// GF(2^8) exp/log tables, primitive polynomial 0x11d (the one ISA-L and
	/// most production Reed-Solomon implementations use).
	pub struct Tables {
		exp: [u8; 512],
		log: [u8; 256],
	}

	impl Tables {
		pub fn new() -> Self {
			let mut exp = [0u8; 512];
			let mut log = [0u8; 256];
			let mut x: u16 = 1;
			for i in 0..255usize {
				exp[i] = x as u8;
				log[x as usize] = i as u8;
				x <<= 1;
				if x & 0x100 != 0 {
					x ^= 0x11d;
				}
			}
			for i in 255..512 {
				exp[i] = exp[i - 255];
			}
			Tables { exp, log }
		}

		pub fn mul(&self, a: u8, b: u8) -> u8 {
			if a == 0 || b == 0 {
				0
			} else {
				let i = self.log[a as usize] as usize + self.log[b as usize] as usize;
				self.exp[i]
			}
		}

		pub fn inv(&self, a: u8) -> u8 {
			debug_assert!(a != 0, "0 has no inverse in GF(2^8)");
			let l = self.log[a as usize] as usize;
			self.exp[(512 - l) % 255]
		}
	}
}

/// One fragment of a stripe. An empty vector means "missing".
pub type Fragment = Vec<u8>;

#[derive(Clone)]
struct DecodeTable {
	/// Indices (ascending) of the `n_data` surviving fragments used to solve
	/// for the original data.
	block_indices: Vec<usize>,
	/// Inverse of the `n_data x n_data` submatrix of the encode matrix at
	/// `block_indices`, row-major.
	inverse: Vec<u8>,
}

/// The redundancy codec for one cluster's `(nData, nParity)` shape.
pub struct Codec {
	n_data: usize,
	n_parity: usize,
	/// `(n_data + n_parity) x n_data` row-major encode matrix.
	encode_matrix: Vec<u8>,
	tables: gf::Tables,
	cache: Mutex<HashMap<String, Arc<DecodeTable>>>,
}

impl Codec {
	pub fn new(n_data: usize, n_parity: usize) -> Self {
		assert!(n_data > 0, "a codec needs at least one data fragment");
		let tables = gf::Tables::new();
		let encode_matrix = cauchy_matrix(&tables, n_data, n_data + n_parity);
		Codec {
			n_data,
			n_parity,
			encode_matrix,
			tables,
			cache: Mutex::new(HashMap::new()),
		}
	}

	pub fn n_data(&self) -> usize {
		self.n_data
	}

	pub fn n_parity(&self) -> usize {
		self.n_parity
	}

	pub fn stripe_size(&self) -> usize {
		self.n_data + self.n_parity
	}

	/// Validate the stripe shape and build its error pattern (`true` where a
	/// fragment is missing), validating the stripe's shape.
	fn error_pattern(&self, stripe: &[Fragment]) -> Result<Vec<bool>> {
		if stripe.len() != self.stripe_size() {
			return Err(Error::invalid_argument(format!(
				"stripe has {} fragments, expected {}",
				stripe.len(),
				self.stripe_size()
			)));
		}
		let mut pattern = vec![false; stripe.len()];
		let mut block_size = None;
		let mut n_errors = 0;
		for (i, fragment) in stripe.iter().enumerate() {
			if fragment.is_empty() {
				pattern[i] = true;
				n_errors += 1;
			} else {
				match block_size {
					None => block_size = Some(fragment.len()),
					Some(size) if size != fragment.len() => {
						return Err(Error::invalid_argument(format!(
							"stripe fragments have unequal sizes: {} and {}",
							size,
							fragment.len()
						)))
					}
					_ => {}
				}
			}
		}
		if n_errors > self.n_parity {
			return Err(Error::invalid_argument(format!(
				"{} missing fragments exceeds nParity={}",
				n_errors, self.n_parity
			)));
		}
		Ok(pattern)
	}

	fn pattern_key(pattern: &[bool]) -> String {
		pattern.iter().map(|&b| if b { '1' } else { '0' }).collect()
	}

	/// Whether a stripe with this many missing fragments can still be
	/// recovered, without needing the actual fragment bytes.
	pub fn can_recover(&self, n_missing: usize) -> bool {
		n_missing <= self.n_parity
	}

	fn decode_table(&self, pattern: &[bool]) -> Result<Arc<DecodeTable>> {
		let key = Self::pattern_key(pattern);
		if let Some(table) = self.cache.lock().unwrap().get(&key) {
			return Ok(table.clone());
		}

		let block_indices: Vec<usize> = (0..pattern.len())
			.filter(|&i| !pattern[i])
			.take(self.n_data)
			.collect();
		assert_eq!(block_indices.len(), self.n_data, "not enough surviving fragments");

		let mut submatrix = vec![0u8; self.n_data * self.n_data];
		for (row, &src_row) in block_indices.iter().enumerate() {
			submatrix[row * self.n_data..(row + 1) * self.n_data]
				.copy_from_slice(&self.encode_matrix[src_row * self.n_data..(src_row + 1) * self.n_data]);
		}

		let inverse = invert_matrix(&self.tables, &submatrix, self.n_data).ok_or_else(|| {
			Error::Unfixable("encode submatrix for this error pattern is not invertible".into())
		})?;

		let table = Arc::new(DecodeTable { block_indices, inverse });
		self.cache.lock().unwrap().insert(key, table.clone());
		Ok(table)
	}

	/// Fill in missing fragments of `stripe`. Also used to
	/// compute parity fragments at PUT time: pass the `nData` data fragments
	/// followed by `nParity` empty placeholders.
	pub fn compute(&self, stripe: &mut [Fragment]) -> Result<()> {
		let pattern = self.error_pattern(stripe)?;

		if self.n_parity == 0 {
			return Ok(());
		}

		if self.n_data == 1 {
			let present = stripe.iter().find(|f| !f.is_empty()).cloned();
			let present = match present {
				Some(v) => v,
				None => return Ok(()),
			};
			for (i, missing) in pattern.iter().enumerate() {
				if *missing {
					stripe[i] = present.clone();
				}
			}
			return Ok(());
		}

		if !pattern.iter().any(|&missing| missing) {
			return Ok(());
		}

		let block_size = match stripe.iter().find(|f| !f.is_empty()) {
			Some(f) => f.len(),
			None => return Ok(()),
		};

		let table = self.decode_table(&pattern)?;

		// Solve for the original `n_data` fragments from the surviving ones
		// named in `table.block_indices`.
		let mut data = vec![vec![0u8; block_size]; self.n_data];
		for row in 0..self.n_data {
			for (col, &src_index) in table.block_indices.iter().enumerate() {
				let coeff = table.inverse[row * self.n_data + col];
				if coeff == 0 {
					continue;
				}
				let src = &stripe[src_index];
				let dst = &mut data[row];
				for b in 0..block_size {
					dst[b] ^= self.tables.mul(coeff, src[b]);
				}
			}
		}

		// Recompute every missing fragment (data or parity) from the
		// recovered data via its encode-matrix row.
		for (i, missing) in pattern.iter().enumerate() {
			if !*missing {
				continue;
			}
			let mut out = vec![0u8; block_size];
			for c in 0..self.n_data {
				let coeff = self.encode_matrix[i * self.n_data + c];
				if coeff == 0 {
					continue;
				}
				for b in 0..block_size {
					out[b] ^= self.tables.mul(coeff, data[c][b]);
				}
			}
			stripe[i] = out;
		}

		Ok(())
	}
}

fn cauchy_matrix(tables: &gf::Tables, k: usize, m: usize) -> Vec<u8> {
	let mut mat = vec![0u8; m * k];
	for i in 0..k {
		mat[i * k + i] = 1;
	}
	for i in k..m {
		for j in 0..k {
			let x = (i as u8) ^ (j as u8);
			mat[i * k + j] = tables.inv(x);
		}
	}
	mat
}

/// Gauss-Jordan elimination over GF(2^8).
fn invert_matrix(tables: &gf::Tables, m: &[u8], n: usize) -> Option<Vec<u8>> {
	let width = 2 * n;
	let mut aug = vec![0u8; n * width];
	for i in 0..n {
		aug[i * width..i * width + n].copy_from_slice(&m[i * n..(i + 1) * n]);
		aug[i * width + n + i] = 1;
	}

	for col in 0..n {
		let pivot = (col..n).find(|&row| aug[row * width + col] != 0)?;
		if pivot != col {
			for k in 0..width {
				aug.swap(col * width + k, pivot * width + k);
			}
		}
		let inv_pivot = tables.inv(aug[col * width + col]);
		if inv_pivot != 1 {
			for k in 0..width {
				aug[col * width + k] = tables.mul(aug[col * width + k], inv_pivot);
			}
		}
		for row in 0..n {
			if row == col {
				continue;
			}
			let factor = aug[row * width + col];
			if factor == 0 {
				continue;
			}
			for k in 0..width {
				let v = tables.mul(factor, aug[col * width + k]);
				aug[row * width + k] ^= v;
			}
		}
	}

	let mut result = vec![0u8; n * n];
	for i in 0..n {
		result[i * n..(i + 1) * n].copy_from_slice(&aug[i * width + n..i * width + 2 * n]);
	}
	Some(result)
}

#[cfg(test)]
mod test {
	use super::*;
	use rand::RngCore;

	fn split_into_fragments(value: &[u8], n_data: usize) -> Vec<Fragment> {
		let block_size = (value.len() + n_data - 1) / n_data;
		let mut out = Vec::with_capacity(n_data);
		for i in 0..n_data {
			let start = i * block_size;
			let end = ((i + 1) * block_size).min(value.len());
			let mut block = if start < value.len() { value[start..end].to_vec() } else { vec![] };
			block.resize(block_size, 0);
			out.push(block);
		}
		out
	}

	#[test]
	fn replication_single_data_fragment() {
		let codec = Codec::new(1, 3);
		let mut stripe: Vec<Fragment> = vec![b"hello".to_vec(), vec![], vec![], vec![]];
		codec.compute(&mut stripe).unwrap();
		assert!(stripe.iter().all(|f| f == b"hello"));

		// Kill any 3 and recover.
		let mut damaged = stripe.clone();
		damaged[0] = vec![];
		damaged[1] = vec![];
		damaged[2] = vec![];
		codec.compute(&mut damaged).unwrap();
		assert_eq!(damaged[3], b"hello");
		for f in &damaged {
			assert_eq!(f, b"hello");
		}
	}

	#[test]
	fn reed_solomon_round_trip_and_recovery() {
		let n_data = 10;
		let n_parity = 3;
		let codec = Codec::new(n_data, n_parity);

		let mut value = vec![0u8; 10 * 1024 * 1024];
		rand::thread_rng().fill_bytes(&mut value);

		let mut stripe = split_into_fragments(&value, n_data);
		for _ in 0..n_parity {
			stripe.push(vec![]);
		}
		codec.compute(&mut stripe).unwrap();
		assert!(stripe.iter().all(|f| !f.is_empty()));

		let original = stripe.clone();

		// Wipe 3 arbitrary fragments (a mix of data and parity) and recover.
		let mut damaged = stripe;
		damaged[2] = vec![];
		damaged[7] = vec![];
		damaged[n_data + 1] = vec![];
		codec.compute(&mut damaged).unwrap();
		assert_eq!(damaged, original);
	}

	#[test]
	fn rejects_too_many_missing_fragments() {
		let codec = Codec::new(4, 2);
		let stripe: Vec<Fragment> = vec![vec![1], vec![], vec![], vec![], vec![], vec![]];
		assert!(codec.compute(&mut stripe.clone()).is_err());
	}

	#[test]
	fn rejects_mismatched_fragment_sizes() {
		let codec = Codec::new(2, 1);
		let stripe: Vec<Fragment> = vec![vec![1, 2, 3], vec![1, 2], vec![]];
		assert!(codec.compute(&mut stripe.clone()).is_err());
	}

	#[test]
	fn no_parity_requires_full_stripe() {
		let codec = Codec::new(3, 0);
		let mut full: Vec<Fragment> = vec![vec![1], vec![2], vec![3]];
		codec.compute(&mut full).unwrap();
		assert_eq!(full, vec![vec![1], vec![2], vec![3]]);

		let missing: Vec<Fragment> = vec![vec![1], vec![], vec![3]];
		assert!(codec.compute(&mut missing.clone()).is_err());
	}

	#[test]
	fn decode_table_is_memoized() {
		let codec = Codec::new(6, 3);
		let value = b"0123456789abcdef0123456789abcdef".to_vec();
		let mut stripe = split_into_fragments(&value, 6);
		for _ in 0..3 {
			stripe.push(vec![]);
		}
		codec.compute(&mut stripe).unwrap();

		let mut damaged1 = stripe.clone();
		damaged1[0] = vec![];
		codec.compute(&mut damaged1).unwrap();
		assert_eq!(codec.cache.lock().unwrap().len(), 1);

		let mut damaged2 = stripe.clone();
		damaged2[0] = vec![];
		codec.compute(&mut damaged2).unwrap();
		assert_eq!(codec.cache.lock().unwrap().len(), 1);
		assert_eq!(damaged1, damaged2);
	}
}
