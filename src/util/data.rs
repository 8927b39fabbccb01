//! Version and tag encoding shared by every fragment on every drive.

use uuid::Uuid;

use crate::error::{Error, Result};

/// Length of the current (46-byte) on-drive version encoding: a 10-byte
/// ASCII decimal length prefix followed by a 36-byte textual UUID.
pub const VERSION_LEN: usize = 46;
const LEN_PREFIX_WIDTH: usize = 10;
/// Older readers may encounter this 26-byte variant: 10-byte length prefix
/// plus 16 raw UUID bytes instead of its 36-byte text form.
const LEGACY_VERSION_LEN: usize = 26;
const LEGACY_UUID_LEN: usize = 16;

/// A stripe version: stamped identically on every fragment of a stripe.
/// Immutable once constructed; cheaply cloned -- callers wrap it in `Arc`
/// at the point they need to share it across concurrent operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version(String);

impl Version {
	/// Generate a fresh version for a value of the given byte length.
	pub fn generate(value_len: usize) -> Self {
		let uuid = Uuid::new_v4();
		Version(format!("{:0width$}{}", value_len, uuid, width = LEN_PREFIX_WIDTH))
	}

	/// The empty version, used to mean "this key does not exist" in the
	/// partial-write resolution protocol.
	pub fn empty() -> Self {
		Version(String::new())
	}

	pub fn is_empty(&self) -> bool {
		self.0.is_empty()
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn as_bytes(&self) -> &[u8] {
		self.0.as_bytes()
	}

	/// Decode the on-drive version bytes, accepting both the current 46-byte
	/// and the legacy 26-byte encoding.
	pub fn decode(raw: &[u8]) -> Result<Self> {
		if raw.is_empty() {
			return Ok(Version::empty());
		}
		if raw.len() == VERSION_LEN {
			let s = std::str::from_utf8(raw)
				.map_err(|e| Error::invalid_argument(format!("version is not utf8: {}", e)))?;
			return Ok(Version(s.to_string()));
		}
		if raw.len() == LEGACY_VERSION_LEN {
			let (len_bytes, uuid_bytes) = raw.split_at(LEN_PREFIX_WIDTH);
			let len_str = std::str::from_utf8(len_bytes)
				.map_err(|e| Error::invalid_argument(format!("version length prefix is not utf8: {}", e)))?;
			let uuid = Uuid::from_slice(uuid_bytes)
				.map_err(|e| Error::invalid_argument(format!("legacy version uuid is invalid: {}", e)))?;
			debug_assert_eq!(uuid_bytes.len(), LEGACY_UUID_LEN);
			return Ok(Version(format!("{}{}", len_str, uuid)));
		}
		Err(Error::invalid_argument(format!(
			"version has unexpected length {} (expected {} or {})",
			raw.len(),
			VERSION_LEN,
			LEGACY_VERSION_LEN
		)))
	}

	/// The exact length of the original value, decoded from the first 10
	/// ASCII bytes.
	pub fn value_len(&self) -> Result<usize> {
		if self.0.len() < LEN_PREFIX_WIDTH {
			return Err(Error::invalid_argument("version too short to contain a length prefix"));
		}
		self.0[..LEN_PREFIX_WIDTH]
			.parse::<usize>()
			.map_err(|e| Error::invalid_argument(format!("version length prefix is not decimal: {}", e)))
	}
}

impl std::fmt::Display for Version {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.0)
	}
}

/// CRC32C tag of a fragment's value, decimal-ASCII encoded on the drive
/// (the wire algorithm selector is set to CRC32 for compatibility with
/// older readers, but the tag bytes themselves are CRC32C).
pub fn compute_tag(value: &[u8]) -> String {
	crc32c::crc32c(value).to_string()
}

pub fn verify_tag(value: &[u8], tag: &str) -> bool {
	compute_tag(value) == tag
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn version_round_trip() {
		let v = Version::generate(12345);
		let decoded = Version::decode(v.as_bytes()).unwrap();
		assert_eq!(v, decoded);
		assert_eq!(decoded.value_len().unwrap(), 12345);
	}

	#[test]
	fn legacy_version_decodes() {
		let uuid = Uuid::new_v4();
		let mut raw = format!("{:0width$}", 42, width = LEN_PREFIX_WIDTH).into_bytes();
		raw.extend_from_slice(uuid.as_bytes());
		assert_eq!(raw.len(), LEGACY_VERSION_LEN);
		let decoded = Version::decode(&raw).unwrap();
		assert_eq!(decoded.value_len().unwrap(), 42);
	}

	#[test]
	fn tag_matches_crc32c() {
		let value = b"hello world";
		let tag = compute_tag(value);
		assert!(verify_tag(value, &tag));
		assert!(!verify_tag(b"something else", &tag));
	}
}
