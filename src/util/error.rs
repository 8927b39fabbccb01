//! Error kinds shared across the KIO workspace.
//!
//! The stripe engine is the retry boundary (see `kio_model::stripe`): it
//! resolves transient per-drive faults internally and the cluster façade
//! only ever surfaces one of the kinds below.

use err_derive::Error;

/// Error kinds observable at the cluster façade.
#[derive(Debug, Error)]
pub enum Error {
	/// Majority of drives report the key absent.
	#[error(display = "key not found")]
	NotFound,

	/// Majority of drives report a different on-drive version than expected.
	#[error(display = "version mismatch")]
	VersionMismatch,

	/// Transient network/protocol fault at a connection. Retried once within
	/// the operation vector; if it persists it is treated as a drive failure
	/// for quorum purposes.
	#[error(display = "client I/O error: {}", _0)]
	ClientIoError(String),

	/// Pre-flight validation failure (null buffer, bad offset, impossible
	/// stripe shape). Never retried.
	#[error(display = "invalid argument: {}", _0)]
	InvalidArgument(String),

	/// Too few drives returned a consistent answer to reach quorum even with
	/// handoff and parity fragments.
	#[error(display = "unfixable: {}", _0)]
	Unfixable(String),

	#[error(display = "I/O error: {}", _0)]
	Io(#[error(source)] std::io::Error),

	#[error(display = "JSON error: {}", _0)]
	Json(#[error(source)] serde_json::Error),

	#[error(display = "{}", _0)]
	Message(String),
}

impl Error {
	pub fn message<S: Into<String>>(msg: S) -> Self {
		Error::Message(msg.into())
	}

	pub fn invalid_argument<S: Into<String>>(msg: S) -> Self {
		Error::InvalidArgument(msg.into())
	}

	/// True for the one error kind the async operation vector retries
	/// locally.
	pub fn is_retryable(&self) -> bool {
		matches!(self, Error::ClientIoError(_))
	}
}

/// Convenience extension providing an `OkOrMessage` helper, used to turn
/// `Option`s from channel sends and lock results into our `Error` type at
/// call sites.
pub trait OkOrMessage<T> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T>;
}

impl<T> OkOrMessage<T> for Option<T> {
	fn ok_or_message<S: Into<String>>(self, msg: S) -> Result<T> {
		self.ok_or_else(|| Error::message(msg.into()))
	}
}

pub type Result<T> = std::result::Result<T, Error>;
