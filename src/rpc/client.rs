//! The `DriveClient` trait stands in for the Kinetic wire protocol client,
//! which is out of scope for this library (the cluster talks to drives
//! through whatever client a deployment links in). `TcpDriveClient` is a
//! placeholder implementation against a length-prefixed framed protocol, just
//! enough to exercise the connection supervisor and operation vector above
//! it; `testing::FakeDrive` is the in-memory implementation the rest of the
//! workspace tests against.

use async_trait::async_trait;

/// The three-way outcome a single drive operation settles to, ordered the
/// way quorum evaluation needs it: a successful read/write always outranks
/// "the key isn't there yet", which outranks "the version we hold is stale",
/// which outranks any error that came back from the wire or the client
/// itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DriveStatus {
	Ok,
	NotFound,
	VersionMismatch,
	ClientIoError,
	RemoteError,
}

impl DriveStatus {
	pub fn is_retryable(&self) -> bool {
		matches!(self, DriveStatus::ClientIoError)
	}
}

pub type DriveResult<T> = std::result::Result<T, DriveStatus>;

/// Extracts the [`DriveStatus`] a result settled to, regardless of whether it
/// carried a value.
pub fn status_of<T>(result: &DriveResult<T>) -> DriveStatus {
	match result {
		Ok(_) => DriveStatus::Ok,
		Err(status) => *status,
	}
}

#[derive(Debug, Clone)]
pub struct GetReply {
	pub value: Vec<u8>,
	pub version: String,
	pub tag: String,
}

/// Whether a write must see the expected prior version, or may clobber
/// whatever is there -- the `IGNORE_VERSION` fallback the stripe engine
/// reaches for once its concurrency-resolution budget is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
	RequireVersion,
	IgnoreVersion,
}

/// A drive's self-reported capacity and I/O counters, as returned by
/// [`DriveClient::get_log`]. Counters are cumulative since the drive came
/// up; the cluster façade keeps its own previous snapshot to derive
/// period deltas.
#[derive(Debug, Clone, Default)]
pub struct DriveLog {
	pub bytes_total: u64,
	pub bytes_used: u64,
	pub read_ops: u64,
	pub read_bytes: u64,
	pub write_ops: u64,
	pub write_bytes: u64,
	pub utilization_percent: f64,
}

#[derive(Debug, Clone)]
pub struct Endpoint {
	pub host: String,
	pub port: u16,
}

impl std::fmt::Display for Endpoint {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}:{}", self.host, self.port)
	}
}

/// One drive's worth of Kinetic-equivalent operations. Implementors own their
/// own transport; the connection supervisor only calls [`DriveClient::connect`]
/// and [`DriveClient::no_op`].
#[async_trait]
pub trait DriveClient: Send + Sync + Sized + 'static {
	async fn connect(endpoint: &Endpoint) -> std::io::Result<Self>;

	async fn no_op(&self) -> DriveResult<()>;

	async fn put(
		&self,
		key: &str,
		value: Vec<u8>,
		tag: String,
		version_new: String,
		version_old: String,
		mode: WriteMode,
	) -> DriveResult<()>;

	async fn get(&self, key: &str) -> DriveResult<GetReply>;

	async fn get_version(&self, key: &str) -> DriveResult<String>;

	async fn delete(&self, key: &str, version: String, mode: WriteMode) -> DriveResult<()>;

	async fn get_key_range(&self, start: &str, end: &str, max: usize) -> DriveResult<Vec<String>>;

	async fn get_log(&self) -> DriveResult<DriveLog>;
}

pub mod tcp {
	//! Placeholder `DriveClient` over a length-prefixed, newline-free framed
	//! TCP protocol. Real Kinetic wire support belongs in a separate crate;
	//! this exists so the supervisor above it has a concrete, testable
	//! transport.

	use std::io::{Read, Write};
	use std::net::TcpStream as StdTcpStream;

	use async_trait::async_trait;
	use tokio::sync::Mutex;

	use super::{DriveClient, DriveLog, DriveResult, DriveStatus, Endpoint, GetReply, WriteMode};

	/// A single opcode byte followed by a `u32` big-endian length-prefixed
	/// JSON body; good enough to drive the supervisor against a real socket
	/// in tests without specifying an actual Kinetic frame.
	///
	/// The async `Mutex` serializes requests on this connection: a clone of
	/// the underlying fd is moved into a blocking task for the roundtrip, and
	/// the lock is held across that `await` so two callers never interleave
	/// writes and reads on the same socket.
	pub struct TcpDriveClient {
		stream: Mutex<StdTcpStream>,
	}

	#[async_trait]
	impl DriveClient for TcpDriveClient {
		async fn connect(endpoint: &Endpoint) -> std::io::Result<Self> {
			let addr = endpoint.to_string();
			let stream = tokio::task::spawn_blocking(move || StdTcpStream::connect(addr))
				.await
				.expect("connect task panicked")?;
			stream.set_nodelay(true).ok();
			Ok(TcpDriveClient { stream: Mutex::new(stream) })
		}

		async fn no_op(&self) -> DriveResult<()> {
			ack(self.call(Frame::NoOp).await?)
		}

		async fn put(
			&self,
			key: &str,
			value: Vec<u8>,
			tag: String,
			version_new: String,
			version_old: String,
			mode: WriteMode,
		) -> DriveResult<()> {
			ack(self
				.call(Frame::Put {
					key: key.to_string(),
					value,
					tag,
					version_new,
					version_old,
					force: mode == WriteMode::IgnoreVersion,
				})
				.await?)
		}

		async fn get(&self, key: &str) -> DriveResult<GetReply> {
			match self.call(Frame::Get { key: key.to_string() }).await? {
				Frame::Value { value, version, tag } => Ok(GetReply { value, version, tag }),
				Frame::NotFound => Err(DriveStatus::NotFound),
				_ => Err(DriveStatus::RemoteError),
			}
		}

		async fn get_version(&self, key: &str) -> DriveResult<String> {
			match self.call(Frame::GetVersion { key: key.to_string() }).await? {
				Frame::Version { version } => Ok(version),
				Frame::NotFound => Err(DriveStatus::NotFound),
				_ => Err(DriveStatus::RemoteError),
			}
		}

		async fn delete(&self, key: &str, version: String, mode: WriteMode) -> DriveResult<()> {
			ack(self
				.call(Frame::Delete {
					key: key.to_string(),
					version,
					force: mode == WriteMode::IgnoreVersion,
				})
				.await?)
		}

		async fn get_key_range(&self, start: &str, end: &str, max: usize) -> DriveResult<Vec<String>> {
			match self
				.call(Frame::Range {
					start: start.to_string(),
					end: end.to_string(),
					max: max as u32,
				})
				.await?
			{
				Frame::Keys { keys } => Ok(keys),
				_ => Err(DriveStatus::RemoteError),
			}
		}

		async fn get_log(&self) -> DriveResult<DriveLog> {
			match self.call(Frame::GetLog).await? {
				Frame::Log {
					bytes_total,
					bytes_used,
					read_ops,
					read_bytes,
					write_ops,
					write_bytes,
					utilization_percent,
				} => Ok(DriveLog {
					bytes_total,
					bytes_used,
					read_ops,
					read_bytes,
					write_ops,
					write_bytes,
					utilization_percent,
				}),
				_ => Err(DriveStatus::RemoteError),
			}
		}
	}

	impl TcpDriveClient {
		async fn call(&self, request: Frame) -> DriveResult<Frame> {
			// spawn_blocking is the honest stand-in for a non-blocking event
			// loop, which the wire protocol itself is out of scope for. The
			// lock is held across the await so concurrent callers can't
			// interleave writes and reads on the cloned fd.
			let guard = self.stream.lock().await;
			let cloned = match guard.try_clone() {
				Ok(s) => s,
				Err(_) => return Err(DriveStatus::ClientIoError),
			};
			let result = tokio::task::spawn_blocking(move || {
				let mut stream = cloned;
				request.write_to(&mut stream)?;
				Frame::read_from(&mut stream)
			})
			.await
			.expect("drive roundtrip task panicked");
			drop(guard);

			result.map_err(|e| {
				warn!("drive io error: {}", e);
				DriveStatus::ClientIoError
			})
		}
	}

	fn ack(frame: Frame) -> DriveResult<()> {
		match frame {
			Frame::Ok => Ok(()),
			Frame::NotFound => Err(DriveStatus::NotFound),
			Frame::VersionMismatch => Err(DriveStatus::VersionMismatch),
			_ => Err(DriveStatus::RemoteError),
		}
	}

	#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
	enum Frame {
		NoOp,
		Ok,
		NotFound,
		VersionMismatch,
		Put {
			key: String,
			value: Vec<u8>,
			tag: String,
			version_new: String,
			version_old: String,
			force: bool,
		},
		Get {
			key: String,
		},
		GetVersion {
			key: String,
		},
		Delete {
			key: String,
			version: String,
			force: bool,
		},
		Range {
			start: String,
			end: String,
			max: u32,
		},
		GetLog,
		Value {
			value: Vec<u8>,
			version: String,
			tag: String,
		},
		Version {
			version: String,
		},
		Keys {
			keys: Vec<String>,
		},
		Log {
			bytes_total: u64,
			bytes_used: u64,
			read_ops: u64,
			read_bytes: u64,
			write_ops: u64,
			write_bytes: u64,
			utilization_percent: f64,
		},
	}

	impl Frame {
		fn write_to<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
			let body = serde_json::to_vec(self)?;
			w.write_all(&(body.len() as u32).to_be_bytes())?;
			w.write_all(&body)
		}

		fn read_from<R: Read>(r: &mut R) -> std::io::Result<Frame> {
			let mut len_buf = [0u8; 4];
			r.read_exact(&mut len_buf)?;
			let len = u32::from_be_bytes(len_buf) as usize;
			let mut body = vec![0u8; len];
			r.read_exact(&mut body)?;
			serde_json::from_slice(&body).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
		}
	}
}

pub use tcp::TcpDriveClient;
