use thiserror::Error;

/// Failure conditions inside the replication core.
///
/// None of these reach a remote sender. They are logged, counted and then
/// resolved internally, usually by requesting a fresh snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReplicationError {
	#[error("invalid patch for '{id}' at rev {rev}: {reason}")]
	Validation { id: String, rev: u64, reason: String },
	#[error("revision gap on '{id}': have {current}, got {received}")]
	SequenceGap {
		id: String,
		current: u64,
		received: u64,
	},
	#[error("queued patches for '{id}' stalled waiting for rev {waiting_for}")]
	StallTimeout { id: String, waiting_for: u64 },
	#[error("peer '{peer}' never acknowledged '{id}' rev {rev} after {attempts} attempts")]
	DeliveryTimeout {
		peer: String,
		id: String,
		rev: u64,
		attempts: u32,
	},
	#[error("rate limit exceeded for '{key}'")]
	RateLimited { key: String },
}

/// Errors raised while decoding or framing wire messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
	#[error("malformed message body: {0}")]
	Json(#[from] serde_json::Error),
	#[error("unknown message kind '{0}'")]
	UnknownKind(String),
	#[error("frame size {size} exceeds maximum {max}")]
	FrameTooLarge { size: usize, max: usize },
	#[error("transport i/o: {0}")]
	Io(#[from] std::io::Error),
}
