use cpool_proto::ErrorCode;
use thiserror::Error;

/// The pool-side error table, spec §7. Richer than the wire [`ErrorCode`]:
/// each variant carries whatever context the pool had on hand before
/// collapsing a worker's reply (or a transport failure) into this shape.
#[derive(Debug, Error)]
pub enum PoolError {
	#[error("connection error: {0}")]
	ConnectionError(#[from] cpool_transport::TransportError),
	#[error("pool is stopping")]
	PoolClosed,
	#[error("worker crashed before replying")]
	WorkerCrashed,
	#[error("failed to synchronize state with worker: {message}")]
	FailedStateSync { message: String },
	#[error("worker rejected incompatible client: {message}")]
	IncompatibleClient { message: String },
	#[error("state not found for the given state_id")]
	StateNotFound,
	#[error("compiler error: {message}")]
	CompilerError { message: String, trace: String },
	#[error("serialization failure: {trace}")]
	SerializationFailure { trace: String },
}

impl PoolError {
	/// Map a worker's wire-level [`Reply::Error`](cpool_proto::Reply::Error)
	/// into the richer pool-side error.
	#[must_use]
	pub fn from_wire(code: ErrorCode, message: String, trace: String) -> Self {
		match code {
			ErrorCode::ConnectionError => PoolError::WorkerCrashed,
			ErrorCode::PoolClosed => PoolError::PoolClosed,
			ErrorCode::WorkerCrashed => PoolError::WorkerCrashed,
			ErrorCode::FailedStateSync => PoolError::FailedStateSync { message },
			ErrorCode::IncompatibleClient => PoolError::IncompatibleClient { message },
			ErrorCode::StateNotFound => PoolError::StateNotFound,
			ErrorCode::CompilerError => PoolError::CompilerError { message, trace },
			ErrorCode::SerializationFailure => PoolError::SerializationFailure { trace },
		}
	}

	/// Whether the `compile*` layer should retry this call exactly once with
	/// the full pickled state instead of "reuse last" (spec §7's global
	/// rule).
	#[must_use]
	pub fn is_state_not_found(&self) -> bool {
		matches!(self, PoolError::StateNotFound)
	}
}
