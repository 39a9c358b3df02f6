use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Flat, wire-serializable error kind, analogous to the teacher broker's
/// `ErrorCode` enum. Richer, non-`Send`-over-the-wire context (a worker's
/// formatted trace, a connection's underlying I/O error) is attached
/// alongside this code by the crate that raises it — `cpool-pool::PoolError`
/// mirrors the full table from which this enum is drawn and carries that
/// context; this type is what actually crosses the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ErrorCode {
	/// IPC socket closed, or the handshake failed.
	#[error("connection error")]
	ConnectionError,
	/// `stop()` has been called; fail all pending calls.
	#[error("pool closed")]
	PoolClosed,
	/// Reply never arrived because the worker process died.
	#[error("worker crashed")]
	WorkerCrashed,
	/// The worker could not ingest the state-sync preamble. The caller must
	/// leave its cached view of that worker untouched.
	#[error("failed state sync")]
	FailedStateSync,
	/// Remote broker rejected our catalog version or backend params. Fatal
	/// for the remote pool.
	#[error("incompatible client")]
	IncompatibleClient,
	/// "Reuse last" was sent for a `state_id` the broker/worker does not
	/// have. The caller retries once with the full pickled state.
	#[error("state not found")]
	StateNotFound,
	/// A domain error produced inside the worker's compiler.
	#[error("compiler error")]
	CompilerError,
	/// The worker produced a result that could not be encoded.
	#[error("serialization failure")]
	SerializationFailure,
}

impl ErrorCode {
	/// Whether the `compile*` layer should retry the call exactly once with
	/// the full pickled state, per spec §7's global rule.
	#[must_use]
	pub fn is_state_not_found(self) -> bool {
		matches!(self, ErrorCode::StateNotFound)
	}
}
