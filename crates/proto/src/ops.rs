use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::blob::Blob;
use crate::error::ErrorCode;
use crate::ids::{ClientId, StateId};

/// Per-database cached schema/config state, held both by a `WorkerView`
/// (pool side) and by the worker agent itself.
///
/// A `DatabaseState` only ever exists fully seeded: the pool does not
/// construct one until all three fields have been sent to and accepted by
/// the worker.
#[derive(Debug, Clone)]
pub struct DatabaseState {
	pub user_schema_pickle: Blob,
	pub reflection_cache: Blob,
	pub database_config: Blob,
}

/// Per-`client_id` cached state inside one worker, multi-tenant mode only.
#[derive(Debug, Clone)]
pub struct TenantSchema {
	pub dbs: HashMap<String, DatabaseState>,
	pub global_schema_pickle: Blob,
	pub system_config: Blob,
}

/// The fixed-shape header the pool prepends to each compile request.
///
/// Every field is compared by [`Blob::same_as`] against what the pool last
/// recorded for the target worker; a `None` here is the nil placeholder
/// telling the worker "unchanged, keep what you have" rather than "absent".
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Preamble {
	pub user_schema_pickle: Option<Blob>,
	pub reflection_cache: Option<Blob>,
	pub global_schema_pickle: Option<Blob>,
	pub database_config: Option<Blob>,
	pub system_config: Option<Blob>,
}

impl Preamble {
	/// A preamble with every field nil — no change from what the worker
	/// already holds.
	#[must_use]
	pub fn unchanged() -> Self {
		Self::default()
	}

	#[must_use]
	pub fn is_unchanged(&self) -> bool {
		self.user_schema_pickle.is_none()
			&& self.reflection_cache.is_none()
			&& self.global_schema_pickle.is_none()
			&& self.database_config.is_none()
			&& self.system_config.is_none()
	}
}

/// The fixed, exhaustive set of operations a worker agent dispatches.
///
/// Replaces the source's dynamic dispatch-by-method-name with a tagged
/// enum the wire protocol carries as a small integer rather than a string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
	Compile,
	CompileInTx,
	CompileNotebook,
	CompileGraphql,
	CompileSql,
	ParseGlobalSchema,
	ParseUserSchemaDbConfig,
	MakeStateSerializer,
	DescribeDatabaseDump,
	DescribeDatabaseRestore,
	AnalyzeExplainOutput,
	ValidateSchemaEquivalence,
	CompileStructuredConfig,
	InterpretBackendError,
}

/// Transaction-scoped fields of a `compile_in_tx` call.
///
/// `state` is either the caller's pickled state blob or
/// [`crate::REUSE_LAST_STATE_MARKER`] when the target worker's
/// `last_tx_state_id` already matches `state_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxEnvelope {
	pub state_id: StateId,
	pub state: Blob,
}

/// The call payload carried inside one framed request, after the transport
/// header (length, request id) has been stripped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallEnvelope {
	pub operation: Operation,
	pub preamble: Preamble,
	/// Omitted (`None`) when the worker already holds this database's state
	/// by identity and the call does not need to name it again.
	pub dbname: Option<String>,
	pub tx: Option<TxEnvelope>,
	/// Opaque, operation-specific arguments (e.g. the statement text).
	pub args: Blob,
}

/// A worker's reply to one [`CallEnvelope`], matching spec §6's
/// `(status, ...)` tuple: `0` success, `1` handled domain error, `2`
/// encoding failure.
///
/// `Error`'s `code` folds every "handled exception" kind the source
/// distinguishes by exception type — `CompilerError`, `FailedStateSync`,
/// `StateNotFound` — into the single status-1 wire slot; the pool branches
/// on `code`, not on a parsed message string.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Reply {
	Success(Blob),
	/// Success reply specific to `compile_in_tx`: the compiled artifact plus
	/// the fresh state blob and the `state_id` the pool should tag it with.
	TxSuccess {
		result: Blob,
		state: Blob,
		state_id: StateId,
	},
	/// A handled domain error (status 1). Carries the worker's formatted
	/// trace as an extra attribute, propagated to the caller unchanged.
	Error {
		code: ErrorCode,
		message: String,
		trace: String,
	},
	/// The worker produced a result it could not encode (status 2).
	SerializationFailure { trace: String },
}

/// Per-database diff sent to a worker in multi-tenant mode: only the
/// fields that changed since the worker's cached `DatabaseState` for this
/// tenant, each still compared by blob identity upstream of this type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseStateDiff {
	pub user_schema_pickle: Option<Blob>,
	pub reflection_cache: Option<Blob>,
	pub database_config: Option<Blob>,
}

/// Everything the broker sends a worker about one client's tenant state
/// alongside a forwarded call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSchemaDiff {
	pub db_diffs: HashMap<String, DatabaseStateDiff>,
	pub dropped_dbs: Vec<String>,
	pub global_schema_pickle: Option<Blob>,
	pub system_config: Option<Blob>,
}

/// The call the broker actually sends to a worker on behalf of a client:
/// the client's raw call rewritten with tenant bookkeeping attached.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallForClient {
	pub client_id: ClientId,
	pub diff: ClientSchemaDiff,
	/// `client_id`s the worker should forget, accumulated from prior
	/// releases of tenants this worker no longer has room for.
	pub invalidate: Vec<ClientId>,
	pub call: CallEnvelope,
}
