//! Per-worker-process dispatch in multi-tenant mode (spec §4.8, worker
//! side): the same preamble-apply-then-compile shape as [`crate::Agent`],
//! but keyed by `client_id` instead of holding one singleton global/db
//! state for the whole process.

use std::collections::HashMap;
use std::sync::Mutex;

use cpool_proto::{Blob, CallForClient, ClientId, DatabaseState, ErrorCode, Operation, Reply, StateId, TenantSchema};

use crate::compiler::{CompileContext, Compiler};

/// Heavy, shared, per-process state plus a bounded per-`client_id` cache of
/// tenant schema state, for a worker process running behind a multi-tenant
/// broker rather than a bare pool.
pub struct MultiTenantAgent<C> {
	compiler: C,
	tenants: Mutex<HashMap<ClientId, TenantSchema>>,
	last_tx: Mutex<Option<(StateId, Blob)>>,
}

impl<C: Compiler> MultiTenantAgent<C> {
	pub fn new(compiler: C) -> Self {
		Self {
			compiler,
			tenants: Mutex::new(HashMap::new()),
			last_tx: Mutex::new(None),
		}
	}

	/// Apply the broker's `ClientSchemaDiff` and invalidation list, dispatch
	/// by operation, and encode the result as a wire [`Reply`].
	pub fn dispatch(&self, call: &CallForClient) -> Reply {
		self.forget(&call.invalidate);

		let db_state = match self.apply_diff(call.client_id, call.call.dbname.as_deref(), call) {
			Ok(state) => state,
			Err(()) => {
				return Reply::Error {
					code: ErrorCode::FailedStateSync,
					message: "incomplete per-tenant database state diff".to_string(),
					trace: String::new(),
				};
			}
		};

		let tenants = self.tenants.lock().unwrap();
		let tenant = tenants.get(&call.client_id);
		let ctx = CompileContext {
			dbname: call.call.dbname.clone(),
			user_schema_pickle: db_state.as_ref().map(|s| s.user_schema_pickle.clone()),
			reflection_cache: db_state.as_ref().map(|s| s.reflection_cache.clone()),
			database_config: db_state.as_ref().map(|s| s.database_config.clone()),
			global_schema_pickle: tenant.map(|t| t.global_schema_pickle.clone()),
			system_config: tenant.map(|t| t.system_config.clone()),
		};
		drop(tenants);

		match call.call.operation {
			Operation::CompileInTx => self.dispatch_in_tx(&ctx, call),
			other => self.dispatch_simple(other, &ctx, &call.call.args),
		}
	}

	fn dispatch_simple(&self, op: Operation, ctx: &CompileContext, args: &Blob) -> Reply {
		let result = match op {
			Operation::Compile => self.compiler.compile(ctx, args),
			Operation::CompileNotebook => self.compiler.compile_notebook(ctx, args),
			Operation::CompileGraphql => self.compiler.compile_graphql(ctx, args),
			Operation::CompileSql => self.compiler.compile_sql(ctx, args),
			Operation::ParseGlobalSchema => self.compiler.parse_global_schema(args),
			Operation::ParseUserSchemaDbConfig => self.compiler.parse_user_schema_db_config(args),
			Operation::MakeStateSerializer => self.compiler.make_state_serializer(ctx, args),
			Operation::DescribeDatabaseDump => self.compiler.describe_database_dump(ctx, args),
			Operation::DescribeDatabaseRestore => self.compiler.describe_database_restore(ctx, args),
			Operation::AnalyzeExplainOutput => self.compiler.analyze_explain_output(args),
			Operation::ValidateSchemaEquivalence => self.compiler.validate_schema_equivalence(args),
			Operation::CompileStructuredConfig => self.compiler.compile_structured_config(ctx, args),
			Operation::InterpretBackendError => self.compiler.interpret_backend_error(args),
			Operation::CompileInTx => unreachable!("handled by dispatch_in_tx"),
		};
		match result {
			Ok(blob) => Reply::Success(blob),
			Err(e) => Reply::Error {
				code: ErrorCode::CompilerError,
				message: e.message,
				trace: e.trace,
			},
		}
	}

	fn dispatch_in_tx(&self, ctx: &CompileContext, call: &CallForClient) -> Reply {
		let Some(tx) = call.call.tx.as_ref() else {
			return Reply::Error {
				code: ErrorCode::CompilerError,
				message: "compile_in_tx call missing its transaction envelope".to_string(),
				trace: String::new(),
			};
		};

		let effective_state = if tx.state.same_as(&*cpool_proto::REUSE_LAST_STATE_MARKER) {
			let held = self.last_tx.lock().unwrap().clone();
			match held {
				Some((sid, blob)) if sid == tx.state_id => blob,
				_ => {
					return Reply::Error {
						code: ErrorCode::StateNotFound,
						message: "no cached state for the given state_id".to_string(),
						trace: String::new(),
					};
				}
			}
		} else {
			tx.state.clone()
		};

		match self.compiler.compile_in_tx(ctx, &effective_state, &call.call.args) {
			Ok((result, new_state)) => {
				let new_id = {
					let mut held = self.last_tx.lock().unwrap();
					let next = held.as_ref().map_or(StateId(1), |(id, _)| id.next());
					*held = Some((next, new_state.clone()));
					next
				};
				Reply::TxSuccess {
					result,
					state: new_state,
					state_id: new_id,
				}
			}
			Err(e) => Reply::Error {
				code: ErrorCode::CompilerError,
				message: e.message,
				trace: e.trace,
			},
		}
	}

	/// Whether this worker currently believes it holds `client_id`'s
	/// tenant schema — used by `bin/worker` only for diagnostics; the
	/// broker keeps its own mirror of this and never asks the worker.
	#[must_use]
	pub fn holds_client(&self, client_id: ClientId) -> bool {
		self.tenants.lock().unwrap().contains_key(&client_id)
	}

	fn forget(&self, invalidate: &[ClientId]) {
		if invalidate.is_empty() {
			return;
		}
		let mut tenants = self.tenants.lock().unwrap();
		for id in invalidate {
			tenants.remove(id);
		}
	}

	fn apply_diff(&self, client_id: ClientId, dbname: Option<&str>, call: &CallForClient) -> Result<Option<DatabaseState>, ()> {
		let mut tenants = self.tenants.lock().unwrap();
		let tenant = tenants.entry(client_id).or_insert_with(|| TenantSchema {
			dbs: HashMap::new(),
			global_schema_pickle: Blob::new(Vec::new()),
			system_config: Blob::new(Vec::new()),
		});

		if let Some(blob) = &call.diff.global_schema_pickle {
			tenant.global_schema_pickle = blob.clone();
		}
		if let Some(blob) = &call.diff.system_config {
			tenant.system_config = blob.clone();
		}
		for dropped in &call.diff.dropped_dbs {
			tenant.dbs.remove(dropped);
		}

		let Some(dbname) = dbname else { return Ok(None) };
		let diff = call.diff.db_diffs.get(dbname);
		let existing = tenant.dbs.get(dbname);

		let user = diff
			.and_then(|d| d.user_schema_pickle.clone())
			.or_else(|| existing.map(|s| s.user_schema_pickle.clone()));
		let refl = diff
			.and_then(|d| d.reflection_cache.clone())
			.or_else(|| existing.map(|s| s.reflection_cache.clone()));
		let cfg = diff
			.and_then(|d| d.database_config.clone())
			.or_else(|| existing.map(|s| s.database_config.clone()));

		match (user, refl, cfg) {
			(Some(user_schema_pickle), Some(reflection_cache), Some(database_config)) => {
				let state = DatabaseState {
					user_schema_pickle,
					reflection_cache,
					database_config,
				};
				tenant.dbs.insert(dbname.to_string(), state.clone());
				Ok(Some(state))
			}
			(None, None, None) => Ok(existing.cloned()),
			_ => Err(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use cpool_proto::{CallEnvelope, ClientSchemaDiff, Preamble};

	use super::*;
	use crate::compiler::StubCompiler;

	fn call(client_id: u64, dbname: Option<&str>, diff: ClientSchemaDiff, invalidate: Vec<ClientId>, args: &[u8]) -> CallForClient {
		CallForClient {
			client_id: ClientId(client_id),
			diff,
			invalidate,
			call: CallEnvelope {
				operation: Operation::Compile,
				preamble: Preamble::unchanged(),
				dbname: dbname.map(str::to_string),
				tx: None,
				args: Blob::new(args.to_vec()),
			},
		}
	}

	#[test]
	fn first_call_for_a_client_requires_full_db_diff() {
		let agent = MultiTenantAgent::new(StubCompiler);
		let mut diff = ClientSchemaDiff::default();
		diff.db_diffs.insert(
			"d".to_string(),
			cpool_proto::DatabaseStateDiff {
				user_schema_pickle: Some(Blob::new(b"u".to_vec())),
				..Default::default()
			},
		);
		let reply = agent.dispatch(&call(1, Some("d"), diff, Vec::new(), b"SELECT 1"));
		assert!(matches!(
			reply,
			Reply::Error {
				code: ErrorCode::FailedStateSync,
				..
			}
		));
	}

	#[test]
	fn two_clients_keep_independent_state() {
		let agent = MultiTenantAgent::new(StubCompiler);
		let full = |tag: &str| {
			let mut diff = ClientSchemaDiff::default();
			diff.db_diffs.insert(
				"d".to_string(),
				cpool_proto::DatabaseStateDiff {
					user_schema_pickle: Some(Blob::new(tag.as_bytes().to_vec())),
					reflection_cache: Some(Blob::new(b"r".to_vec())),
					database_config: Some(Blob::new(b"c".to_vec())),
				},
			);
			diff
		};
		assert!(matches!(agent.dispatch(&call(1, Some("d"), full("a"), Vec::new(), b"x")), Reply::Success(_)));
		assert!(matches!(agent.dispatch(&call(2, Some("d"), full("b"), Vec::new(), b"y")), Reply::Success(_)));
		assert!(agent.holds_client(ClientId(1)));
		assert!(agent.holds_client(ClientId(2)));
	}

	#[test]
	fn invalidation_drops_the_named_client() {
		let agent = MultiTenantAgent::new(StubCompiler);
		let mut diff = ClientSchemaDiff::default();
		diff.db_diffs.insert(
			"d".to_string(),
			cpool_proto::DatabaseStateDiff {
				user_schema_pickle: Some(Blob::new(b"u".to_vec())),
				reflection_cache: Some(Blob::new(b"r".to_vec())),
				database_config: Some(Blob::new(b"c".to_vec())),
			},
		);
		agent.dispatch(&call(1, Some("d"), diff, Vec::new(), b"x"));
		assert!(agent.holds_client(ClientId(1)));

		agent.dispatch(&call(2, None, ClientSchemaDiff::default(), vec![ClientId(1)], b"y"));
		assert!(!agent.holds_client(ClientId(1)));
	}
}
