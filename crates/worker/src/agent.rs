//! Per-worker-process dispatch: apply the state-sync preamble, call the
//! compiler, and fold the result into a wire [`Reply`].

use std::collections::HashMap;
use std::sync::Mutex;

use cpool_proto::{Blob, CallEnvelope, DatabaseState, ErrorCode, Operation, Preamble, Reply, StateId};

use crate::compiler::{CompileContext, Compiler};

/// The heavy, shared, per-process state plus the per-database cache one
/// worker process holds for its entire lifetime.
pub struct Agent<C> {
	compiler: C,
	global: Mutex<GlobalState>,
	dbs: Mutex<HashMap<String, DatabaseState>>,
	last_tx: Mutex<Option<(StateId, Blob)>>,
}

#[derive(Default)]
struct GlobalState {
	global_schema_pickle: Option<Blob>,
	system_config: Option<Blob>,
}

impl<C: Compiler> Agent<C> {
	pub fn new(compiler: C) -> Self {
		Self {
			compiler,
			global: Mutex::new(GlobalState::default()),
			dbs: Mutex::new(HashMap::new()),
			last_tx: Mutex::new(None),
		}
	}

	/// Apply the preamble, dispatch by operation, and encode the result as
	/// a wire [`Reply`]. Never panics on a malformed preamble — that
	/// surfaces as `FailedStateSync`, per spec §7.
	pub fn dispatch(&self, call: &CallEnvelope) -> Reply {
		self.apply_global_preamble(&call.preamble);

		let db_state = match self.apply_db_preamble(call.dbname.as_deref(), &call.preamble) {
			Ok(state) => state,
			Err(()) => {
				return Reply::Error {
					code: ErrorCode::FailedStateSync,
					message: "incomplete database state preamble".to_string(),
					trace: String::new(),
				};
			}
		};

		let ctx = CompileContext {
			dbname: call.dbname.clone(),
			user_schema_pickle: db_state.as_ref().map(|s| s.user_schema_pickle.clone()),
			reflection_cache: db_state.as_ref().map(|s| s.reflection_cache.clone()),
			database_config: db_state.as_ref().map(|s| s.database_config.clone()),
			global_schema_pickle: self.global.lock().unwrap().global_schema_pickle.clone(),
			system_config: self.global.lock().unwrap().system_config.clone(),
		};

		match call.operation {
			Operation::CompileInTx => self.dispatch_in_tx(&ctx, call),
			other => self.dispatch_simple(other, &ctx, &call.args),
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

	fn dispatch_in_tx(&self, ctx: &CompileContext, call: &CallEnvelope) -> Reply {
		let Some(tx) = call.tx.as_ref() else {
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

		match self.compiler.compile_in_tx(ctx, &effective_state, &call.args) {
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

	fn apply_global_preamble(&self, preamble: &Preamble) {
		let mut g = self.global.lock().unwrap();
		if let Some(blob) = &preamble.global_schema_pickle {
			g.global_schema_pickle = Some(blob.clone());
		}
		if let Some(blob) = &preamble.system_config {
			g.system_config = Some(blob.clone());
		}
	}

	/// Merge the preamble's per-database fields into the cached
	/// [`DatabaseState`] for `dbname`, if any. `Err(())` means the merge
	/// would leave the state partially seeded (some but not all of the
	/// three fields known) — a protocol violation surfaced as
	/// `FailedStateSync` rather than silently compiling against a
	/// half-known schema.
	fn apply_db_preamble(
		&self,
		dbname: Option<&str>,
		preamble: &Preamble,
	) -> Result<Option<DatabaseState>, ()> {
		let Some(dbname) = dbname else {
			return Ok(None);
		};

		let mut dbs = self.dbs.lock().unwrap();
		let existing = dbs.get(dbname);

		let user = preamble
			.user_schema_pickle
			.clone()
			.or_else(|| existing.map(|s| s.user_schema_pickle.clone()));
		let refl = preamble
			.reflection_cache
			.clone()
			.or_else(|| existing.map(|s| s.reflection_cache.clone()));
		let cfg = preamble
			.database_config
			.clone()
			.or_else(|| existing.map(|s| s.database_config.clone()));

		match (user, refl, cfg) {
			(Some(user_schema_pickle), Some(reflection_cache), Some(database_config)) => {
				let state = DatabaseState {
					user_schema_pickle,
					reflection_cache,
					database_config,
				};
				dbs.insert(dbname.to_string(), state.clone());
				Ok(Some(state))
			}
			(None, None, None) => Ok(existing.cloned()),
			_ => Err(()),
		}
	}
}

#[cfg(test)]
mod tests {
	use cpool_proto::{CallEnvelope, Preamble};

	use super::*;
	use crate::compiler::StubCompiler;

	fn envelope(dbname: Option<&str>, preamble: Preamble, args: &[u8]) -> CallEnvelope {
		CallEnvelope {
			operation: Operation::Compile,
			preamble,
			dbname: dbname.map(str::to_string),
			tx: None,
			args: Blob::new(args.to_vec()),
		}
	}

	#[test]
	fn first_call_requires_full_preamble() {
		let agent = Agent::new(StubCompiler);
		let preamble = Preamble {
			user_schema_pickle: Some(Blob::new(b"u".to_vec())),
			..Default::default()
		};
		let reply = agent.dispatch(&envelope(Some("d"), preamble, b"SELECT 1"));
		assert!(matches!(
			reply,
			Reply::Error {
				code: ErrorCode::FailedStateSync,
				..
			}
		));
	}

	#[test]
	fn second_call_can_omit_unchanged_fields() {
		let agent = Agent::new(StubCompiler);
		let full = Preamble {
			user_schema_pickle: Some(Blob::new(b"u".to_vec())),
			reflection_cache: Some(Blob::new(b"r".to_vec())),
			database_config: Some(Blob::new(b"c".to_vec())),
			..Default::default()
		};
		let first = agent.dispatch(&envelope(Some("d"), full, b"SELECT 1"));
		assert!(matches!(first, Reply::Success(_)));

		let nil = Preamble::unchanged();
		let second = agent.dispatch(&envelope(Some("d"), nil, b"SELECT 2"));
		assert!(matches!(second, Reply::Success(_)));
	}

	#[test]
	fn reuse_last_without_held_state_is_state_not_found() {
		let agent = Agent::new(StubCompiler);
		let call = CallEnvelope {
			operation: Operation::CompileInTx,
			preamble: Preamble::unchanged(),
			dbname: Some("d".to_string()),
			tx: Some(cpool_proto::TxEnvelope {
				state_id: StateId(1),
				state: cpool_proto::REUSE_LAST_STATE_MARKER.clone(),
			}),
			args: Blob::new(b"BEGIN".to_vec()),
		};
		let reply = agent.dispatch(&call);
		assert!(matches!(
			reply,
			Reply::Error {
				code: ErrorCode::StateNotFound,
				..
			}
		));
	}

	#[test]
	fn tx_roundtrip_then_reuse_last_succeeds() {
		let agent = Agent::new(StubCompiler);
		let full = Preamble {
			user_schema_pickle: Some(Blob::new(b"u".to_vec())),
			reflection_cache: Some(Blob::new(b"r".to_vec())),
			database_config: Some(Blob::new(b"c".to_vec())),
			..Default::default()
		};
		let begin = CallEnvelope {
			operation: Operation::CompileInTx,
			preamble: full,
			dbname: Some("d".to_string()),
			tx: Some(cpool_proto::TxEnvelope {
				state_id: StateId::NONE,
				state: Blob::new(Vec::new()),
			}),
			args: Blob::new(b"BEGIN".to_vec()),
		};
		let Reply::TxSuccess { state_id, .. } = agent.dispatch(&begin) else {
			panic!("expected TxSuccess");
		};

		let reuse = CallEnvelope {
			operation: Operation::CompileInTx,
			preamble: Preamble::unchanged(),
			dbname: None,
			tx: Some(cpool_proto::TxEnvelope {
				state_id,
				state: cpool_proto::REUSE_LAST_STATE_MARKER.clone(),
			}),
			args: Blob::new(b"SELECT 1".to_vec()),
		};
		assert!(matches!(agent.dispatch(&reuse), Reply::TxSuccess { .. }));
	}
}
