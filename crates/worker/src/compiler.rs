//! The black-box compiler seam.
//!
//! The actual query-language compiler is out of scope for this workspace;
//! what the worker agent needs is a fixed, exhaustive set of entry points it
//! can dispatch to. [`Compiler`] is that seam — one method per operation in
//! the pool's public interface, each taking and returning opaque blobs.

use cpool_proto::Blob;
use thiserror::Error;

/// A domain error raised by the compiler, carried back to the pool's caller
/// with the worker's formatted trace attached.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct CompilerError {
	pub message: String,
	pub trace: String,
}

impl CompilerError {
	#[must_use]
	pub fn new(message: impl Into<String>, trace: impl Into<String>) -> Self {
		Self {
			message: message.into(),
			trace: trace.into(),
		}
	}
}

/// Schema/config state in effect for one call, after the state-sync
/// preamble has been applied. Per-database fields are `None` when the call
/// does not name a database.
#[derive(Debug, Clone, Default)]
pub struct CompileContext {
	pub dbname: Option<String>,
	pub user_schema_pickle: Option<Blob>,
	pub reflection_cache: Option<Blob>,
	pub database_config: Option<Blob>,
	pub global_schema_pickle: Option<Blob>,
	pub system_config: Option<Blob>,
}

/// One method per pool operation (spec §4.4), all returning a result blob or
/// a [`CompilerError`] the worker formats into the wire reply.
pub trait Compiler: Send + Sync + 'static {
	fn compile(&self, ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError>;

	/// Continue a transactional compile. Returns `(result, new_state)`; the
	/// agent assigns the fresh `state_id` and remembers `new_state` for a
	/// future reuse-last call.
	fn compile_in_tx(
		&self,
		ctx: &CompileContext,
		state: &Blob,
		args: &Blob,
	) -> Result<(Blob, Blob), CompilerError>;

	fn compile_notebook(&self, ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError>;
	fn compile_graphql(&self, ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError>;
	fn compile_sql(&self, ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError>;
	fn parse_global_schema(&self, args: &Blob) -> Result<Blob, CompilerError>;
	fn parse_user_schema_db_config(&self, args: &Blob) -> Result<Blob, CompilerError>;
	fn make_state_serializer(&self, ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError>;
	fn describe_database_dump(&self, ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError>;
	fn describe_database_restore(&self, ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError>;
	fn analyze_explain_output(&self, args: &Blob) -> Result<Blob, CompilerError>;
	fn validate_schema_equivalence(&self, args: &Blob) -> Result<Blob, CompilerError>;
	fn compile_structured_config(&self, ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError>;
	fn interpret_backend_error(&self, args: &Blob) -> Result<Blob, CompilerError>;
}

/// A compiler that echoes its arguments back as the result. Exists purely
/// so the worker agent, dispatch loop, and pool logic can be exercised
/// end-to-end without the real (out of scope) compiler; grounded in the
/// teacher's `FakeLsp` test double.
#[derive(Debug, Default)]
pub struct StubCompiler;

impl Compiler for StubCompiler {
	fn compile(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn compile_in_tx(
		&self,
		_ctx: &CompileContext,
		state: &Blob,
		args: &Blob,
	) -> Result<(Blob, Blob), CompilerError> {
		let mut new_state = state.bytes().to_vec();
		new_state.extend_from_slice(args.bytes());
		Ok((Blob::new(args.bytes().to_vec()), Blob::new(new_state)))
	}

	fn compile_notebook(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn compile_graphql(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn compile_sql(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn parse_global_schema(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn parse_user_schema_db_config(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn make_state_serializer(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn describe_database_dump(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn describe_database_restore(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn analyze_explain_output(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn validate_schema_equivalence(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn compile_structured_config(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn interpret_backend_error(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}
}
