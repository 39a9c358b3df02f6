//! The pool base (spec §4.4): worker selection, state-sync preamble
//! computation, and the `compile*` family of public operations. Owns no
//! process lifecycle — that is `cpool-pool-fixed`/`cpool-pool-adaptive`'s
//! job, layered on top via [`Pool::register_worker`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cpool_proto::{Blob, CallEnvelope, Operation, Reply, StateId, TxEnvelope};
use cpool_queue::WorkerQueue;

use crate::error::PoolError;
use crate::worker_view::{WantedState, WorkerView};

/// A plain (non-transactional) compile-family request.
#[derive(Debug, Clone)]
pub struct Request {
	pub dbname: Option<String>,
	pub wanted: WantedState,
	pub args: Blob,
}

/// A `compile_in_tx` request (spec §4.4 step 1).
#[derive(Debug, Clone)]
pub struct TxRequest {
	pub dbname: String,
	pub wanted: WantedState,
	/// `StateId::NONE` starts a fresh transaction; any other value asks the
	/// pool to continue an existing one, preferring the worker that is
	/// already holding it.
	pub state_id: StateId,
	/// The caller's full pickled transaction state. Only sent on the wire
	/// when the selected worker does not already hold `state_id`.
	pub state: Blob,
	pub args: Blob,
}

/// The outcome of a successful `compile_in_tx` call: the compiled result
/// plus the fresh `state_id` the caller must present on its next call in
/// the same transaction.
#[derive(Debug, Clone)]
pub struct TxOutcome {
	pub result: Blob,
	pub state: Blob,
	pub state_id: StateId,
}

pub struct Pool {
	queue: WorkerQueue<Arc<WorkerView>>,
	running: AtomicBool,
}

impl Default for Pool {
	fn default() -> Self {
		Self::new()
	}
}

impl Pool {
	#[must_use]
	pub fn new() -> Self {
		Self {
			queue: WorkerQueue::new(),
			running: AtomicBool::new(true),
		}
	}

	/// Add a freshly-spawned, idle worker to the pool.
	pub fn register_worker(&self, view: Arc<WorkerView>) {
		self.queue.release(view, true);
	}

	/// Stop accepting new calls and fail every outstanding and future
	/// `acquire` with [`PoolError::PoolClosed`].
	pub fn stop(&self) {
		self.running.store(false, Ordering::Release);
		self.queue.close();
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.running.load(Ordering::Acquire)
	}

	#[must_use]
	pub fn idle_count(&self) -> usize {
		self.queue.qsize()
	}

	#[must_use]
	pub fn waiting_count(&self) -> usize {
		self.queue.count_waiters()
	}

	/// Remove up to `max` idle workers, oldest [`WorkerView::last_used`]
	/// first, and mark each closed. Never touches a worker currently
	/// checked out for a call — only the adaptive pool shape calls this,
	/// to shrink back toward its floor once callers have gone quiet.
	pub fn evict_idle_lru(&self, max: usize) -> Vec<Arc<WorkerView>> {
		let weighter = |w: &Arc<WorkerView>| w.last_used().elapsed().as_nanos() as i64;
		let mut evicted = Vec::with_capacity(max);
		while evicted.len() < max {
			match self.queue.try_acquire(Some(&weighter)) {
				Some(worker) => {
					worker.mark_closed();
					evicted.push(worker);
				}
				None => break,
			}
		}
		evicted
	}

	pub async fn compile(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::Compile, req).await
	}

	pub async fn compile_notebook(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::CompileNotebook, req).await
	}

	pub async fn compile_graphql(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::CompileGraphql, req).await
	}

	pub async fn compile_sql(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::CompileSql, req).await
	}

	pub async fn parse_global_schema(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::ParseGlobalSchema, req).await
	}

	pub async fn parse_user_schema_db_config(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::ParseUserSchemaDbConfig, req).await
	}

	pub async fn make_state_serializer(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::MakeStateSerializer, req).await
	}

	pub async fn describe_database_dump(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::DescribeDatabaseDump, req).await
	}

	pub async fn describe_database_restore(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::DescribeDatabaseRestore, req).await
	}

	pub async fn analyze_explain_output(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::AnalyzeExplainOutput, req).await
	}

	pub async fn validate_schema_equivalence(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::ValidateSchemaEquivalence, req).await
	}

	pub async fn compile_structured_config(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::CompileStructuredConfig, req).await
	}

	pub async fn interpret_backend_error(&self, req: Request) -> Result<Blob, PoolError> {
		self.call_simple(Operation::InterpretBackendError, req).await
	}

	/// Acquire an idle worker, discarding and retrying past any that turn
	/// out dead (spec §4.4: "a worker returned by `acquire` whose process
	/// identity is no longer registered is discarded and `acquire`
	/// retries") — matches `BaseLocalPool._acquire_worker`'s
	/// `while (worker := await self._workers_queue.acquire(...)).get_pid()
	/// not in self._workers: pass` loop. `WorkerQueue` itself has no
	/// liveness awareness, so the discard has to happen here.
	async fn acquire_live(&self, condition: Option<&(dyn Fn(&Arc<WorkerView>) -> bool + Send + Sync)>) -> Result<Arc<WorkerView>, PoolError> {
		loop {
			let worker = self.queue.acquire(condition, None).await.map_err(|_| PoolError::PoolClosed)?;
			if !worker.is_closed() {
				return Ok(worker);
			}
		}
	}

	async fn call_simple(&self, operation: Operation, req: Request) -> Result<Blob, PoolError> {
		if !self.is_running() {
			return Err(PoolError::PoolClosed);
		}
		let worker = self.acquire_live(None).await?;

		let preamble = worker.compute_preamble(req.dbname.as_deref(), &req.wanted);
		let call = CallEnvelope {
			operation,
			preamble,
			dbname: req.dbname.clone(),
			tx: None,
			args: req.args,
		};

		let outcome = send(&worker, &call).await;
		self.settle_simple(worker, &req.dbname, &req.wanted, outcome)
	}

	fn settle_simple(
		&self,
		worker: Arc<WorkerView>,
		dbname: &Option<String>,
		wanted: &WantedState,
		outcome: Result<Reply, PoolError>,
	) -> Result<Blob, PoolError> {
		match outcome {
			Ok(Reply::Success(blob)) => {
				worker.record_applied(dbname.as_deref(), wanted);
				worker.touch();
				self.queue.release(worker, true);
				Ok(blob)
			}
			Ok(Reply::TxSuccess { result, .. }) => {
				// Only `compile_in_tx` ever produces this reply shape; a
				// simple op never should, but settle it as a plain success
				// rather than panicking on a worker bug.
				worker.record_applied(dbname.as_deref(), wanted);
				worker.touch();
				self.queue.release(worker, true);
				Ok(result)
			}
			Ok(Reply::Error { code, message, trace }) => {
				let err = PoolError::from_wire(code, message, trace);
				if !matches!(err, PoolError::FailedStateSync { .. }) {
					worker.record_applied(dbname.as_deref(), wanted);
				}
				worker.touch();
				self.queue.release(worker, true);
				Err(err)
			}
			Ok(Reply::SerializationFailure { trace }) => {
				worker.touch();
				self.queue.release(worker, true);
				Err(PoolError::SerializationFailure { trace })
			}
			Err(err) => {
				worker.mark_closed();
				Err(err)
			}
		}
	}

	/// Run one `compile_in_tx` call, retrying exactly once with the full
	/// pickled state if the first attempt comes back `StateNotFound` (spec
	/// §7's global retry rule) — the sticky worker dropped the state the
	/// pool believed it still held.
	pub async fn compile_in_tx(&self, req: TxRequest) -> Result<TxOutcome, PoolError> {
		match self.try_compile_in_tx(&req, true).await {
			Err(err) if err.is_state_not_found() => self.try_compile_in_tx(&req, false).await,
			other => other,
		}
	}

	async fn try_compile_in_tx(&self, req: &TxRequest, allow_reuse_last: bool) -> Result<TxOutcome, PoolError> {
		if !self.is_running() {
			return Err(PoolError::PoolClosed);
		}

		let sticky = req.state_id != StateId::NONE && allow_reuse_last;
		let worker = if sticky {
			let target = req.state_id;
			let condition = move |w: &Arc<WorkerView>| w.last_tx_state_id() == target;
			self.acquire_live(Some(&condition)).await?
		} else {
			self.acquire_live(None).await?
		};

		let holds_state =
			allow_reuse_last && worker.last_tx_state_id() == req.state_id && req.state_id != StateId::NONE;
		let (effective_state, dbname) = if holds_state {
			(cpool_proto::REUSE_LAST_STATE_MARKER.clone(), None)
		} else {
			(req.state.clone(), Some(req.dbname.clone()))
		};

		let preamble = worker.compute_preamble(Some(&req.dbname), &req.wanted);
		let call = CallEnvelope {
			operation: Operation::CompileInTx,
			preamble,
			dbname,
			tx: Some(TxEnvelope {
				state_id: req.state_id,
				state: effective_state,
			}),
			args: req.args.clone(),
		};

		let outcome = send(&worker, &call).await;
		self.settle_tx(worker, &req.dbname, &req.wanted, outcome)
	}

	fn settle_tx(
		&self,
		worker: Arc<WorkerView>,
		dbname: &str,
		wanted: &WantedState,
		outcome: Result<Reply, PoolError>,
	) -> Result<TxOutcome, PoolError> {
		match outcome {
			Ok(Reply::TxSuccess { result, state, state_id }) => {
				worker.record_applied(Some(dbname), wanted);
				worker.set_last_tx_state_id(state_id);
				worker.touch();
				// Transactional releases go to the back: keep this worker
				// less likely to be picked for an unrelated plain compile
				// while it still holds this transaction's state.
				self.queue.release(worker, false);
				Ok(TxOutcome { result, state, state_id })
			}
			Ok(Reply::Success(blob)) => {
				worker.touch();
				self.queue.release(worker, false);
				Ok(TxOutcome {
					result: blob,
					state: Blob::new(Vec::new()),
					state_id: StateId::NONE,
				})
			}
			Ok(Reply::Error { code, message, trace }) => {
				let err = PoolError::from_wire(code, message, trace);
				if !matches!(err, PoolError::FailedStateSync { .. }) {
					worker.record_applied(Some(dbname), wanted);
				}
				worker.touch();
				self.queue.release(worker, false);
				Err(err)
			}
			Ok(Reply::SerializationFailure { trace }) => {
				worker.touch();
				self.queue.release(worker, false);
				Err(PoolError::SerializationFailure { trace })
			}
			Err(err) => {
				worker.mark_closed();
				Err(err)
			}
		}
	}
}

async fn send(worker: &WorkerView, call: &CallEnvelope) -> Result<Reply, PoolError> {
	let payload = postcard::to_allocvec(call).map_err(|err| PoolError::SerializationFailure { trace: err.to_string() })?;
	let bytes = worker.transport().call(&payload).await?;
	postcard::from_bytes(&bytes).map_err(|err| PoolError::SerializationFailure { trace: err.to_string() })
}
