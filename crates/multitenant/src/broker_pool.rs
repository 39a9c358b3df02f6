//! The broker's inner worker pool (spec §4.8): workers selected by a
//! tenant-affinity weighter instead of plain FIFO, each forwarded call
//! rewritten into a `CallForClient` carrying that worker's outstanding
//! schema diff and invalidation list.
//!
//! Grounded in `MultiTenantPool`'s `_weighter`/`_acquire_worker`/
//! `_compute_compile_preargs` (`pool.py`): the three-tier preference
//! "already holds client_id, then most-recently-used, then most free
//! slots" collapses into one `i64` weight ([`weight_for_client`]) because
//! [`cpool_queue::WorkerQueue::acquire`] picks by a single scalar, not a
//! tuple comparison — a holder's weight is offset by a constant large
//! enough that it always outranks every non-holder's free-slot count.

use std::sync::Arc;
use std::sync::Mutex;

use cpool_pool::{PoolError, WantedState, WorkerTransport};
use cpool_proto::{Blob, CallEnvelope, CallForClient, ClientId, Operation, Preamble, Reply, StateId, TxEnvelope};
use cpool_queue::WorkerQueue;

use crate::worker_handle::MultiTenantWorkerHandle;

/// A compile request forwarded from one client connection.
pub struct TenantRequest {
	pub client_id: ClientId,
	pub dbname: Option<String>,
	pub wanted: WantedState,
	pub args: Blob,
}

/// A `compile_in_tx` request forwarded from one client connection.
///
/// `dbname` may be `None` — when the caller is attempting to reuse a
/// sticky transaction's state, the opaque state blob itself carries the
/// full context the worker needs, exactly as `cpool_worker::Agent` treats
/// a `None` `CallEnvelope::dbname` as "no database scope for this call".
pub struct TenantTxRequest {
	pub client_id: ClientId,
	pub dbname: Option<String>,
	pub wanted: WantedState,
	pub state_id: StateId,
	pub state: Blob,
	pub args: Blob,
}

/// Outrank any plausible free-slot count (bounded by a per-worker cache
/// size that is never anywhere near this large) so a holder is always
/// preferred over a non-holder, with recency breaking ties among holders.
const HOLDER_WEIGHT_BASE: i64 = 1_000_000_000_000;

pub struct BrokerPool {
	queue: WorkerQueue<Arc<MultiTenantWorkerHandle>>,
	running: std::sync::atomic::AtomicBool,
	all_workers: Mutex<Vec<Arc<MultiTenantWorkerHandle>>>,
}

impl Default for BrokerPool {
	fn default() -> Self {
		Self::new()
	}
}

impl BrokerPool {
	#[must_use]
	pub fn new() -> Self {
		Self {
			queue: WorkerQueue::new(),
			running: std::sync::atomic::AtomicBool::new(true),
			all_workers: Mutex::new(Vec::new()),
		}
	}

	pub fn register_worker(&self, worker: Arc<MultiTenantWorkerHandle>) {
		self.all_workers.lock().unwrap().push(Arc::clone(&worker));
		self.queue.release(worker, true);
	}

	pub fn stop(&self) {
		self.running.store(false, std::sync::atomic::Ordering::Release);
		self.queue.close();
	}

	#[must_use]
	pub fn is_running(&self) -> bool {
		self.running.load(std::sync::atomic::Ordering::Acquire)
	}

	/// Invalidate `client_id` across every worker this pool has ever
	/// registered, matching `MultiTenantPool.drop_tenant` — called when the
	/// owning client connection disconnects.
	pub fn drop_tenant(&self, client_id: ClientId) {
		for worker in self.all_workers.lock().unwrap().iter() {
			worker.drop_tenant(client_id);
		}
	}

	pub async fn compile(&self, operation: Operation, req: TenantRequest) -> Result<Blob, PoolError> {
		if !self.is_running() {
			return Err(PoolError::PoolClosed);
		}
		let client_id = req.client_id;
		let worker = self
			.queue
			.acquire(None, Some(&|w: &Arc<MultiTenantWorkerHandle>| weight_for_client(w, client_id)))
			.await
			.map_err(|_| PoolError::PoolClosed)?;

		let (diff, invalidate) = {
			let mut cache = worker.cache().lock().unwrap();
			let diff = cache.compute_diff(client_id, req.dbname.as_deref(), &req.wanted);
			let invalidate = cache.take_invalidations();
			(diff, invalidate)
		};

		let call = CallForClient {
			client_id,
			diff,
			invalidate,
			call: CallEnvelope {
				operation,
				preamble: Preamble::unchanged(),
				dbname: req.dbname.clone(),
				tx: None,
				args: req.args,
			},
		};

		let reply = send(worker.transport(), &call).await;
		match reply {
			Ok(Reply::Success(blob)) => {
				worker.cache().lock().unwrap().record_applied(client_id, req.dbname.as_deref(), &req.wanted);
				self.queue.release(worker, true);
				Ok(blob)
			}
			Ok(Reply::Error { code, message, trace }) => {
				self.queue.release(worker, true);
				Err(PoolError::from_wire(code, message, trace))
			}
			Ok(Reply::SerializationFailure { trace }) => {
				self.queue.release(worker, true);
				Err(PoolError::SerializationFailure { trace })
			}
			Ok(Reply::TxSuccess { .. }) => {
				self.queue.release(worker, true);
				Err(PoolError::SerializationFailure {
					trace: "unexpected TxSuccess reply to a non-transactional call".to_string(),
				})
			}
			// The worker's transport just failed this call; it's dead or
			// dying (`is_closed()` will observe it shortly, if it hasn't
			// already). Drop it instead of releasing it back to the idle
			// queue, where `weight_for_client`'s tenant-affinity weighting
			// would only keep re-selecting it.
			Err(err) => Err(err),
		}
	}

	/// Run one `compile_in_tx` call, retrying exactly once with the full
	/// pickled state if the sticky attempt comes back `StateNotFound` (spec
	/// §7's global retry rule) — mirrors `cpool_pool::Pool::compile_in_tx`.
	pub async fn compile_in_tx(&self, req: TenantTxRequest) -> Result<(Blob, Blob, StateId), PoolError> {
		match self.try_compile_in_tx(&req, true).await {
			Err(err) if err.is_state_not_found() => self.try_compile_in_tx(&req, false).await,
			other => other,
		}
	}

	/// `compile_in_tx`'s worker preference: a worker reporting
	/// `last_tx_state_id == state_id` when reuse is being attempted, else
	/// the ordinary tenant-affinity weighter (spec §4.8 bullet 3).
	async fn try_compile_in_tx(&self, req: &TenantTxRequest, allow_reuse_last: bool) -> Result<(Blob, Blob, StateId), PoolError> {
		if !self.is_running() {
			return Err(PoolError::PoolClosed);
		}
		let client_id = req.client_id;
		let sticky = req.state_id != StateId::NONE && allow_reuse_last;
		let worker = if sticky {
			let wanted_state_id = req.state_id;
			self.queue
				.acquire(Some(&|w: &Arc<MultiTenantWorkerHandle>| w.last_tx_state_id() == wanted_state_id), None)
				.await
		} else {
			self.queue
				.acquire(None, Some(&|w: &Arc<MultiTenantWorkerHandle>| weight_for_client(w, client_id)))
				.await
		}
		.map_err(|_| PoolError::PoolClosed)?;

		let holds_state = sticky && worker.last_tx_state_id() == req.state_id;
		let (state, dbname) = if holds_state {
			(cpool_proto::REUSE_LAST_STATE_MARKER.clone(), None)
		} else {
			(req.state.clone(), req.dbname.clone())
		};

		let (diff, invalidate) = {
			let mut cache = worker.cache().lock().unwrap();
			let diff = cache.compute_diff(client_id, req.dbname.as_deref(), &req.wanted);
			let invalidate = cache.take_invalidations();
			(diff, invalidate)
		};

		let call = CallForClient {
			client_id,
			diff,
			invalidate,
			call: CallEnvelope {
				operation: Operation::CompileInTx,
				preamble: Preamble::unchanged(),
				dbname,
				tx: Some(TxEnvelope {
					state_id: req.state_id,
					state,
				}),
				args: req.args.clone(),
			},
		};

		let reply = send(worker.transport(), &call).await;
		match reply {
			Ok(Reply::TxSuccess { result, state, state_id }) => {
				worker.cache().lock().unwrap().record_applied(client_id, req.dbname.as_deref(), &req.wanted);
				worker.set_last_tx_state_id(state_id);
				self.queue.release(worker, false);
				Ok((result, state, state_id))
			}
			Ok(Reply::Error { code, message, trace }) => {
				self.queue.release(worker, false);
				Err(PoolError::from_wire(code, message, trace))
			}
			Ok(Reply::SerializationFailure { trace }) => {
				self.queue.release(worker, false);
				Err(PoolError::SerializationFailure { trace })
			}
			Ok(Reply::Success(_)) => {
				self.queue.release(worker, false);
				Err(PoolError::SerializationFailure {
					trace: "unexpected plain Success reply to compile_in_tx".to_string(),
				})
			}
			// Same as `compile`: a transport failure means this worker is
			// dead; discard it rather than releasing it back to the queue.
			Err(err) => Err(err),
		}
	}
}

fn weight_for_client(worker: &Arc<MultiTenantWorkerHandle>, client_id: ClientId) -> i64 {
	if worker.holds_client(client_id) {
		let millis = worker
			.last_used(client_id)
			.map(|t| t.elapsed().as_millis() as i64)
			.unwrap_or(0);
		// More recently used => smaller elapsed time => should weigh more,
		// so subtract from the base rather than add.
		HOLDER_WEIGHT_BASE - millis
	} else {
		worker.free_slots()
	}
}

async fn send(transport: &Arc<dyn WorkerTransport>, call: &CallForClient) -> Result<Reply, PoolError> {
	let payload = postcard::to_allocvec(call).map_err(|err| PoolError::SerializationFailure { trace: err.to_string() })?;
	let bytes = transport.call(&payload).await?;
	postcard::from_bytes(&bytes).map_err(|err| PoolError::SerializationFailure { trace: err.to_string() })
}
