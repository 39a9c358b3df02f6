//! The broker's handle on one internal worker process: its call channel
//! plus the [`TenantCache`] mirroring what the broker believes that worker
//! holds, plus the single in-flight transaction's `state_id` (a worker
//! serves one `compile_in_tx` continuation at a time, same as the
//! single-tenant pool — spec §4.9).

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use cpool_pool::WorkerTransport;
use cpool_proto::{ClientId, StateId};

use crate::tenant_cache::TenantCache;

pub struct MultiTenantWorkerHandle {
	pub pid: u64,
	transport: Arc<dyn WorkerTransport>,
	cache: Mutex<TenantCache>,
	last_tx_state_id: AtomicU64,
}

impl MultiTenantWorkerHandle {
	#[must_use]
	pub fn new(pid: u64, transport: Arc<dyn WorkerTransport>, cache_size: usize) -> Self {
		Self {
			pid,
			transport,
			cache: Mutex::new(TenantCache::new(cache_size)),
			last_tx_state_id: AtomicU64::new(StateId::NONE.0),
		}
	}

	pub(crate) fn transport(&self) -> &Arc<dyn WorkerTransport> {
		&self.transport
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.transport.is_closed()
	}

	#[must_use]
	pub fn last_tx_state_id(&self) -> StateId {
		StateId(self.last_tx_state_id.load(Ordering::Acquire))
	}

	pub(crate) fn set_last_tx_state_id(&self, id: StateId) {
		self.last_tx_state_id.store(id.0, Ordering::Release);
	}

	#[must_use]
	pub fn holds_client(&self, client_id: ClientId) -> bool {
		self.cache.lock().unwrap().holds(client_id)
	}

	#[must_use]
	pub fn last_used(&self, client_id: ClientId) -> Option<std::time::Instant> {
		self.cache.lock().unwrap().last_used(client_id)
	}

	#[must_use]
	pub fn free_slots(&self) -> i64 {
		self.cache.lock().unwrap().free_slots()
	}

	pub(crate) fn cache(&self) -> &Mutex<TenantCache> {
		&self.cache
	}

	pub fn drop_tenant(&self, client_id: ClientId) {
		self.cache.lock().unwrap().drop_tenant(client_id);
	}
}
