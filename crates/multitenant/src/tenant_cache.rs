//! Broker-side mirror of one worker's per-`client_id` tenant schema cache
//! (spec §4.8 "Worker (in multi-tenant mode)"), grounded in
//! `MultiTenantWorker`'s `_cache`/`_invalidated_clients`/`_last_used_by_client`
//! (`pool.py`, `MultiTenantWorker`).
//!
//! The broker never asks a worker what it holds — it tracks its own belief
//! here, the same way `WorkerView` tracks a single-tenant worker's belief,
//! and only finds out it was wrong via a `FailedStateSync`/`StateNotFound`
//! reply. Eviction is lazy: `maybe_invalidate_last` only *marks* the
//! least-recently-used entry; the entry is physically dropped only once
//! [`TenantCache::take_invalidations`] ships that mark to the worker in a
//! `CallForClient`, at which point both sides forget it in lockstep.

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use cpool_pool::WantedState;
use cpool_proto::{Blob, ClientId, DatabaseState, DatabaseStateDiff, ClientSchemaDiff};

#[derive(Default)]
struct CachedTenant {
	dbs: HashMap<String, DatabaseState>,
	global_schema_pickle: Option<Blob>,
	system_config: Option<Blob>,
	last_used: Option<Instant>,
}

pub(crate) struct TenantCache {
	capacity: usize,
	entries: HashMap<ClientId, CachedTenant>,
	invalidated: HashSet<ClientId>,
}

impl TenantCache {
	pub(crate) fn new(capacity: usize) -> Self {
		Self {
			capacity: capacity.max(1),
			entries: HashMap::new(),
			invalidated: HashSet::new(),
		}
	}

	/// Active entries, excluding ones already marked invalidated — matches
	/// `MultiTenantWorker.cache_size()`.
	pub(crate) fn cache_size(&self) -> usize {
		self.entries.len() - self.invalidated.len()
	}

	/// Whether this worker is currently believed to hold `client_id`'s
	/// schema (an entry marked invalidated no longer counts).
	pub(crate) fn holds(&self, client_id: ClientId) -> bool {
		self.entries.contains_key(&client_id) && !self.invalidated.contains(&client_id)
	}

	pub(crate) fn last_used(&self, client_id: ClientId) -> Option<Instant> {
		self.entries.get(&client_id).and_then(|t| t.last_used)
	}

	pub(crate) fn free_slots(&self) -> i64 {
		self.capacity as i64 - self.cache_size() as i64
	}

	/// Mark `client_id` for removal on the next flush; does not evict yet.
	pub(crate) fn invalidate(&mut self, client_id: ClientId) {
		if self.entries.contains_key(&client_id) {
			self.invalidated.insert(client_id);
		}
	}

	/// If this worker is at capacity and `client_id` is not already a
	/// resident, mark the globally least-recently-used non-invalidated
	/// entry for removal so there is room.
	fn maybe_invalidate_last(&mut self, client_id: ClientId) {
		if self.entries.contains_key(&client_id) || self.cache_size() < self.capacity {
			return;
		}
		let lru = self
			.entries
			.iter()
			.filter(|(id, _)| !self.invalidated.contains(*id))
			.min_by_key(|(_, t)| t.last_used)
			.map(|(id, _)| *id);
		if let Some(id) = lru {
			self.invalidated.insert(id);
		}
	}

	/// Drain the invalidated set, physically removing those entries. The
	/// drained ids are what rides along in the next `CallForClient` this
	/// worker receives.
	pub(crate) fn take_invalidations(&mut self) -> Vec<ClientId> {
		let ids: Vec<ClientId> = self.invalidated.drain().collect();
		for id in &ids {
			self.entries.remove(id);
		}
		ids
	}

	/// Diff `wanted` against this worker's cached belief for `client_id` /
	/// `dbname`, producing the fields a `CallForClient` must actually carry.
	pub(crate) fn compute_diff(&mut self, client_id: ClientId, dbname: Option<&str>, wanted: &WantedState) -> ClientSchemaDiff {
		self.maybe_invalidate_last(client_id);
		let tenant = self.entries.entry(client_id).or_default();

		let db = dbname.and_then(|n| tenant.dbs.get(n));
		let mut db_diffs = HashMap::new();
		if let Some(dbname) = dbname {
			let diff = DatabaseStateDiff {
				user_schema_pickle: diff_field(wanted.user_schema_pickle.as_ref(), db.map(|d| &d.user_schema_pickle)),
				reflection_cache: diff_field(wanted.reflection_cache.as_ref(), db.map(|d| &d.reflection_cache)),
				database_config: diff_field(wanted.database_config.as_ref(), db.map(|d| &d.database_config)),
			};
			if diff.user_schema_pickle.is_some() || diff.reflection_cache.is_some() || diff.database_config.is_some() {
				db_diffs.insert(dbname.to_string(), diff);
			}
		}

		ClientSchemaDiff {
			db_diffs,
			dropped_dbs: Vec::new(),
			global_schema_pickle: diff_field(wanted.global_schema_pickle.as_ref(), tenant.global_schema_pickle.as_ref()),
			system_config: diff_field(wanted.system_config.as_ref(), tenant.system_config.as_ref()),
		}
	}

	/// Record that `wanted` was applied successfully for `client_id` and
	/// touch its recency; called only after a non-`FailedStateSync` reply.
	pub(crate) fn record_applied(&mut self, client_id: ClientId, dbname: Option<&str>, wanted: &WantedState) {
		let tenant = self.entries.entry(client_id).or_default();
		tenant.last_used = Some(Instant::now());
		if let Some(blob) = &wanted.global_schema_pickle {
			tenant.global_schema_pickle = Some(blob.clone());
		}
		if let Some(blob) = &wanted.system_config {
			tenant.system_config = Some(blob.clone());
		}
		let Some(dbname) = dbname else { return };

		let user = wanted
			.user_schema_pickle
			.clone()
			.or_else(|| tenant.dbs.get(dbname).map(|d| d.user_schema_pickle.clone()));
		let refl = wanted
			.reflection_cache
			.clone()
			.or_else(|| tenant.dbs.get(dbname).map(|d| d.reflection_cache.clone()));
		let cfg = wanted
			.database_config
			.clone()
			.or_else(|| tenant.dbs.get(dbname).map(|d| d.database_config.clone()));

		if let (Some(user_schema_pickle), Some(reflection_cache), Some(database_config)) = (user, refl, cfg) {
			tenant.dbs.insert(
				dbname.to_string(),
				DatabaseState {
					user_schema_pickle,
					reflection_cache,
					database_config,
				},
			);
		}
	}

	/// Drop `client_id` unconditionally (client disconnected): mirrors
	/// `MultiTenantPool.drop_tenant` invalidating across all workers.
	pub(crate) fn drop_tenant(&mut self, client_id: ClientId) {
		self.invalidate(client_id);
	}
}

fn diff_field(wanted: Option<&Blob>, cached: Option<&Blob>) -> Option<Blob> {
	match (wanted, cached) {
		(Some(w), Some(c)) if w.same_as(c) => None,
		(Some(w), _) => Some(w.clone()),
		(None, _) => None,
	}
}
