//! A small stand-in for [`cpool_pool::WorkerView`]'s preamble cache, scoped
//! to this crate's single implicit "worker": the broker connection itself.
//!
//! `WorkerView`'s diffing methods are `pub(crate)` to `cpool-pool` and stay
//! that way — its queue/acquire/release machinery doesn't fit a pool with
//! exactly one multiplexed connection instead of many interchangeable
//! workers, so this crate keeps its own copy of just the diffing logic
//! rather than reusing `WorkerView` itself. Must be reset whenever the
//! underlying connection is replaced by a reconnect: a freshly connected
//! broker has no memory of whatever state this pool last synced to the old
//! connection.

use std::collections::HashMap;
use std::sync::Mutex;

use cpool_pool::WantedState;
use cpool_proto::{Blob, DatabaseState, Preamble};

#[derive(Default)]
struct Cache {
	dbs: HashMap<String, DatabaseState>,
	global_schema_pickle: Option<Blob>,
	system_config: Option<Blob>,
}

pub(crate) struct PreambleCache {
	cache: Mutex<Cache>,
}

impl PreambleCache {
	pub(crate) fn new() -> Self {
		Self {
			cache: Mutex::new(Cache::default()),
		}
	}

	/// Forget everything cached, as if talking to a brand new worker.
	pub(crate) fn reset(&self) {
		*self.cache.lock().unwrap() = Cache::default();
	}

	pub(crate) fn compute_preamble(&self, dbname: Option<&str>, wanted: &WantedState) -> Preamble {
		let g = self.cache.lock().unwrap();
		let db = dbname.and_then(|n| g.dbs.get(n));
		Preamble {
			user_schema_pickle: diff_field(wanted.user_schema_pickle.as_ref(), db.map(|d| &d.user_schema_pickle)),
			reflection_cache: diff_field(wanted.reflection_cache.as_ref(), db.map(|d| &d.reflection_cache)),
			database_config: diff_field(wanted.database_config.as_ref(), db.map(|d| &d.database_config)),
			global_schema_pickle: diff_field(wanted.global_schema_pickle.as_ref(), g.global_schema_pickle.as_ref()),
			system_config: diff_field(wanted.system_config.as_ref(), g.system_config.as_ref()),
		}
	}

	pub(crate) fn record_applied(&self, dbname: Option<&str>, wanted: &WantedState) {
		let mut g = self.cache.lock().unwrap();
		if let Some(blob) = &wanted.global_schema_pickle {
			g.global_schema_pickle = Some(blob.clone());
		}
		if let Some(blob) = &wanted.system_config {
			g.system_config = Some(blob.clone());
		}
		let Some(dbname) = dbname else { return };

		let user = wanted
			.user_schema_pickle
			.clone()
			.or_else(|| g.dbs.get(dbname).map(|d| d.user_schema_pickle.clone()));
		let refl = wanted
			.reflection_cache
			.clone()
			.or_else(|| g.dbs.get(dbname).map(|d| d.reflection_cache.clone()));
		let cfg = wanted
			.database_config
			.clone()
			.or_else(|| g.dbs.get(dbname).map(|d| d.database_config.clone()));

		if let (Some(user_schema_pickle), Some(reflection_cache), Some(database_config)) = (user, refl, cfg) {
			g.dbs.insert(
				dbname.to_string(),
				DatabaseState {
					user_schema_pickle,
					reflection_cache,
					database_config,
				},
			);
		}
	}
}

fn diff_field(wanted: Option<&Blob>, cached: Option<&Blob>) -> Option<Blob> {
	match (wanted, cached) {
		(Some(w), Some(c)) if w.same_as(c) => None,
		(Some(w), _) => Some(w.clone()),
		(None, _) => None,
	}
}
