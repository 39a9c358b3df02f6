//! The pool's cached view of one live worker process (spec §3 `WorkerView`).
//!
//! `WorkerView` mirrors, on the pool side, what the worker agent is believed
//! to hold: enough to compute a state-sync preamble without asking the
//! worker first. It is never authoritative — a `FailedStateSync` reply
//! means the pool's belief was wrong and it must not update its cache from
//! that call.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Instant;

use cpool_proto::{Blob, DatabaseState, Preamble, StateId};

use crate::transport::WorkerTransport;

/// The compare-by-identity fields a caller supplies for one compile
/// request, before the pool has diffed them against a candidate worker.
#[derive(Debug, Clone, Default)]
pub struct WantedState {
	pub user_schema_pickle: Option<Blob>,
	pub reflection_cache: Option<Blob>,
	pub database_config: Option<Blob>,
	pub global_schema_pickle: Option<Blob>,
	pub system_config: Option<Blob>,
}

struct Cache {
	dbs: HashMap<String, DatabaseState>,
	global_schema_pickle: Option<Blob>,
	system_config: Option<Blob>,
	last_tx_state_id: StateId,
	last_used: Instant,
	closed: bool,
}

/// A pool's handle on one worker process: its call channel plus the pool's
/// cached belief about what state that worker currently holds.
pub struct WorkerView {
	pub pid: u64,
	transport: Arc<dyn WorkerTransport>,
	cache: Mutex<Cache>,
}

impl WorkerView {
	#[must_use]
	pub fn new(pid: u64, transport: Arc<dyn WorkerTransport>) -> Self {
		Self {
			pid,
			transport,
			cache: Mutex::new(Cache {
				dbs: HashMap::new(),
				global_schema_pickle: None,
				system_config: None,
				last_tx_state_id: StateId::NONE,
				last_used: Instant::now(),
				closed: false,
			}),
		}
	}

	pub(crate) fn transport(&self) -> &Arc<dyn WorkerTransport> {
		&self.transport
	}

	#[must_use]
	pub fn last_tx_state_id(&self) -> StateId {
		self.cache.lock().unwrap().last_tx_state_id
	}

	pub(crate) fn set_last_tx_state_id(&self, id: StateId) {
		self.cache.lock().unwrap().last_tx_state_id = id;
	}

	#[must_use]
	pub fn last_used(&self) -> Instant {
		self.cache.lock().unwrap().last_used
	}

	pub(crate) fn touch(&self) {
		self.cache.lock().unwrap().last_used = Instant::now();
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.cache.lock().unwrap().closed || self.transport.is_closed()
	}

	pub(crate) fn mark_closed(&self) {
		self.cache.lock().unwrap().closed = true;
	}

	/// Diff `wanted` against this worker's cached view for `dbname`,
	/// producing a [`Preamble`] with nil placeholders for every field that
	/// already matches by [`Blob::same_as`].
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

	/// Record that `wanted` was successfully applied by the worker: fold it
	/// into the cached view so the next call's preamble can omit it again.
	/// Never called after a `FailedStateSync` reply — the pool's belief
	/// about this worker is left exactly as it was before the call.
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

#[cfg(test)]
mod tests {
	use async_trait::async_trait;
	use cpool_transport::TransportError;

	use super::*;

	struct DeadTransport;
	#[async_trait]
	impl WorkerTransport for DeadTransport {
		async fn call(&self, _payload: &[u8]) -> Result<Vec<u8>, TransportError> {
			Err(TransportError::ConnectionLost)
		}
		fn is_closed(&self) -> bool {
			false
		}
	}

	fn view() -> WorkerView {
		WorkerView::new(1, Arc::new(DeadTransport))
	}

	#[test]
	fn first_preamble_for_unseen_db_sends_everything_supplied() {
		let w = view();
		let wanted = WantedState {
			user_schema_pickle: Some(Blob::new(b"u".to_vec())),
			reflection_cache: Some(Blob::new(b"r".to_vec())),
			database_config: Some(Blob::new(b"c".to_vec())),
			..Default::default()
		};
		let preamble = w.compute_preamble(Some("d"), &wanted);
		assert!(preamble.user_schema_pickle.is_some());
		assert!(preamble.reflection_cache.is_some());
		assert!(preamble.database_config.is_some());
	}

	#[test]
	fn second_preamble_omits_fields_unchanged_by_identity() {
		let w = view();
		let user = Blob::new(b"u".to_vec());
		let wanted = WantedState {
			user_schema_pickle: Some(user.clone()),
			reflection_cache: Some(Blob::new(b"r".to_vec())),
			database_config: Some(Blob::new(b"c".to_vec())),
			..Default::default()
		};
		w.record_applied(Some("d"), &wanted);

		let second = WantedState {
			user_schema_pickle: Some(user),
			..wanted
		};
		let preamble = w.compute_preamble(Some("d"), &second);
		assert!(preamble.is_unchanged());
	}

	#[test]
	fn changed_identity_is_resent() {
		let w = view();
		let wanted = WantedState {
			user_schema_pickle: Some(Blob::new(b"u".to_vec())),
			reflection_cache: Some(Blob::new(b"r".to_vec())),
			database_config: Some(Blob::new(b"c".to_vec())),
			..Default::default()
		};
		w.record_applied(Some("d"), &wanted);

		let changed = WantedState {
			user_schema_pickle: Some(Blob::new(b"u2".to_vec())),
			..wanted
		};
		let preamble = w.compute_preamble(Some("d"), &changed);
		assert!(preamble.user_schema_pickle.is_some());
		assert!(preamble.reflection_cache.is_none());
		assert!(preamble.database_config.is_none());
	}
}
