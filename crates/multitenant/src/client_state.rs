//! Reconstructs one client connection's full identity-tagged schema state
//! from the stream of preambles it sends, so the broker can diff a *full*
//! [`WantedState`] against each worker's own belief instead of forwarding
//! the client's already-diffed preamble as-is (different workers may hold
//! different subsets of that client's schema).
//!
//! Grounded directly on `cpool_worker::Agent`'s
//! `apply_global_preamble`/`apply_db_preamble`: same fold-preamble-onto-
//! cached-identity shape, same `Err(())` on a partially seeded database
//! preamble. Owned by one connection's task, so no internal locking is
//! needed — unlike `Agent`, which is shared across concurrent calls.

use std::collections::HashMap;

use cpool_pool::WantedState;
use cpool_proto::{DatabaseState, Preamble};

#[derive(Default)]
pub(crate) struct ClientMaterializer {
	global_schema_pickle: Option<cpool_proto::Blob>,
	system_config: Option<cpool_proto::Blob>,
	dbs: HashMap<String, DatabaseState>,
}

impl ClientMaterializer {
	pub(crate) fn new() -> Self {
		Self::default()
	}

	/// Fold `preamble` into this client's materialized state and return the
	/// full [`WantedState`] to hand to [`crate::broker_pool::BrokerPool`].
	/// `Err(())` means the database portion of the preamble is only
	/// partially seeded — a protocol violation the caller must surface as
	/// `FailedStateSync`.
	pub(crate) fn apply(&mut self, dbname: Option<&str>, preamble: &Preamble) -> Result<WantedState, ()> {
		if let Some(blob) = &preamble.global_schema_pickle {
			self.global_schema_pickle = Some(blob.clone());
		}
		if let Some(blob) = &preamble.system_config {
			self.system_config = Some(blob.clone());
		}

		let db_state = match dbname {
			None => None,
			Some(dbname) => {
				let existing = self.dbs.get(dbname);
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
						self.dbs.insert(dbname.to_string(), state.clone());
						Some(state)
					}
					(None, None, None) => existing.cloned(),
					_ => return Err(()),
				}
			}
		};

		Ok(WantedState {
			user_schema_pickle: db_state.as_ref().map(|s| s.user_schema_pickle.clone()),
			reflection_cache: db_state.as_ref().map(|s| s.reflection_cache.clone()),
			database_config: db_state.as_ref().map(|s| s.database_config.clone()),
			global_schema_pickle: self.global_schema_pickle.clone(),
			system_config: self.system_config.clone(),
		})
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use cpool_proto::Blob;

	#[test]
	fn first_preamble_for_a_db_requires_all_three_fields() {
		let mut m = ClientMaterializer::new();
		let partial = Preamble {
			user_schema_pickle: Some(Blob::new(b"u".to_vec())),
			..Default::default()
		};
		assert!(m.apply(Some("d"), &partial).is_err());
	}

	#[test]
	fn unchanged_preamble_reuses_materialized_state() {
		let mut m = ClientMaterializer::new();
		let full = Preamble {
			user_schema_pickle: Some(Blob::new(b"u".to_vec())),
			reflection_cache: Some(Blob::new(b"r".to_vec())),
			database_config: Some(Blob::new(b"c".to_vec())),
			..Default::default()
		};
		m.apply(Some("d"), &full).unwrap();

		let wanted = m.apply(Some("d"), &Preamble::unchanged()).unwrap();
		assert_eq!(wanted.user_schema_pickle.unwrap().bytes(), b"u");
	}
}
