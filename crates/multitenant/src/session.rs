//! Monotonic `client_id` assignment plus the "first client sets the shared
//! catalog, every later one must match it" gate (spec §4.8
//! `__init_server__`), grounded in `RemotePool`/broker-side init handling
//! already established for `cpool-pool-remote`, generalized here to many
//! concurrent clients instead of one.

use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use cpool_proto::{Blob, ClientId, InitRequest};

struct Committed {
	catalog_version: u64,
	std_args: Blob,
	client_args: Blob,
}

/// Shared state every accepted client connection checks its `InitRequest`
/// against. The first client to arrive commits it; every later client's
/// catalog version and backend args must match by identity or it is
/// rejected with `IncompatibleClient` (spec §4.8) — global schema and
/// system config are per-tenant in multi-tenant mode and are *not* part of
/// this gate, unlike the single-connection `cpool-pool-remote` handshake.
pub struct ClientRegistry {
	next_id: AtomicU64,
	committed: Mutex<Option<Committed>>,
}

impl Default for ClientRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl ClientRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self {
			next_id: AtomicU64::new(1),
			committed: Mutex::new(None),
		}
	}

	#[must_use]
	pub fn next_client_id(&self) -> ClientId {
		ClientId(self.next_id.fetch_add(1, Ordering::Relaxed))
	}

	/// Validate `req` against whatever an earlier client already committed,
	/// or commit it as the first. `Err(message)` means the caller should
	/// reply `IncompatibleClient` and close the connection without ever
	/// accepting a compile call on it.
	pub fn admit(&self, req: &InitRequest) -> Result<(), String> {
		let mut committed = self.committed.lock().unwrap();
		match committed.as_ref() {
			None => {
				*committed = Some(Committed {
					catalog_version: req.catalog_version,
					std_args: req.std_args.clone(),
					client_args: req.client_args.clone(),
				});
				Ok(())
			}
			Some(existing) => {
				if existing.catalog_version != req.catalog_version {
					return Err(format!(
						"catalog version mismatch: broker committed to {}, client sent {}",
						existing.catalog_version, req.catalog_version
					));
				}
				if !existing.std_args.same_as(&req.std_args) || !existing.client_args.same_as(&req.client_args) {
					return Err("backend init arguments do not match the broker's committed client".to_string());
				}
				Ok(())
			}
		}
	}
}
