use serde::{Deserialize, Serialize};

use crate::blob::Blob;

/// Sent once, first thing on a freshly-(re)connected client-to-broker
/// connection (spec §4.7 remote pool, §4.8 multi-tenant broker): the
/// client's catalog version and init arguments the far side needs before it
/// will accept any compile call.
///
/// The far side answers with the ordinary [`crate::Reply`] enum —
/// `Success` for accepted, `Error { code: ErrorCode::IncompatibleClient,
/// .. }` when the catalog version or backend params don't match what it
/// already committed to for an earlier client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitRequest {
	pub catalog_version: u64,
	pub std_args: Blob,
	pub client_args: Blob,
	pub global_schema_pickle: Blob,
	pub system_config: Blob,
}
