use serde::{Deserialize, Serialize};

/// Sender-chosen identifier echoed by the receiver in its reply frame.
///
/// Mismatched or late replies (the request they answered was cancelled or
/// timed out) are dropped silently by the transport rather than surfaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Tags the most recent transactional-state blob a worker is holding.
///
/// `0` means "no state / reset". Wraps at `2^63 - 1` per the source
/// behavior this crate preserves (see spec DESIGN NOTES); the pool never
/// interprets the blob a `StateId` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateId(pub u64);

const STATE_ID_WRAP: u64 = (1u64 << 63) - 1;

impl StateId {
	pub const NONE: StateId = StateId(0);

	#[must_use]
	pub fn next(self) -> StateId {
		let n = self.0 + 1;
		StateId(if n > STATE_ID_WRAP { 1 } else { n })
	}
}

/// Monotonic identifier the multi-tenant broker assigns to each accepted
/// client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ClientId(pub u64);
