use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// An opaque, pool-never-inspects byte sequence moved between pool and
/// worker: a pickled schema, a config blob, a transaction state.
///
/// Identity, not content, is what the pool reasons about: the same `Blob`
/// handed back to the pool a second time must compare equal to itself even
/// before either side looks at a single byte. [`Blob::same_as`] is the only
/// comparison the pool ever performs; bytewise equality is never used to
/// decide whether a state-sync preamble needs to resend a field.
#[derive(Debug, Clone)]
pub struct Blob {
	bytes: Arc<[u8]>,
	generation: u64,
}

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

impl Blob {
	/// Wrap `bytes` as a new blob with a fresh, process-local generation.
	///
	/// Two blobs built from identical bytes via two separate calls to this
	/// constructor are *not* [`Blob::same_as`] each other — generation, not
	/// content, is identity.
	#[must_use]
	pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
		let generation = NEXT_GENERATION.fetch_add(1, Ordering::Relaxed);
		Self {
			bytes: bytes.into(),
			generation,
		}
	}

	#[must_use]
	pub fn bytes(&self) -> &[u8] {
		&self.bytes
	}

	#[must_use]
	pub fn generation(&self) -> u64 {
		self.generation
	}

	/// Whether `self` and `other` are the same blob by identity.
	///
	/// This is a generation comparison, never a byte comparison: cloning a
	/// `Blob` (an `Arc` clone) preserves its generation, so a round-tripped
	/// clone is always `same_as` its source.
	#[must_use]
	pub fn same_as(&self, other: &Blob) -> bool {
		self.generation == other.generation
	}
}

/// A sentinel [`Blob`] substituted for a transaction state blob to tell a
/// worker "apply the state you already hold" instead of retransmitting it.
///
/// Implementation choice (spec leaves the exact bytes undefined): a fixed
/// generation of `u64::MAX`, unreachable by [`Blob::new`]'s counter, paired
/// with empty bytes. A worker observing non-empty bytes alongside this
/// generation is a contradiction that never arises because the marker is
/// never constructed any other way.
pub static REUSE_LAST_STATE_MARKER: LazyLock<Blob> = LazyLock::new(|| Blob {
	bytes: Arc::from(Vec::new().into_boxed_slice()),
	generation: u64::MAX,
});

impl PartialEq for Blob {
	fn eq(&self, other: &Self) -> bool {
		self.same_as(other)
	}
}
impl Eq for Blob {}

/// A scoped generation counter, for tests or embedders that want blob
/// identity isolated from the process-wide counter (e.g. two in-process
/// pool instances in the same test binary whose generations must not be
/// compared across pools).
#[derive(Debug, Default)]
pub struct BlobGenerator {
	next: AtomicU64,
}

impl BlobGenerator {
	#[must_use]
	pub fn new() -> Self {
		Self { next: AtomicU64::new(1) }
	}

	#[must_use]
	pub fn wrap(&self, bytes: impl Into<Arc<[u8]>>) -> Blob {
		let generation = self.next.fetch_add(1, Ordering::Relaxed);
		Blob {
			bytes: bytes.into(),
			generation,
		}
	}
}

/// On the wire only the bytes travel; a deserialized `Blob` always gets a
/// fresh generation since it represents newly-arrived data, not an existing
/// identity.
impl Serialize for Blob {
	fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
		serde_bytes_slice(&self.bytes, serializer)
	}
}

impl<'de> Deserialize<'de> for Blob {
	fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
		let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
		Ok(Blob::new(bytes))
	}
}

fn serde_bytes_slice<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
	serializer.serialize_bytes(bytes)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn identical_bytes_are_not_same_as_by_default() {
		let a = Blob::new(vec![1, 2, 3]);
		let b = Blob::new(vec![1, 2, 3]);
		assert!(!a.same_as(&b));
	}

	#[test]
	fn clone_preserves_identity() {
		let a = Blob::new(vec![1, 2, 3]);
		let b = a.clone();
		assert!(a.same_as(&b));
	}

	#[test]
	fn scoped_generator_is_independent() {
		let gen_a = BlobGenerator::new();
		let gen_b = BlobGenerator::new();
		let a = gen_a.wrap(vec![9]);
		let b = gen_b.wrap(vec![9]);
		// Both start their counters at 1; this is intentionally allowed to
		// collide numerically across independent generators, but a caller
		// that always compares within one generator's output never sees it.
		assert_eq!(a.generation(), b.generation());
	}
}
