//! Per-call authentication of the client-to-broker connection (spec §4.8:
//! "exposes §4.1 framing plus the HMAC prefix"), grounded in
//! `RemoteWorker._request`'s `hmac.digest(secret, msg, "sha256")` framing
//! from the original pool, but split out of the pool-to-broker protocol
//! entirely — see `cpool-pool-remote`'s `DESIGN.md` entry for why that
//! crate carries none of this.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

pub const MAC_LEN: usize = 32;

/// The shared secret every accepted client connection is authenticated
/// against. Absence of a configured secret is a fatal broker
/// misconfiguration (spec §6); this type carries the bytes once resolved,
/// never the decision of whether they were supplied.
#[derive(Clone)]
pub struct SharedSecret(Vec<u8>);

impl SharedSecret {
	#[must_use]
	pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
		Self(bytes.into())
	}

	/// Prefix `payload` with its HMAC-SHA256 tag, for a pool-side client
	/// authenticating itself to the broker.
	#[must_use]
	pub fn sign(&self, payload: &[u8]) -> Vec<u8> {
		let tag = self.tag(payload);
		let mut framed = Vec::with_capacity(MAC_LEN + payload.len());
		framed.extend_from_slice(&tag);
		framed.extend_from_slice(payload);
		framed
	}

	/// Split a signed frame into its payload, verifying the tag first.
	/// Comparison is constant-time: a broker that leaks tag-comparison
	/// timing would hand an attacker a byte-at-a-time forgery oracle.
	pub fn verify<'a>(&self, framed: &'a [u8]) -> Result<&'a [u8], HmacError> {
		if framed.len() < MAC_LEN {
			return Err(HmacError::Truncated);
		}
		let (tag, payload) = framed.split_at(MAC_LEN);
		let expected = self.tag(payload);
		if expected.ct_eq(tag).into() {
			Ok(payload)
		} else {
			Err(HmacError::Mismatch)
		}
	}

	fn tag(&self, payload: &[u8]) -> [u8; MAC_LEN] {
		let mut mac = HmacSha256::new_from_slice(&self.0).expect("HMAC accepts a key of any length");
		mac.update(payload);
		mac.finalize().into_bytes().into()
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HmacError {
	#[error("frame shorter than the HMAC prefix")]
	Truncated,
	#[error("HMAC tag mismatch")]
	Mismatch,
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn round_trips_a_correctly_signed_frame() {
		let secret = SharedSecret::new(b"sekrit".to_vec());
		let framed = secret.sign(b"hello");
		assert_eq!(secret.verify(&framed).unwrap(), b"hello");
	}

	#[test]
	fn wrong_secret_is_rejected() {
		let a = SharedSecret::new(b"a".to_vec());
		let b = SharedSecret::new(b"b".to_vec());
		let framed = a.sign(b"hello");
		assert_eq!(b.verify(&framed), Err(HmacError::Mismatch));
	}

	#[test]
	fn truncated_frame_is_rejected() {
		let secret = SharedSecret::new(b"sekrit".to_vec());
		assert_eq!(secret.verify(&[0u8; 4]), Err(HmacError::Truncated));
	}

	#[test]
	fn tampered_payload_is_rejected() {
		let secret = SharedSecret::new(b"sekrit".to_vec());
		let mut framed = secret.sign(b"hello");
		*framed.last_mut().unwrap() ^= 0xff;
		assert_eq!(secret.verify(&framed), Err(HmacError::Mismatch));
	}
}
