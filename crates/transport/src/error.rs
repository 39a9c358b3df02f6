use thiserror::Error;

/// Transport-layer failures. The transport itself never retries; every
/// variant here is surfaced to the caller as-is, distinguished from
/// domain-level errors carried *inside* a successfully delivered frame.
#[derive(Debug, Error)]
pub enum TransportError {
	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	/// A frame's declared length exceeded the configured maximum. The
	/// connection is closed rather than buffering an unbounded amount from
	/// a misbehaving or hostile peer.
	#[error("frame of {len} bytes exceeds the {max} byte limit")]
	FrameTooLarge { len: u64, max: u64 },

	/// The connection closed (or was never usable) while requests were
	/// outstanding. Never retried by this layer; callers above decide
	/// whether to retry.
	#[error("connection lost")]
	ConnectionLost,

	/// The peer's handshake did not look like a valid process identity.
	#[error("handshake failed")]
	HandshakeFailed,
}
