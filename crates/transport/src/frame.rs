//! Wire-level framing: `[u64 be length N including the request id][u64 be
//! request id][N-8 bytes payload]`, identical in both directions. The very
//! first bytes a worker sends on connect are a bare `u64 be` process id —
//! no length prefix, no request id — read once before switching the
//! connection into framed mode.

use cpool_proto::RequestId;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::TransportError;

/// Default ceiling on a single frame's declared length, matching the
/// teacher's own sanity check on incoming frames
/// (`crates/broker/proto/src/protocol.rs`). A peer that claims a longer
/// frame has the connection closed under it rather than being trusted to
/// eventually stop sending.
pub const DEFAULT_MAX_FRAME_LEN: u64 = 64 * 1024 * 1024;

/// Read the bare process-id handshake value: a single `u64 be`, no length
/// prefix, no request id.
pub async fn read_handshake<R: AsyncRead + Unpin>(reader: &mut R) -> Result<u64, TransportError> {
	Ok(reader.read_u64().await?)
}

/// Write the bare process-id handshake value.
pub async fn write_handshake<W: AsyncWrite + Unpin>(
	writer: &mut W,
	pid: u64,
) -> Result<(), TransportError> {
	writer.write_u64(pid).await?;
	writer.flush().await?;
	Ok(())
}

/// Read one framed `(request_id, payload)` message, buffering partial
/// frames until complete.
pub async fn read_frame<R: AsyncRead + Unpin>(
	reader: &mut R,
	max_frame_len: u64,
) -> Result<(RequestId, Vec<u8>), TransportError> {
	let len = reader.read_u64().await?;
	if len < 8 {
		return Err(TransportError::HandshakeFailed);
	}
	if len > max_frame_len {
		return Err(TransportError::FrameTooLarge {
			len,
			max: max_frame_len,
		});
	}
	let request_id = reader.read_u64().await?;
	let payload_len = (len - 8) as usize;
	let mut payload = vec![0u8; payload_len];
	reader.read_exact(&mut payload).await?;
	Ok((RequestId(request_id), payload))
}

/// Write one framed `(request_id, payload)` message.
pub async fn write_frame<W: AsyncWrite + Unpin>(
	writer: &mut W,
	request_id: RequestId,
	payload: &[u8],
) -> Result<(), TransportError> {
	let len = 8u64 + payload.len() as u64;
	writer.write_u64(len).await?;
	writer.write_u64(request_id.0).await?;
	writer.write_all(payload).await?;
	writer.flush().await?;
	Ok(())
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn frame_round_trip() {
		let mut buf = Vec::new();
		write_frame(&mut buf, RequestId(42), b"hello").await.unwrap();

		let mut cursor = std::io::Cursor::new(buf);
		let (id, payload) = read_frame(&mut cursor, DEFAULT_MAX_FRAME_LEN).await.unwrap();
		assert_eq!(id, RequestId(42));
		assert_eq!(payload, b"hello");
	}

	#[tokio::test]
	async fn one_byte_at_a_time_yields_exactly_one_event() {
		let mut buf = Vec::new();
		write_frame(&mut buf, RequestId(7), b"payload-bytes").await.unwrap();

		// Feed the decoder a byte-at-a-time reader; it must still produce
		// exactly one complete frame and nothing else.
		struct OneByteAtATime(std::io::Cursor<Vec<u8>>);
		impl AsyncRead for OneByteAtATime {
			fn poll_read(
				mut self: std::pin::Pin<&mut Self>,
				cx: &mut std::task::Context<'_>,
				buf: &mut tokio::io::ReadBuf<'_>,
			) -> std::task::Poll<std::io::Result<()>> {
				let mut one = [0u8; 1];
				let mut tiny = tokio::io::ReadBuf::new(&mut one);
				match std::pin::Pin::new(&mut self.0).poll_read(cx, &mut tiny) {
					std::task::Poll::Ready(Ok(())) => {
						let filled = tiny.filled();
						if !filled.is_empty() {
							buf.put_slice(filled);
						}
						std::task::Poll::Ready(Ok(()))
					}
					other => other,
				}
			}
		}

		let mut reader = OneByteAtATime(std::io::Cursor::new(buf));
		let (id, payload) = read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN).await.unwrap();
		assert_eq!(id, RequestId(7));
		assert_eq!(payload, b"payload-bytes");

		// Nothing left to read: EOF on the next frame attempt.
		let err = read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN).await;
		assert!(err.is_err());
	}

	#[tokio::test]
	async fn oversized_frame_is_rejected() {
		let mut buf = Vec::new();
		write_frame(&mut buf, RequestId(1), &vec![0u8; 100]).await.unwrap();

		let mut cursor = std::io::Cursor::new(buf);
		let err = read_frame(&mut cursor, 16).await.unwrap_err();
		assert!(matches!(err, TransportError::FrameTooLarge { .. }));
	}

	#[tokio::test]
	async fn handshake_has_no_length_prefix() {
		let mut buf = Vec::new();
		write_handshake(&mut buf, 12345).await.unwrap();
		assert_eq!(buf.len(), 8);

		let mut cursor = std::io::Cursor::new(buf);
		let pid = read_handshake(&mut cursor).await.unwrap();
		assert_eq!(pid, 12345);
	}
}
