//! A multiplexing request/response client over one framed connection.
//!
//! Several independent calls may be in flight on the same connection at
//! once (the remote pool bounds this with a semaphore upstream); replies
//! are matched back to their caller by request id regardless of arrival
//! order. A caller that stops awaiting its call (cancellation) is not an
//! error here: its pending-reply slot is released so a late reply, when it
//! arrives, is dropped silently as a reply to an unknown request id —
//! exactly the same path a genuinely mismatched id takes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use cpool_proto::RequestId;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex as AsyncMutex, oneshot};

use crate::error::TransportError;
use crate::frame::{self, DEFAULT_MAX_FRAME_LEN};

type PendingMap = Arc<StdMutex<HashMap<RequestId, oneshot::Sender<Result<Vec<u8>, TransportError>>>>>;

/// A connection that can send framed requests and demultiplex their
/// replies, independent of the direction byte frames actually travel in —
/// both a pool talking to a worker and a remote pool talking to a broker
/// use this type.
pub struct Client<W> {
	next_id: AtomicU64,
	pending: PendingMap,
	writer: AsyncMutex<W>,
	closed: Arc<AtomicBool>,
}

struct PendingGuard {
	pending: PendingMap,
	id: RequestId,
}

impl Drop for PendingGuard {
	fn drop(&mut self) {
		self.pending.lock().unwrap().remove(&self.id);
	}
}

impl<W> Client<W>
where
	W: AsyncWrite + Unpin + Send + 'static,
{
	/// Start a client over an already-connected `reader`/`writer` pair. The
	/// handshake, if any, must already have been exchanged by the caller —
	/// this spawns the frame-demuxing reader task and returns immediately.
	pub fn new<R>(reader: R, writer: W, max_frame_len: u64) -> Arc<Self>
	where
		R: AsyncRead + Unpin + Send + 'static,
	{
		let pending: PendingMap = Arc::new(StdMutex::new(HashMap::new()));
		let closed = Arc::new(AtomicBool::new(false));
		let client = Arc::new(Self {
			next_id: AtomicU64::new(1),
			pending: pending.clone(),
			writer: AsyncMutex::new(writer),
			closed: closed.clone(),
		});
		tokio::spawn(reader_loop(reader, pending, closed, max_frame_len));
		client
	}

	/// Start a client with the default max frame length.
	pub fn with_defaults<R>(reader: R, writer: W) -> Arc<Self>
	where
		R: AsyncRead + Unpin + Send + 'static,
	{
		Self::new(reader, writer, DEFAULT_MAX_FRAME_LEN)
	}

	#[must_use]
	pub fn is_closed(&self) -> bool {
		self.closed.load(Ordering::Acquire)
	}

	/// Send `payload` as a new request and await its matched reply.
	///
	/// Dropping the returned future before it resolves releases the pending
	/// slot; the worker may still complete the call, but the reply is
	/// dropped silently on arrival rather than delivered anywhere.
	pub async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
		if self.is_closed() {
			return Err(TransportError::ConnectionLost);
		}
		let id = RequestId(self.next_id.fetch_add(1, Ordering::Relaxed));
		let (tx, rx) = oneshot::channel();
		self.pending.lock().unwrap().insert(id, tx);
		let _guard = PendingGuard {
			pending: self.pending.clone(),
			id,
		};

		{
			let mut w = self.writer.lock().await;
			frame::write_frame(&mut *w, id, payload).await?;
		}

		match rx.await {
			Ok(result) => result,
			Err(_) => Err(TransportError::ConnectionLost),
		}
	}
}

async fn reader_loop<R>(mut reader: R, pending: PendingMap, closed: Arc<AtomicBool>, max_frame_len: u64)
where
	R: AsyncRead + Unpin,
{
	loop {
		match frame::read_frame(&mut reader, max_frame_len).await {
			Ok((id, payload)) => {
				let waiter = pending.lock().unwrap().remove(&id);
				match waiter {
					Some(tx) => {
						let _ = tx.send(Ok(payload));
					}
					None => {
						tracing::debug!(request_id = id.0, "dropping reply for unmatched request id");
					}
				}
			}
			Err(err) => {
				tracing::debug!(error = %err, "transport connection lost");
				closed.store(true, Ordering::Release);
				let mut map = pending.lock().unwrap();
				for (_, tx) in map.drain() {
					let _ = tx.send(Err(TransportError::ConnectionLost));
				}
				break;
			}
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::duplex;

	use super::*;

	#[tokio::test]
	async fn call_matches_reply_by_id() {
		let (client_half, server_half) = duplex(4096);
		let (client_read, client_write) = tokio::io::split(client_half);
		let client = Client::with_defaults(client_read, client_write);

		let (mut server_read, mut server_write) = tokio::io::split(server_half);
		tokio::spawn(async move {
			let (id, payload) = frame::read_frame(&mut server_read, DEFAULT_MAX_FRAME_LEN)
				.await
				.unwrap();
			let mut echoed = payload;
			echoed.push(b'!');
			frame::write_frame(&mut server_write, id, &echoed).await.unwrap();
		});

		let reply = client.call(b"ping").await.unwrap();
		assert_eq!(reply, b"ping!");
	}

	#[tokio::test]
	async fn dropped_connection_fails_outstanding_calls() {
		let (client_half, server_half) = duplex(4096);
		let (client_read, client_write) = tokio::io::split(client_half);
		let client = Client::with_defaults(client_read, client_write);
		drop(server_half);

		let err = client.call(b"anything").await.unwrap_err();
		assert!(matches!(err, TransportError::ConnectionLost));
	}
}
