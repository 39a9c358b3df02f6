//! A type-erased seam over [`cpool_transport::Client`] so [`crate::WorkerView`]
//! does not need to carry the reader/writer type parameters of whatever
//! concrete socket (Unix, in-memory duplex, TCP for the remote pool) backs
//! it.

use async_trait::async_trait;
use cpool_transport::TransportError;
use tokio::io::AsyncWrite;

/// One worker process's call channel, as seen by the pool.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
	async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError>;

	/// Whether the underlying connection is known to be gone. A worker view
	/// observed closed is never returned to the idle queue.
	fn is_closed(&self) -> bool;
}

#[async_trait]
impl<W> WorkerTransport for cpool_transport::Client<W>
where
	W: AsyncWrite + Unpin + Send + 'static,
{
	async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
		cpool_transport::Client::call(self, payload).await
	}

	fn is_closed(&self) -> bool {
		cpool_transport::Client::is_closed(self)
	}
}
