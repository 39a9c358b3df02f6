//! Unix-socket bind/connect helpers shared by the pool's server side
//! (accepting worker/client connections) and its client side (a worker
//! connecting to the pool, or the multi-tenant broker's inner pool).

use std::path::Path;

use tokio::net::{UnixListener, UnixStream};

/// Bind a Unix listener at `path`, removing a stale socket file left
/// behind by a previous run.
pub async fn bind(path: impl AsRef<Path>) -> std::io::Result<UnixListener> {
	let path = path.as_ref();
	if path.exists() {
		tokio::fs::remove_file(path).await?;
	}
	if let Some(parent) = path.parent() {
		tokio::fs::create_dir_all(parent).await?;
	}
	UnixListener::bind(path)
}

/// Connect to a Unix socket at `path`.
pub async fn connect(path: impl AsRef<Path>) -> std::io::Result<UnixStream> {
	UnixStream::connect(path).await
}
