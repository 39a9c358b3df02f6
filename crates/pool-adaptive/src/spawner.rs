//! Spawning and waiting on individual worker processes, abstracted behind
//! a trait so tests can stand in an in-process fake — the same shape as
//! `cpool-pool-fixed`'s `TemplateLauncher`/`TemplateHandle` split, scaled
//! down to one worker instead of a template supervising `numproc` of them.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

/// Spawns one worker process that connects to this pool's socket.
#[async_trait]
pub trait WorkerSpawner: Send + Sync + 'static {
	/// Spawn a worker, returning its pid (so the pool can correlate the
	/// handshake it gets back with this process) and a handle to wait on
	/// or kill it.
	async fn spawn(&self, socket_path: &Path) -> std::io::Result<(u64, Box<dyn WorkerHandle>)>;
}

/// A handle on one running worker process, real or faked.
#[async_trait]
pub trait WorkerHandle: Send {
	/// Resolve once the worker process has exited, for any reason.
	async fn wait(&mut self) -> std::io::Result<()>;

	/// Terminate the worker without waiting for a natural exit.
	async fn kill(&mut self);
}

/// Spawns the real `bin/worker` binary as a child process, directly (no
/// template indirection — spec §4.6 starts adaptive workers this way).
pub struct ProcessWorkerSpawner {
	pub worker_bin: PathBuf,
}

impl ProcessWorkerSpawner {
	#[must_use]
	pub fn new(worker_bin: impl Into<PathBuf>) -> Self {
		Self {
			worker_bin: worker_bin.into(),
		}
	}
}

#[async_trait]
impl WorkerSpawner for ProcessWorkerSpawner {
	async fn spawn(&self, socket_path: &Path) -> std::io::Result<(u64, Box<dyn WorkerHandle>)> {
		let child = Command::new(&self.worker_bin)
			.arg("--sockname")
			.arg(socket_path)
			.kill_on_drop(true)
			.spawn()?;
		let pid = child
			.id()
			.ok_or_else(|| std::io::Error::other("worker process exited before reporting a pid"))? as u64;
		Ok((pid, Box::new(ProcessWorkerHandle { child })))
	}
}

struct ProcessWorkerHandle {
	child: tokio::process::Child,
}

#[async_trait]
impl WorkerHandle for ProcessWorkerHandle {
	async fn wait(&mut self) -> std::io::Result<()> {
		let status = self.child.wait().await?;
		tracing::info!(?status, "compiler worker process exited");
		Ok(())
	}

	async fn kill(&mut self) {
		let _ = self.child.kill().await;
	}
}
