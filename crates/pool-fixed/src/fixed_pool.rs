//! The fixed pool itself: accepts worker connections on a Unix socket,
//! gates them by version-serial against whichever template is current,
//! and restarts the template after it exits (spec §4.5, grounded in
//! `BaseLocalPool`/`FixedPool` from `pool.py`).
//!
//! The original forks `pool_size` worker children directly from the
//! template process. Forking is unsound once a multi-threaded tokio
//! runtime is involved, so here the template is its own process
//! (`bin/template`) that spawns `pool_size` worker subprocesses with
//! `tokio::process::Command` instead of `fork()` — the supervision shape
//! is the same, only the mechanism changes.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpool_pool::{Pool, WorkerView};
use cpool_transport::Client;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use crate::launcher::TemplateLauncher;

struct State {
	/// Version-serial of the template currently being spawned/supervised.
	/// A worker handshaking with a lower value belongs to a superseded
	/// template and is rejected.
	current_version: u64,
	live_by_version: HashMap<u64, usize>,
}

/// A fixed-size worker pool: `pool_size` workers, kept alive by a
/// supervised template process.
pub struct FixedPool {
	pool: Arc<Pool>,
	socket_path: PathBuf,
	pool_size: usize,
	template_restart_delay: Duration,
	state: Mutex<State>,
	ready: Notify,
	ready_signaled: AtomicBool,
	shutdown: Notify,
}

impl FixedPool {
	#[must_use]
	pub fn new(pool: Arc<Pool>, socket_path: impl Into<PathBuf>, pool_size: usize) -> Self {
		Self {
			pool,
			socket_path: socket_path.into(),
			pool_size,
			template_restart_delay: Duration::from_secs(1),
			state: Mutex::new(State {
				current_version: 0,
				live_by_version: HashMap::new(),
			}),
			ready: Notify::new(),
			ready_signaled: AtomicBool::new(false),
			shutdown: Notify::new(),
		}
	}

	/// Override the delay between a template exiting and it being
	/// respawned. Defaults to one second, matching
	/// `BACKEND_COMPILER_TEMPLATE_PROC_RESTART_INTERVAL`.
	#[must_use]
	pub fn with_restart_delay(mut self, delay: Duration) -> Self {
		self.template_restart_delay = delay;
		self
	}

	#[must_use]
	pub fn pool(&self) -> &Arc<Pool> {
		&self.pool
	}

	/// Bind the socket and start the accept loop and template supervisor
	/// as background tasks. Returns once the socket is bound; the pool is
	/// not necessarily ready yet — see [`FixedPool::wait_ready`].
	pub async fn start(self: &Arc<Self>, launcher: Arc<dyn TemplateLauncher>) -> std::io::Result<()> {
		let listener = cpool_transport::bind(&self.socket_path).await?;

		let accept_self = Arc::clone(self);
		tokio::spawn(FixedPool::accept_loop(accept_self, listener));

		let supervise_self = Arc::clone(self);
		tokio::spawn(async move { supervise_self.supervise_template(launcher).await });

		Ok(())
	}

	/// Resolve once at least `pool_size` workers from a single template
	/// generation have registered.
	pub async fn wait_ready(&self) {
		let notified = self.ready.notified();
		if self.ready_signaled.load(Ordering::Acquire) {
			return;
		}
		notified.await;
	}

	/// Stop accepting calls, stop the currently-running template, and let
	/// the supervisor loop exit instead of restarting it.
	pub fn stop(&self) {
		self.pool.stop();
		self.shutdown.notify_waiters();
	}

	async fn supervise_template(&self, launcher: Arc<dyn TemplateLauncher>) {
		loop {
			if !self.pool.is_running() {
				return;
			}
			let version = {
				let mut st = self.state.lock().unwrap();
				st.current_version += 1;
				st.live_by_version.insert(st.current_version, 0);
				st.current_version
			};
			tracing::info!(version, pool_size = self.pool_size, "starting compiler template");

			match launcher.launch(&self.socket_path, self.pool_size, version).await {
				Ok(mut handle) => {
					tokio::select! {
						result = handle.wait() => {
							if let Err(err) = result {
								tracing::warn!(error = %err, version, "template process errored");
							} else {
								tracing::warn!(version, "template process exited, restarting");
							}
						}
						_ = self.shutdown.notified() => {
							handle.kill().await;
							return;
						}
					}
				}
				Err(err) => {
					tracing::warn!(error = %err, version, "failed to launch compiler template");
				}
			}

			if !self.pool.is_running() {
				return;
			}
			tokio::time::sleep(self.template_restart_delay).await;
		}
	}

	async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
		loop {
			let stream = match listener.accept().await {
				Ok((stream, _addr)) => stream,
				Err(err) => {
					tracing::warn!(error = %err, "accept failed");
					continue;
				}
			};
			let this = Arc::clone(&self);
			tokio::spawn(handle_connection(this, stream));
		}
	}

	async fn on_worker_connected(&self, version: u64, view: Arc<WorkerView>) {
		let became_ready = {
			let mut st = self.state.lock().unwrap();
			if version < st.current_version {
				return;
			}
			let count = st.live_by_version.entry(version).or_insert(0);
			*count += 1;
			*count >= self.pool_size
		};
		self.pool.register_worker(view);
		if became_ready && !self.ready_signaled.swap(true, Ordering::AcqRel) {
			self.ready.notify_waiters();
		}
	}

	fn current_version(&self) -> u64 {
		self.state.lock().unwrap().current_version
	}
}

async fn handle_connection(pool: Arc<FixedPool>, stream: UnixStream) {
	let (mut read_half, write_half) = stream.into_split();

	let pid = match cpool_transport::read_handshake(&mut read_half).await {
		Ok(pid) => pid,
		Err(err) => {
			tracing::debug!(error = %err, "worker handshake failed");
			return;
		}
	};
	let version = match read_half.read_u64().await {
		Ok(version) => version,
		Err(err) => {
			tracing::debug!(error = %err, pid, "worker version-serial handshake failed");
			return;
		}
	};

	if version < pool.current_version() {
		tracing::info!(pid, version, current = pool.current_version(), "rejecting worker from a superseded template");
		return;
	}

	let client = Client::with_defaults(read_half, write_half);
	let view = Arc::new(WorkerView::new(pid, client));
	pool.on_worker_connected(version, view).await;
}
