//! Accepts the broker's own internal worker processes and supervises their
//! template, exactly the shape of `cpool-pool-fixed::FixedPool` (spec
//! §4.8: "runs an inner pool of the *fixed* shape (§4.5) of actual
//! workers") but registering into a [`BrokerPool`] instead of
//! `cpool_pool::Pool`, since these workers speak `CallForClient` rather
//! than bare `CallEnvelope` frames.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpool_pool_fixed::TemplateLauncher;
use cpool_transport::Client;
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use crate::broker_pool::BrokerPool;
use crate::worker_handle::MultiTenantWorkerHandle;

struct State {
	current_version: u64,
	live_by_version: HashMap<u64, usize>,
}

/// Accepts and supervises the workers behind one [`BrokerPool`]. Reuses
/// `cpool-pool-fixed`'s `TemplateLauncher` trait (and
/// `ProcessTemplateLauncher`) unmodified — spawning and watching a
/// template process is identical work regardless of what its workers say
/// over the wire once connected.
pub struct TenantWorkerPool {
	pool: Arc<BrokerPool>,
	socket_path: PathBuf,
	pool_size: usize,
	per_worker_cache_size: usize,
	template_restart_delay: Duration,
	state: Mutex<State>,
	ready: Notify,
	ready_signaled: AtomicBool,
	shutdown: Notify,
	metrics: Option<Arc<cpool_metrics::Metrics>>,
}

impl TenantWorkerPool {
	#[must_use]
	pub fn new(pool: Arc<BrokerPool>, socket_path: impl Into<PathBuf>, pool_size: usize, per_worker_cache_size: usize) -> Self {
		Self {
			pool,
			socket_path: socket_path.into(),
			pool_size,
			per_worker_cache_size,
			template_restart_delay: Duration::from_secs(1),
			state: Mutex::new(State {
				current_version: 0,
				live_by_version: HashMap::new(),
			}),
			ready: Notify::new(),
			ready_signaled: AtomicBool::new(false),
			shutdown: Notify::new(),
			metrics: None,
		}
	}

	#[must_use]
	pub fn with_restart_delay(mut self, delay: Duration) -> Self {
		self.template_restart_delay = delay;
		self
	}

	/// Attach a metrics registry (spec §6 Observability): spawned/current
	/// worker-process counts are recorded as workers connect.
	#[must_use]
	pub fn with_metrics(mut self, metrics: Arc<cpool_metrics::Metrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	#[must_use]
	pub fn pool(&self) -> &Arc<BrokerPool> {
		&self.pool
	}

	pub async fn start(self: &Arc<Self>, launcher: Arc<dyn TemplateLauncher>) -> std::io::Result<()> {
		let listener = cpool_transport::bind(&self.socket_path).await?;

		let accept_self = Arc::clone(self);
		tokio::spawn(TenantWorkerPool::accept_loop(accept_self, listener));

		let supervise_self = Arc::clone(self);
		tokio::spawn(async move { supervise_self.supervise_template(launcher).await });

		Ok(())
	}

	pub async fn wait_ready(&self) {
		let notified = self.ready.notified();
		if self.ready_signaled.load(Ordering::Acquire) {
			return;
		}
		notified.await;
	}

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
			tracing::info!(version, pool_size = self.pool_size, "starting multi-tenant worker template");

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
					tracing::warn!(error = %err, version, "failed to launch worker template");
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

	async fn on_worker_connected(&self, version: u64, handle: Arc<MultiTenantWorkerHandle>) {
		let became_ready = {
			let mut st = self.state.lock().unwrap();
			if version < st.current_version {
				return;
			}
			let count = st.live_by_version.entry(version).or_insert(0);
			*count += 1;
			*count >= self.pool_size
		};
		self.pool.register_worker(handle);
		if let Some(metrics) = &self.metrics {
			metrics.compile_processes_spawned_total.inc();
			metrics.compile_processes_current.inc();
		}
		if became_ready && !self.ready_signaled.swap(true, Ordering::AcqRel) {
			self.ready.notify_waiters();
		}
	}

	fn current_version(&self) -> u64 {
		self.state.lock().unwrap().current_version
	}
}

async fn handle_connection(pool: Arc<TenantWorkerPool>, stream: UnixStream) {
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
	let handle = Arc::new(MultiTenantWorkerHandle::new(pid, client, pool.per_worker_cache_size));
	pool.on_worker_connected(version, handle).await;
}
