//! The adaptive pool itself: owns the grow/shrink timers and worker
//! process lifecycle around a plain [`Pool`] (spec §4.6, grounded in
//! `SimpleAdaptivePool` from `pool.py`).
//!
//! Scaling up races the *whole* call (queue wait plus the IPC round trip)
//! against the grow timer rather than hooking `Pool`'s private acquire —
//! `Pool::idle_count() == 0` is already visible from the outside, and the
//! timer only ever fires while there genuinely was nothing idle to hand
//! out, so the effect matches the original's "acquire has waited past the
//! threshold" trigger closely enough without needing a second seam into
//! `Pool`'s call dispatch.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpool_pool::{Pool, PoolError, Request, TxOutcome, TxRequest, WorkerView};
use cpool_proto::Blob;
use cpool_transport::Client;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Notify;

use crate::spawner::WorkerSpawner;

struct State {
	live: usize,
	expected: usize,
	scale_down_gen: u64,
	/// Pids we killed ourselves during scale-down, so their reaper task's
	/// eventual exit report doesn't get treated as an unexpected crash.
	intentional_exits: HashSet<u64>,
	/// One kill-request signal per spawned-but-not-yet-reaped worker. The
	/// reaper task owns that worker's `WorkerHandle` exclusively and races
	/// its natural exit against this signal — nothing else ever touches
	/// the handle, so a scale-down eviction can never contend with (or
	/// deadlock behind) a reaper blocked on a long-lived `wait()`.
	children: HashMap<u64, Arc<Notify>>,
}

pub struct AdaptivePool {
	pool: Arc<Pool>,
	socket_path: PathBuf,
	floor: usize,
	ceiling: usize,
	grow_after: Duration,
	shrink_after: Duration,
	spawner: Arc<dyn WorkerSpawner>,
	state: Mutex<State>,
	ready: Notify,
	ready_signaled: AtomicBool,
}

impl AdaptivePool {
	#[must_use]
	pub fn new(
		pool: Arc<Pool>,
		socket_path: impl Into<PathBuf>,
		floor: usize,
		ceiling: usize,
		spawner: Arc<dyn WorkerSpawner>,
	) -> Self {
		Self {
			pool,
			socket_path: socket_path.into(),
			floor,
			ceiling,
			grow_after: Duration::from_secs(3),
			shrink_after: Duration::from_secs(60),
			spawner,
			state: Mutex::new(State {
				live: 0,
				expected: 0,
				scale_down_gen: 0,
				intentional_exits: HashSet::new(),
				children: HashMap::new(),
			}),
			ready: Notify::new(),
			ready_signaled: AtomicBool::new(false),
		}
	}

	#[must_use]
	pub fn with_timings(mut self, grow_after: Duration, shrink_after: Duration) -> Self {
		self.grow_after = grow_after;
		self.shrink_after = shrink_after;
		self
	}

	#[must_use]
	pub fn pool(&self) -> &Arc<Pool> {
		&self.pool
	}

	/// Bind the pool's socket and spawn `floor` workers directly.
	pub async fn start(self: &Arc<Self>) -> std::io::Result<()> {
		let listener = cpool_transport::bind(&self.socket_path).await?;
		let accept_self = Arc::clone(self);
		tokio::spawn(AdaptivePool::accept_loop(accept_self, listener));

		for _ in 0..self.floor {
			self.spawn_worker().await;
		}
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
	}

	#[must_use]
	pub fn live_count(&self) -> usize {
		self.state.lock().unwrap().live
	}

	pub async fn compile(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.compile(req)).await
	}

	pub async fn compile_notebook(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.compile_notebook(req)).await
	}

	pub async fn compile_graphql(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.compile_graphql(req)).await
	}

	pub async fn compile_sql(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.compile_sql(req)).await
	}

	pub async fn parse_global_schema(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.parse_global_schema(req)).await
	}

	pub async fn parse_user_schema_db_config(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.parse_user_schema_db_config(req)).await
	}

	pub async fn make_state_serializer(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.make_state_serializer(req)).await
	}

	pub async fn describe_database_dump(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.describe_database_dump(req)).await
	}

	pub async fn describe_database_restore(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.describe_database_restore(req)).await
	}

	pub async fn analyze_explain_output(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.analyze_explain_output(req)).await
	}

	pub async fn validate_schema_equivalence(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.validate_schema_equivalence(req)).await
	}

	pub async fn compile_structured_config(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.compile_structured_config(req)).await
	}

	pub async fn interpret_backend_error(self: &Arc<Self>, req: Request) -> Result<Blob, PoolError> {
		self.scaled(self.pool.interpret_backend_error(req)).await
	}

	pub async fn compile_in_tx(self: &Arc<Self>, req: TxRequest) -> Result<TxOutcome, PoolError> {
		self.scaled(self.pool.compile_in_tx(req)).await
	}

	/// Wrap a call to the inner pool with the grow-on-wait and
	/// cancel-pending-shrink behavior spec §4.6 assigns to every acquire.
	async fn scaled<T>(self: &Arc<Self>, fut: impl Future<Output = T>) -> T {
		// Mirrors `_acquire_worker` unconditionally cancelling any pending
		// shrink timer: bumping the generation makes any timer already in
		// flight a no-op when it fires.
		self.state.lock().unwrap().scale_down_gen += 1;

		let should_arm = {
			let st = self.state.lock().unwrap();
			self.pool.is_running() && self.pool.idle_count() == 0 && st.live == st.expected && st.expected < self.ceiling
		};
		let grow_handle = should_arm.then(|| {
			let this = Arc::clone(self);
			tokio::spawn(async move {
				tokio::time::sleep(this.grow_after).await;
				this.maybe_scale_up().await;
			})
		});

		let result = fut.await;
		if let Some(handle) = grow_handle {
			handle.abort();
		}
		self.maybe_arm_scale_down();
		result
	}

	fn maybe_arm_scale_down(self: &Arc<Self>) {
		let gen = {
			let mut st = self.state.lock().unwrap();
			if !self.pool.is_running() || self.pool.waiting_count() != 0 || st.live <= self.floor {
				return;
			}
			st.scale_down_gen += 1;
			st.scale_down_gen
		};
		let this = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(this.shrink_after).await;
			this.scale_down(gen).await;
		});
	}

	async fn maybe_scale_up(self: Arc<Self>) {
		if !self.pool.is_running() {
			return;
		}
		tracing::info!(grow_after = ?self.grow_after, "a compile request has waited past the grow threshold, spawning a new compiler worker");
		self.spawn_worker().await;
	}

	async fn scale_down(self: Arc<Self>, gen: u64) {
		let excess = {
			let st = self.state.lock().unwrap();
			if !self.pool.is_running() || st.scale_down_gen != gen || st.live <= self.floor {
				return;
			}
			st.live - self.floor
		};
		let evicted = self.pool.evict_idle_lru(excess);
		if evicted.is_empty() {
			return;
		}
		tracing::info!(
			shrink_after = ?self.shrink_after,
			floor = self.floor,
			evicted = evicted.len(),
			"the compiler pool has been idle, scaling back down"
		);
		let mut st = self.state.lock().unwrap();
		st.expected = self.floor.max(st.live.saturating_sub(evicted.len()));
		for view in &evicted {
			st.intentional_exits.insert(view.pid);
			if let Some(signal) = st.children.get(&view.pid) {
				signal.notify_one();
			}
		}
	}

	async fn spawn_worker(self: &Arc<Self>) {
		{
			let mut st = self.state.lock().unwrap();
			st.expected += 1;
		}
		match self.spawner.spawn(&self.socket_path).await {
			Ok((pid, mut handle)) => {
				let kill_signal = Arc::new(Notify::new());
				{
					let mut st = self.state.lock().unwrap();
					st.children.insert(pid, Arc::clone(&kill_signal));
				}
				let this = Arc::clone(self);
				tokio::spawn(async move {
					tokio::select! {
						_ = handle.wait() => {}
						_ = kill_signal.notified() => { handle.kill().await; }
					}
					this.on_worker_exited(pid).await;
				});
			}
			Err(err) => {
				tracing::warn!(error = %err, "failed to spawn compiler worker process");
				let mut st = self.state.lock().unwrap();
				st.expected = st.expected.saturating_sub(1);
			}
		}
	}

	async fn on_worker_exited(self: Arc<Self>, pid: u64) {
		let (was_intentional, should_restart) = {
			let mut st = self.state.lock().unwrap();
			st.children.remove(&pid);
			st.live = st.live.saturating_sub(1);
			let was_intentional = st.intentional_exits.remove(&pid);
			if was_intentional {
				(true, false)
			} else {
				let below_floor = st.live < self.floor;
				st.expected = st.live;
				(false, below_floor)
			}
		};
		if was_intentional {
			tracing::debug!(pid, "compiler worker process exited as part of a scale-down");
			return;
		}
		if !self.pool.is_running() {
			return;
		}
		if should_restart {
			tracing::warn!(pid, "compiler worker process exited unexpectedly; starting a new one now");
			self.spawn_worker().await;
		}
	}

	async fn accept_loop(self: Arc<Self>, listener: UnixListener) {
		loop {
			let stream = match listener.accept().await {
				Ok((s, _)) => s,
				Err(err) => {
					tracing::warn!(error = %err, "accept failed");
					continue;
				}
			};
			let this = Arc::clone(&self);
			tokio::spawn(handle_connection(this, stream));
		}
	}

	fn on_worker_connected(&self, view: Arc<WorkerView>) {
		let live = {
			let mut st = self.state.lock().unwrap();
			st.live += 1;
			if st.expected < st.live {
				st.expected = st.live;
			}
			st.live
		};
		self.pool.register_worker(view);
		if live >= self.floor && !self.ready_signaled.swap(true, Ordering::AcqRel) {
			self.ready.notify_waiters();
		}
	}
}

async fn handle_connection(pool: Arc<AdaptivePool>, stream: UnixStream) {
	let (mut read_half, write_half) = stream.into_split();
	let pid = match cpool_transport::read_handshake(&mut read_half).await {
		Ok(p) => p,
		Err(err) => {
			tracing::debug!(error = %err, "worker handshake failed");
			return;
		}
	};
	let client = Client::with_defaults(read_half, write_half);
	let view = Arc::new(WorkerView::new(pid, client));
	pool.on_worker_connected(view);
}
