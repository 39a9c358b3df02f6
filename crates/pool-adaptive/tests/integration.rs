//! Exercises the invariants spec §8 assigns to this crate against a fake,
//! in-process worker spawner: the pool starts at its floor, grows toward
//! its ceiling under waiter pressure, shrinks back to the floor once calls
//! go quiet, and replaces a worker that dies unexpectedly below the floor.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use cpool_pool::{Pool, Request, WantedState};
use cpool_pool_adaptive::{AdaptivePool, WorkerHandle, WorkerSpawner};
use cpool_proto::Blob;
use cpool_worker::{CompileContext, Compiler, CompilerError};
use tempfile::TempDir;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Echoes its argument back, like [`cpool_worker::StubCompiler`], but
/// `compile` blocks the calling thread for `delay` first — standing in for
/// an expensive schema compile so concurrent callers actually queue up.
struct SlowCompiler {
	delay: Duration,
}

impl Compiler for SlowCompiler {
	fn compile(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		std::thread::sleep(self.delay);
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn compile_in_tx(&self, _ctx: &CompileContext, state: &Blob, args: &Blob) -> Result<(Blob, Blob), CompilerError> {
		Ok((Blob::new(args.bytes().to_vec()), state.clone()))
	}

	fn compile_notebook(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn compile_graphql(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn compile_sql(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn parse_global_schema(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn parse_user_schema_db_config(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn make_state_serializer(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn describe_database_dump(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn describe_database_restore(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn analyze_explain_output(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn validate_schema_equivalence(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn compile_structured_config(&self, _ctx: &CompileContext, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}

	fn interpret_backend_error(&self, args: &Blob) -> Result<Blob, CompilerError> {
		Ok(Blob::new(args.bytes().to_vec()))
	}
}

/// Connects one in-process fake worker per [`WorkerSpawner::spawn`] call,
/// each with a caller-assigned pid (real workers all share one
/// `std::process::id()`, which would collide here since every fake worker
/// lives in the same test process).
struct FakeWorkerSpawner {
	next_pid: AtomicU64,
	delay: Duration,
	/// Per-pid crash trigger: notifying it drops that worker's connection
	/// from its own side, as if the process had died, without touching the
	/// `WorkerHandle` the pool's reaper task owns.
	crash_signals: Mutex<HashMap<u64, Arc<Notify>>>,
}

impl FakeWorkerSpawner {
	fn new(delay: Duration) -> Self {
		Self {
			next_pid: AtomicU64::new(1),
			delay,
			crash_signals: Mutex::new(HashMap::new()),
		}
	}

	/// Simulate an unannounced crash of the worker with this pid, distinct
	/// from a pool-initiated scale-down kill.
	fn crash(&self, pid: u64) {
		if let Some(signal) = self.crash_signals.lock().unwrap().remove(&pid) {
			signal.notify_one();
		}
	}
}

#[async_trait]
impl WorkerSpawner for FakeWorkerSpawner {
	async fn spawn(&self, socket_path: &Path) -> std::io::Result<(u64, Box<dyn WorkerHandle>)> {
		let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
		let crash_signal = Arc::new(Notify::new());
		self.crash_signals.lock().unwrap().insert(pid, Arc::clone(&crash_signal));
		let path = socket_path.to_path_buf();
		let delay = self.delay;
		let task = tokio::spawn(async move {
			let stream = cpool_transport::connect(&path).await.unwrap();
			let (r, w) = stream.into_split();
			tokio::select! {
				_ = cpool_worker::run_on_with_pid(r, w, SlowCompiler { delay }, pid) => {}
				_ = crash_signal.notified() => {}
			}
		});
		Ok((pid, Box::new(FakeWorkerHandle { task })))
	}
}

struct FakeWorkerHandle {
	task: JoinHandle<()>,
}

#[async_trait]
impl WorkerHandle for FakeWorkerHandle {
	async fn wait(&mut self) -> std::io::Result<()> {
		let _ = (&mut self.task).await;
		Ok(())
	}

	async fn kill(&mut self) {
		self.task.abort();
	}
}

fn make_request(tag: &str) -> Request {
	Request {
		dbname: Some("d".to_string()),
		wanted: WantedState::default(),
		args: Blob::new(tag.as_bytes().to_vec()),
	}
}

async fn wait_for(deadline: Duration, mut cond: impl FnMut() -> bool) -> bool {
	let end = tokio::time::Instant::now() + deadline;
	loop {
		if cond() {
			return true;
		}
		if tokio::time::Instant::now() >= end {
			return false;
		}
		tokio::time::sleep(Duration::from_millis(20)).await;
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn starts_at_the_floor_and_becomes_ready() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("pool.sock");
	let pool = Arc::new(Pool::new());
	let spawner = Arc::new(FakeWorkerSpawner::new(Duration::from_millis(10)));
	let adaptive = Arc::new(AdaptivePool::new(Arc::clone(&pool), path, 2, 5, spawner));
	adaptive.start().await.unwrap();

	tokio::time::timeout(Duration::from_secs(5), adaptive.wait_ready()).await.unwrap();
	assert_eq!(adaptive.live_count(), 2);
	assert_eq!(pool.idle_count(), 2);

	let reply = adaptive.compile(make_request("hello")).await.unwrap();
	assert_eq!(reply.bytes(), b"hello");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn grows_toward_the_ceiling_under_waiter_pressure_then_shrinks_back_to_the_floor() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("pool.sock");
	let pool = Arc::new(Pool::new());
	let spawner = Arc::new(FakeWorkerSpawner::new(Duration::from_millis(800)));
	let adaptive = Arc::new(
		AdaptivePool::new(Arc::clone(&pool), path, 2, 5, spawner)
			.with_timings(Duration::from_millis(100), Duration::from_millis(300)),
	);
	adaptive.start().await.unwrap();
	tokio::time::timeout(Duration::from_secs(5), adaptive.wait_ready()).await.unwrap();
	assert_eq!(adaptive.live_count(), 2);

	// Five concurrent slow calls saturate the floor of two, leaving three
	// waiters — enough grow pressure to reach the ceiling of five exactly.
	let mut calls = Vec::new();
	for i in 0..5 {
		let adaptive = Arc::clone(&adaptive);
		calls.push(tokio::spawn(async move { adaptive.compile(make_request(&format!("q{i}"))).await }));
	}

	let grew = wait_for(Duration::from_secs(3), || adaptive.live_count() >= 5).await;
	assert!(grew, "pool never grew toward its ceiling under waiter pressure, stuck at {}", adaptive.live_count());

	for call in calls {
		call.await.unwrap().unwrap();
	}

	let shrank = wait_for(Duration::from_secs(3), || adaptive.live_count() == 2).await;
	assert!(shrank, "pool never shrank back to its floor, stuck at {}", adaptive.live_count());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn an_unexpected_crash_below_the_floor_is_replaced() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("pool.sock");
	let pool = Arc::new(Pool::new());
	let spawner = Arc::new(FakeWorkerSpawner::new(Duration::from_millis(10)));
	let adaptive = Arc::new(AdaptivePool::new(Arc::clone(&pool), path, 2, 4, Arc::clone(&spawner)));
	adaptive.start().await.unwrap();
	tokio::time::timeout(Duration::from_secs(5), adaptive.wait_ready()).await.unwrap();
	assert_eq!(adaptive.live_count(), 2);

	spawner.crash(1);

	let dropped = wait_for(Duration::from_secs(3), || adaptive.live_count() == 1).await;
	assert!(dropped, "crash was never observed, live count stayed at {}", adaptive.live_count());

	let recovered = wait_for(Duration::from_secs(3), || adaptive.live_count() == 2).await;
	assert!(recovered, "pool never replaced a worker that crashed below its floor");

	let reply = adaptive.compile(make_request("after-crash")).await.unwrap();
	assert_eq!(reply.bytes(), b"after-crash");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn a_crashed_workers_zombie_queue_entry_is_discarded_not_handed_to_a_caller() {
	let dir = TempDir::new().unwrap();
	let path = dir.path().join("pool.sock");
	let pool = Arc::new(Pool::new());
	let spawner = Arc::new(FakeWorkerSpawner::new(Duration::from_millis(10)));
	let adaptive = Arc::new(AdaptivePool::new(Arc::clone(&pool), path, 2, 4, Arc::clone(&spawner)));
	adaptive.start().await.unwrap();
	tokio::time::timeout(Duration::from_secs(5), adaptive.wait_ready()).await.unwrap();
	assert_eq!(adaptive.live_count(), 2);

	spawner.crash(1);
	let dropped = wait_for(Duration::from_secs(3), || adaptive.live_count() == 1).await;
	assert!(dropped, "crash was never observed, live count stayed at {}", adaptive.live_count());
	let recovered = wait_for(Duration::from_secs(3), || adaptive.live_count() == 2).await;
	assert!(recovered, "pool never replaced the crashed worker");

	// The crashed worker's `WorkerView` is never physically removed from
	// the idle queue by itself; `register_worker` always pushes the
	// replacement to the queue's front, so a single call after recovery
	// only ever reaches the fresh worker, never the zombie sitting behind
	// it. Three concurrent calls drain every idle slot at once (the fresh
	// worker, the surviving original, and the crashed zombie), which is
	// what actually proves the zombie is discarded and retried past rather
	// than handed to a caller as a bare `ConnectionError`.
	let mut calls = Vec::new();
	for i in 0..3 {
		let adaptive = Arc::clone(&adaptive);
		calls.push(tokio::spawn(async move { adaptive.compile(make_request(&format!("zombie{i}"))).await }));
	}
	for (i, call) in calls.into_iter().enumerate() {
		let reply = call.await.unwrap().unwrap_or_else(|err| panic!("call {i} hit the crashed worker instead of retrying past it: {err}"));
		assert_eq!(reply.bytes(), format!("zombie{i}").as_bytes());
	}
}
