//! Exercises the broker's client-facing surface end to end: a raw, hand-
//! framed TCP client plays the role of a connecting tenant against a real
//! `ClientServer` backed by in-process fake workers, so these tests cover
//! exactly the wire behavior a real `RemotePool` peer would see — the HMAC
//! prefix, the `__init_server__` gate, per-worker LRU eviction, and
//! invalidation propagation on disconnect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use cpool_multitenant::{BrokerPool, ClientServer, MultiTenantWorkerHandle, SharedSecret};
use cpool_pool::WorkerTransport;
use cpool_proto::{
	Blob, CallEnvelope, CallForClient, ClientId, ErrorCode, InitRequest, Operation, Preamble, Reply,
};
use tokio::net::{TcpListener, TcpStream};

fn init_request(catalog_version: u64) -> InitRequest {
	InitRequest {
		catalog_version,
		std_args: Blob::new(Vec::new()),
		client_args: Blob::new(Vec::new()),
		global_schema_pickle: Blob::new(Vec::new()),
		system_config: Blob::new(Vec::new()),
	}
}

fn preamble_for(dbname: &str) -> Preamble {
	Preamble {
		user_schema_pickle: Some(Blob::new(format!("{dbname}-user").into_bytes())),
		reflection_cache: Some(Blob::new(format!("{dbname}-refl").into_bytes())),
		database_config: Some(Blob::new(format!("{dbname}-cfg").into_bytes())),
		..Default::default()
	}
}

/// A worker that echoes a call's args back as a plain success, recording
/// which `client_id` each call carried so tests can see what the broker's
/// cache forwarded.
struct EchoWorker {
	seen: std::sync::Mutex<Vec<ClientId>>,
}

impl EchoWorker {
	fn new() -> Self {
		Self { seen: std::sync::Mutex::new(Vec::new()) }
	}
}

#[async_trait]
impl WorkerTransport for EchoWorker {
	async fn call(&self, payload: &[u8]) -> Result<Vec<u8>, cpool_transport::TransportError> {
		let call: CallForClient = postcard::from_bytes(payload).unwrap();
		self.seen.lock().unwrap().push(call.client_id);
		Ok(postcard::to_allocvec(&Reply::Success(call.call.args)).unwrap())
	}
	fn is_closed(&self) -> bool {
		false
	}
}

/// A minimal raw client speaking the broker's framing directly: sign every
/// outgoing payload with the shared secret, verify and strip every
/// incoming one. Exists purely so these tests exercise the real wire
/// protocol rather than calling `ClientServer`'s Rust API directly.
struct RawClient {
	stream: TcpStream,
	secret: SharedSecret,
	next_request_id: u64,
}

impl RawClient {
	async fn connect(addr: std::net::SocketAddr, secret: SharedSecret) -> Self {
		let stream = TcpStream::connect(addr).await.unwrap();
		stream.set_nodelay(true).ok();
		Self { stream, secret, next_request_id: 1 }
	}

	async fn init(&mut self, req: &InitRequest) -> Reply {
		let payload = postcard::to_allocvec(req).unwrap();
		self.roundtrip(&payload).await
	}

	async fn call(&mut self, call: &CallEnvelope) -> Reply {
		let payload = postcard::to_allocvec(call).unwrap();
		self.roundtrip(&payload).await
	}

	async fn call_raw_frame(&mut self, framed: &[u8]) -> Result<Reply, cpool_transport::TransportError> {
		let id = cpool_proto::RequestId(self.next_request_id);
		self.next_request_id += 1;
		cpool_transport::write_frame(&mut self.stream, id, framed).await?;
		let (_id, reply_framed) = cpool_transport::read_frame(&mut self.stream, cpool_transport::DEFAULT_MAX_FRAME_LEN).await?;
		let reply_payload = self.secret.verify(&reply_framed).expect("server always signs its own replies");
		Ok(postcard::from_bytes(reply_payload).unwrap())
	}

	async fn roundtrip(&mut self, payload: &[u8]) -> Reply {
		let framed = self.secret.sign(payload);
		self.call_raw_frame(&framed).await.unwrap()
	}
}

async fn spawn_server(pool: Arc<BrokerPool>, secret: SharedSecret) -> std::net::SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	let server = Arc::new(ClientServer::new(pool, secret));
	tokio::spawn(server.serve(listener));
	addr
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn init_then_compile_round_trips_through_real_framing() {
	let pool = Arc::new(BrokerPool::new());
	pool.register_worker(Arc::new(MultiTenantWorkerHandle::new(1, Arc::new(EchoWorker::new()), 4)));
	let secret = SharedSecret::new(b"sekrit".to_vec());
	let addr = spawn_server(Arc::clone(&pool), secret.clone()).await;

	let mut client = RawClient::connect(addr, secret).await;
	assert!(matches!(client.init(&init_request(1)).await, Reply::Success(_)));

	let call = CallEnvelope {
		operation: Operation::Compile,
		preamble: preamble_for("d"),
		dbname: Some("d".to_string()),
		tx: None,
		args: Blob::new(b"SELECT 1".to_vec()),
	};
	match client.call(&call).await {
		Reply::Success(blob) => assert_eq!(blob.bytes(), b"SELECT 1"),
		other => panic!("expected Success, got {other:?}"),
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn a_second_client_with_a_mismatched_catalog_version_is_rejected() {
	let pool = Arc::new(BrokerPool::new());
	pool.register_worker(Arc::new(MultiTenantWorkerHandle::new(1, Arc::new(EchoWorker::new()), 4)));
	let secret = SharedSecret::new(b"sekrit".to_vec());
	let addr = spawn_server(Arc::clone(&pool), secret.clone()).await;

	let mut first = RawClient::connect(addr, secret.clone()).await;
	assert!(matches!(first.init(&init_request(7)).await, Reply::Success(_)));

	let mut second = RawClient::connect(addr, secret).await;
	match second.init(&init_request(8)).await {
		Reply::Error { code: ErrorCode::IncompatibleClient, .. } => {}
		other => panic!("expected IncompatibleClient, got {other:?}"),
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn wrong_shared_secret_is_rejected_and_never_reaches_a_worker() {
	let pool = Arc::new(BrokerPool::new());
	let worker = Arc::new(EchoWorker::new());
	pool.register_worker(Arc::new(MultiTenantWorkerHandle::new(1, Arc::clone(&worker) as Arc<dyn WorkerTransport>, 4)));
	let server_secret = SharedSecret::new(b"right-secret".to_vec());
	let addr = spawn_server(Arc::clone(&pool), server_secret).await;

	let wrong_secret = SharedSecret::new(b"wrong-secret".to_vec());
	let mut client = RawClient::connect(addr, wrong_secret.clone()).await;
	let payload = postcard::to_allocvec(&init_request(1)).unwrap();
	let framed = wrong_secret.sign(&payload);
	match client.call_raw_frame(&framed).await.unwrap() {
		Reply::Error { code: ErrorCode::ConnectionError, .. } => {}
		other => panic!("expected ConnectionError, got {other:?}"),
	}
	assert_eq!(worker.seen.lock().unwrap().len(), 0, "a rejected init must never reach a worker");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn tampered_frame_is_rejected() {
	let pool = Arc::new(BrokerPool::new());
	pool.register_worker(Arc::new(MultiTenantWorkerHandle::new(1, Arc::new(EchoWorker::new()), 4)));
	let secret = SharedSecret::new(b"sekrit".to_vec());
	let addr = spawn_server(Arc::clone(&pool), secret.clone()).await;

	let mut client = RawClient::connect(addr, secret.clone()).await;
	let payload = postcard::to_allocvec(&init_request(1)).unwrap();
	let mut framed = secret.sign(&payload);
	*framed.last_mut().unwrap() ^= 0xff;
	match client.call_raw_frame(&framed).await.unwrap() {
		Reply::Error { code: ErrorCode::ConnectionError, .. } => {}
		other => panic!("expected ConnectionError, got {other:?}"),
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn per_worker_lru_evicts_the_least_recently_used_client() {
	let pool = Arc::new(BrokerPool::new());
	let handle = Arc::new(MultiTenantWorkerHandle::new(1, Arc::new(EchoWorker::new()), 3));
	pool.register_worker(Arc::clone(&handle));
	let secret = SharedSecret::new(b"sekrit".to_vec());
	let addr = spawn_server(Arc::clone(&pool), secret.clone()).await;

	// Four distinct clients, one worker with room for three: the first
	// client's tenant slot must be evicted once the fourth arrives.
	let mut clients = Vec::new();
	for catalog in 0..4u64 {
		let mut c = RawClient::connect(addr, secret.clone()).await;
		assert!(matches!(c.init(&init_request(1)).await, Reply::Success(_)));
		let _ = catalog;
		clients.push(c);
	}

	for (i, client) in clients.iter_mut().enumerate() {
		let call = CallEnvelope {
			operation: Operation::Compile,
			preamble: preamble_for("d"),
			dbname: Some("d".to_string()),
			tx: None,
			args: Blob::new(format!("call-{i}").into_bytes()),
		};
		assert!(matches!(client.call(&call).await, Reply::Success(_)));
	}

	// client_id 1 belongs to the first connection admitted (monotonic
	// starting at 1); it should have been pushed out once the fourth
	// connection's call filled the cache.
	assert!(!handle.holds_client(ClientId(1)), "oldest tenant should have been evicted");
	assert!(handle.holds_client(ClientId(4)), "most recent tenant should still be cached");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn disconnecting_a_client_invalidates_it_on_every_worker() {
	let pool = Arc::new(BrokerPool::new());
	let handle = Arc::new(MultiTenantWorkerHandle::new(1, Arc::new(EchoWorker::new()), 4));
	pool.register_worker(Arc::clone(&handle));
	let secret = SharedSecret::new(b"sekrit".to_vec());
	let addr = spawn_server(Arc::clone(&pool), secret.clone()).await;

	{
		let mut client = RawClient::connect(addr, secret.clone()).await;
		assert!(matches!(client.init(&init_request(1)).await, Reply::Success(_)));
		let call = CallEnvelope {
			operation: Operation::Compile,
			preamble: preamble_for("d"),
			dbname: Some("d".to_string()),
			tx: None,
			args: Blob::new(b"hello".to_vec()),
		};
		assert!(matches!(client.call(&call).await, Reply::Success(_)));
	} // client dropped here, closing its TCP connection

	let dropped = wait_for(Duration::from_secs(3), || !handle.holds_client(ClientId(1))).await;
	assert!(dropped, "worker should have invalidated the disconnected client's cached schema");
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
