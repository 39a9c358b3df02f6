//! The broker's client-facing accept loop (spec §4.8): plain §4.1 framing
//! with an HMAC prefix wrapped around every frame's payload, one task per
//! client connection, `__init_server__` gating the connection before any
//! compile call is accepted.
//!
//! Unlike a worker connection there is no process-id handshake here — a
//! client is a TCP peer, not a spawned child — the very first frame is
//! already the postcard-encoded [`InitRequest`], exactly as
//! `cpool_pool_remote::RemotePool::connect_once` sends it.

use std::sync::Arc;

use cpool_pool::{PoolError, WantedState};
use cpool_proto::{Blob, CallEnvelope, ClientId, ErrorCode, InitRequest, Operation, Reply};
use cpool_transport::DEFAULT_MAX_FRAME_LEN;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

use crate::broker_pool::{BrokerPool, TenantRequest, TenantTxRequest};
use crate::client_state::ClientMaterializer;
use crate::hmac_auth::SharedSecret;
use crate::session::ClientRegistry;

pub struct ClientServer {
	pool: Arc<BrokerPool>,
	registry: Arc<ClientRegistry>,
	secret: SharedSecret,
	metrics: Option<Arc<cpool_metrics::Metrics>>,
}

impl ClientServer {
	#[must_use]
	pub fn new(pool: Arc<BrokerPool>, secret: SharedSecret) -> Self {
		Self {
			pool,
			registry: Arc::new(ClientRegistry::new()),
			secret,
			metrics: None,
		}
	}

	/// Attach a metrics registry (spec §6 Observability): connection counts
	/// and compile durations are recorded per client connection once set.
	#[must_use]
	pub fn with_metrics(mut self, metrics: Arc<cpool_metrics::Metrics>) -> Self {
		self.metrics = Some(metrics);
		self
	}

	pub async fn serve(self: Arc<Self>, listener: TcpListener) {
		loop {
			let (stream, addr) = match listener.accept().await {
				Ok(pair) => pair,
				Err(err) => {
					tracing::warn!(error = %err, "client accept failed");
					continue;
				}
			};
			let this = Arc::clone(&self);
			tokio::spawn(async move {
				tracing::debug!(%addr, "client connected");
				this.handle_connection(stream).await;
				tracing::debug!(%addr, "client disconnected");
			});
		}
	}

	async fn handle_connection(&self, stream: TcpStream) {
		stream.set_nodelay(true).ok();
		let (mut reader, mut writer) = stream.into_split();

		let client_id = self.registry.next_client_id();
		let mut materializer = ClientMaterializer::new();
		let tenant_label = client_id.0.to_string();

		if !self.admit(&mut reader, &mut writer).await {
			return;
		}

		if let Some(metrics) = &self.metrics {
			metrics.client_connections_total.with_label_values(&[&tenant_label]).inc();
			metrics.client_connections_current.with_label_values(&[&tenant_label]).inc();
		}

		loop {
			let (request_id, framed) = match cpool_transport::read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN).await {
				Ok(pair) => pair,
				Err(err) => {
					tracing::debug!(error = %err, client_id = client_id.0, "client connection lost");
					break;
				}
			};

			let reply = match self.secret.verify(&framed) {
				Ok(payload) => match postcard::from_bytes::<CallEnvelope>(payload) {
					Ok(call) => self.dispatch(client_id, &mut materializer, call).await,
					Err(err) => Reply::SerializationFailure { trace: err.to_string() },
				},
				Err(err) => {
					if let Some(metrics) = &self.metrics {
						metrics.connection_errors_total.inc();
					}
					Reply::Error {
						code: ErrorCode::ConnectionError,
						message: format!("HMAC verification failed: {err}"),
						trace: String::new(),
					}
				}
			};

			let bytes = encode_reply(&reply);
			let framed_reply = self.secret.sign(&bytes);
			if cpool_transport::write_frame(&mut writer, request_id, &framed_reply).await.is_err() {
				break;
			}
		}

		if let Some(metrics) = &self.metrics {
			metrics.client_connections_current.with_label_values(&[&tenant_label]).dec();
		}
		self.pool.drop_tenant(client_id);
	}

	/// Read and validate the first frame as `__init_server__`. Returns
	/// `false` (connection already closed/rejected) when the caller should
	/// stop serving this connection without entering the compile loop.
	async fn admit<R, W>(&self, reader: &mut R, writer: &mut W) -> bool
	where
		R: AsyncRead + Unpin,
		W: AsyncWrite + Unpin,
	{
		let (request_id, framed) = match cpool_transport::read_frame(reader, DEFAULT_MAX_FRAME_LEN).await {
			Ok(pair) => pair,
			Err(err) => {
				tracing::debug!(error = %err, "client init frame never arrived");
				return false;
			}
		};

		let reply = match self.secret.verify(&framed) {
			Ok(payload) => match postcard::from_bytes::<InitRequest>(payload) {
				Ok(req) => match self.registry.admit(&req) {
					Ok(()) => Reply::Success(Blob::new(Vec::new())),
					Err(message) => Reply::Error {
						code: ErrorCode::IncompatibleClient,
						message,
						trace: String::new(),
					},
				},
				Err(err) => Reply::SerializationFailure { trace: err.to_string() },
			},
			Err(err) => Reply::Error {
				code: ErrorCode::ConnectionError,
				message: format!("HMAC verification failed: {err}"),
				trace: String::new(),
			},
		};

		let admitted = matches!(reply, Reply::Success(_));
		let bytes = encode_reply(&reply);
		let framed_reply = self.secret.sign(&bytes);
		let _ = cpool_transport::write_frame(writer, request_id, &framed_reply).await;
		admitted
	}

	async fn dispatch(&self, client_id: ClientId, materializer: &mut ClientMaterializer, call: CallEnvelope) -> Reply {
		let wanted = match materializer.apply(call.dbname.as_deref(), &call.preamble) {
			Ok(wanted) => wanted,
			Err(()) => {
				return Reply::Error {
					code: ErrorCode::FailedStateSync,
					message: "incomplete database state preamble".to_string(),
					trace: String::new(),
				};
			}
		};

		if call.operation == Operation::CompileInTx {
			return self.dispatch_tx(client_id, wanted, call).await;
		}

		let req = TenantRequest {
			client_id,
			dbname: call.dbname,
			wanted,
			args: call.args,
		};
		let started = std::time::Instant::now();
		let reply = match self.pool.compile(call.operation, req).await {
			Ok(blob) => Reply::Success(blob),
			Err(err) => error_to_reply(err),
		};
		if let Some(metrics) = &self.metrics {
			metrics.compile_duration_seconds.observe(started.elapsed().as_secs_f64());
			if matches!(reply, Reply::SerializationFailure { .. }) {
				metrics.transaction_serialization_errors_total.inc();
			}
		}
		reply
	}

	async fn dispatch_tx(&self, client_id: ClientId, wanted: WantedState, call: CallEnvelope) -> Reply {
		let Some(tx) = call.tx else {
			return Reply::Error {
				code: ErrorCode::CompilerError,
				message: "compile_in_tx call missing its transaction envelope".to_string(),
				trace: String::new(),
			};
		};

		let req = TenantTxRequest {
			client_id,
			dbname: call.dbname,
			wanted,
			state_id: tx.state_id,
			state: tx.state,
			args: call.args,
		};
		let started = std::time::Instant::now();
		let reply = match self.pool.compile_in_tx(req).await {
			Ok((result, state, state_id)) => Reply::TxSuccess { result, state, state_id },
			Err(err) => error_to_reply(err),
		};
		if let Some(metrics) = &self.metrics {
			metrics.compile_duration_seconds.observe(started.elapsed().as_secs_f64());
			if matches!(reply, Reply::SerializationFailure { .. }) {
				metrics.transaction_serialization_errors_total.inc();
			}
		}
		reply
	}
}

fn error_to_reply(err: PoolError) -> Reply {
	match err {
		PoolError::ConnectionError(e) => Reply::Error {
			code: ErrorCode::ConnectionError,
			message: e.to_string(),
			trace: String::new(),
		},
		PoolError::PoolClosed => Reply::Error {
			code: ErrorCode::PoolClosed,
			message: "broker is stopping".to_string(),
			trace: String::new(),
		},
		PoolError::WorkerCrashed => Reply::Error {
			code: ErrorCode::WorkerCrashed,
			message: "worker crashed before replying".to_string(),
			trace: String::new(),
		},
		PoolError::FailedStateSync { message } => Reply::Error {
			code: ErrorCode::FailedStateSync,
			message,
			trace: String::new(),
		},
		PoolError::IncompatibleClient { message } => Reply::Error {
			code: ErrorCode::IncompatibleClient,
			message,
			trace: String::new(),
		},
		PoolError::StateNotFound => Reply::Error {
			code: ErrorCode::StateNotFound,
			message: "state not found".to_string(),
			trace: String::new(),
		},
		PoolError::CompilerError { message, trace } => Reply::Error {
			code: ErrorCode::CompilerError,
			message,
			trace,
		},
		PoolError::SerializationFailure { trace } => Reply::SerializationFailure { trace },
	}
}

fn encode_reply(reply: &Reply) -> Vec<u8> {
	postcard::to_allocvec(reply).expect("Reply always serializes")
}
