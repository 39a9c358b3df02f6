//! Standalone multi-tenant broker process (spec §4.8, §6): accepts any
//! number of external clients over HMAC-authenticated framed TCP and fans
//! their compile calls out across an inner fixed-shape pool of compiler
//! worker processes.
//!
//! The real compiler is out of scope (spec §4.10); workers spawned by this
//! broker run `cpool_worker::StubCompiler`, same as `bin/worker` run
//! directly against a single-tenant pool.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use cpool_multitenant::{BrokerPool, ClientServer, SharedSecret, TenantWorkerPool};
use cpool_pool_fixed::ProcessTemplateLauncher;
use tokio::net::{TcpListener, TcpStream};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info, warn};

const SECRET_ENV_VAR: &str = "CPOOL_BROKER_SECRET";

#[derive(Parser, Debug)]
#[command(name = "cpool-broker")]
#[command(about = "Multi-tenant broker: accepts clients, fronts a fixed inner pool of compiler workers")]
struct Args {
	/// Address clients connect to (host:port).
	#[arg(long, value_name = "HOST:PORT")]
	listen: SocketAddr,

	/// Optional HTTP port serving `GET /ready` and `GET /metrics`. Omit to
	/// disable the HTTP surface entirely.
	#[arg(long, value_name = "PORT")]
	metrics_port: Option<u16>,

	/// Number of inner worker processes to keep alive.
	#[arg(long)]
	pool_size: usize,

	/// Per-worker client-schema LRU cache size.
	#[arg(long)]
	cache_size: usize,

	/// Run-state directory for the broker's internal worker socket.
	/// Defaults to the platform run-state resolution in
	/// `cpool_proto::paths` (`$CPOOL_RUN_DIR`, then `$XDG_RUNTIME_DIR`,
	/// then the system temp directory).
	#[arg(long, value_name = "PATH")]
	run_dir: Option<PathBuf>,

	/// Path to the `cpool-template` binary. Defaults to a binary named
	/// `cpool-template` next to this executable.
	#[arg(long, value_name = "PATH")]
	template_bin: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
	let args = Args::parse();
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	if let Some(dir) = &args.run_dir {
		// SAFETY: set once, before any other task reads run-state paths.
		unsafe {
			std::env::set_var("CPOOL_RUN_DIR", dir);
		}
	}

	let secret = resolve_secret();
	let metrics = Arc::new(cpool_metrics::Metrics::new());

	let broker_pool = Arc::new(BrokerPool::new());
	let worker_socket = cpool_proto::paths::socket_path("broker-workers");
	let template_bin = args.template_bin.clone().unwrap_or_else(|| sibling_binary("cpool-template"));

	let worker_pool = Arc::new(
		TenantWorkerPool::new(Arc::clone(&broker_pool), worker_socket, args.pool_size, args.cache_size)
			.with_metrics(Arc::clone(&metrics)),
	);
	let launcher = Arc::new(ProcessTemplateLauncher::new(template_bin).with_multitenant(true));
	if let Err(err) = worker_pool.start(launcher).await {
		error!(error = %err, "failed to start inner worker pool");
		return ExitCode::FAILURE;
	}

	let client_listener = match TcpListener::bind(args.listen).await {
		Ok(listener) => listener,
		Err(err) => {
			error!(error = %err, listen = %args.listen, "failed to bind client listener");
			return ExitCode::FAILURE;
		}
	};
	info!(listen = %args.listen, pool_size = args.pool_size, cache_size = args.cache_size, "broker starting");

	let server = Arc::new(ClientServer::new(Arc::clone(&broker_pool), secret).with_metrics(Arc::clone(&metrics)));
	tokio::spawn(Arc::clone(&server).serve(client_listener));

	if let Some(port) = args.metrics_port {
		let http_listener = match TcpListener::bind((args.listen.ip(), port)).await {
			Ok(listener) => listener,
			Err(err) => {
				error!(error = %err, port, "failed to bind metrics HTTP listener");
				return ExitCode::FAILURE;
			}
		};
		info!(port, "broker HTTP surface up (/ready, /metrics)");
		tokio::spawn(serve_http(http_listener, Arc::clone(&metrics)));
	}

	let mut sigterm = match signal(SignalKind::terminate()) {
		Ok(s) => s,
		Err(err) => {
			error!(error = %err, "failed to install SIGTERM handler");
			return ExitCode::FAILURE;
		}
	};
	let mut sigint = match signal(SignalKind::interrupt()) {
		Ok(s) => s,
		Err(err) => {
			error!(error = %err, "failed to install SIGINT handler");
			return ExitCode::FAILURE;
		}
	};

	tokio::select! {
		_ = sigterm.recv() => info!("received SIGTERM, stopping"),
		_ = sigint.recv() => info!("received SIGINT, stopping"),
	}

	broker_pool.stop();
	worker_pool.stop();
	ExitCode::SUCCESS
}

/// Absence of the shared secret is never an initialization failure (spec
/// §6): the broker starts regardless, but every client's HMAC verification
/// will fail against the empty-byte placeholder used here.
fn resolve_secret() -> SharedSecret {
	match std::env::var(SECRET_ENV_VAR) {
		Ok(value) if !value.is_empty() => SharedSecret::new(value.into_bytes()),
		_ => {
			warn!(
				"{SECRET_ENV_VAR} is not set; every client connection will fail HMAC verification until it is"
			);
			SharedSecret::new(Vec::new())
		}
	}
}

fn sibling_binary(name: &str) -> PathBuf {
	let mut path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from(name));
	path.set_file_name(name);
	path
}

/// A minimal hand-rolled HTTP/1.1 responder for `GET /ready` and
/// `GET /metrics` (spec §4.12): no framework pulled in for two routes.
async fn serve_http(listener: TcpListener, metrics: Arc<cpool_metrics::Metrics>) {
	loop {
		let (stream, _addr) = match listener.accept().await {
			Ok(pair) => pair,
			Err(err) => {
				warn!(error = %err, "HTTP accept failed");
				continue;
			}
		};
		let metrics = Arc::clone(&metrics);
		tokio::spawn(async move {
			if let Err(err) = handle_http_request(stream, &metrics).await {
				tracing::debug!(error = %err, "HTTP request handling failed");
			}
		});
	}
}

async fn handle_http_request(mut stream: TcpStream, metrics: &cpool_metrics::Metrics) -> std::io::Result<()> {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	let mut buf = [0u8; 4096];
	let n = stream.read(&mut buf).await?;
	let request_line = String::from_utf8_lossy(&buf[..n]);
	let path = request_line.split_whitespace().nth(1).unwrap_or("/");

	let (status, content_type, body) = match path {
		"/ready" => ("200 OK", "text/plain", "OK".to_string()),
		"/metrics" => ("200 OK", "text/plain; version=0.0.4", metrics.gather_text()),
		_ => ("404 Not Found", "text/plain", "not found".to_string()),
	};

	let response = format!(
		"HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
		body.len()
	);
	stream.write_all(response.as_bytes()).await?;
	stream.shutdown().await
}
