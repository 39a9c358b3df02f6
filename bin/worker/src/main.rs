//! Compiler worker process (spec §4.3): connects to a pool's Unix socket,
//! handshakes, and serves `compile*` calls until the connection drops or a
//! terminating signal arrives.
//!
//! The real compiler is out of scope for this workspace (spec §4.10); this
//! binary runs `cpool_worker::StubCompiler`, which round-trips its input as
//! the result — enough to exercise the pool end-to-end.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use cpool_worker::ShutdownReason;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "cpool-worker")]
#[command(about = "Compiler worker: serves compile* calls for one pool socket")]
struct Args {
	/// Unix socket path of the pool to connect to.
	#[arg(long, value_name = "PATH")]
	sockname: PathBuf,

	/// Version-serial to report after the core handshake. Present only
	/// when spawned under a fixed-pool template (spec §4.5); a plain
	/// worker started directly omits it.
	#[arg(long, value_name = "N")]
	version_serial: Option<u64>,

	/// Serve `CallForClient` frames from a multi-tenant broker's inner
	/// pool (spec §4.8) instead of plain `CallEnvelope`s from a
	/// single-tenant pool.
	#[arg(long)]
	multitenant: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
	let args = Args::parse();
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	info!(
		sockname = %args.sockname.display(),
		version_serial = ?args.version_serial,
		multitenant = args.multitenant,
		"worker starting"
	);

	let outcome = match (args.multitenant, args.version_serial) {
		(false, Some(version)) => run_versioned(&args.sockname, version).await,
		(false, None) => cpool_worker::run(&args.sockname, cpool_worker::StubCompiler).await,
		(true, Some(version)) => run_multitenant_versioned(&args.sockname, version).await,
		(true, None) => run_multitenant(&args.sockname).await,
	};

	match outcome {
		Ok(ShutdownReason::Sigint) => {
			info!("exiting after SIGINT");
			ExitCode::SUCCESS
		}
		Ok(ShutdownReason::Sigterm) => {
			info!("exiting after SIGTERM");
			// Distinct from a plain SIGINT exit so a supervising template
			// can tell "gone intentionally" from "gone unexpectedly" apart
			// by exit code alone, without needing to observe which signal
			// the OS actually delivered.
			ExitCode::from(143)
		}
		Ok(ShutdownReason::ConnectionLost) => {
			info!("exiting after connection loss");
			ExitCode::from(143)
		}
		Err(err) => {
			error!(error = %err, "worker failed");
			ExitCode::FAILURE
		}
	}
}

async fn run_versioned(sockname: &std::path::Path, version: u64) -> std::io::Result<ShutdownReason> {
	let stream = cpool_transport::connect(sockname).await?;
	let (reader, writer) = stream.into_split();
	cpool_worker::run_on_versioned(reader, writer, cpool_worker::StubCompiler, version).await
}

async fn run_multitenant_versioned(sockname: &std::path::Path, version: u64) -> std::io::Result<ShutdownReason> {
	let stream = cpool_transport::connect(sockname).await?;
	let (reader, writer) = stream.into_split();
	cpool_worker::run_multitenant_on_versioned(reader, writer, cpool_worker::StubCompiler, version).await
}

async fn run_multitenant(sockname: &std::path::Path) -> std::io::Result<ShutdownReason> {
	let stream = cpool_transport::connect(sockname).await?;
	let (reader, writer) = stream.into_split();
	cpool_worker::run_multitenant_on(reader, writer, cpool_worker::StubCompiler).await
}
