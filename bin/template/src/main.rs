//! The fixed pool's template supervisor (spec §4.5, DESIGN NOTES "Template
//! process supervising children").
//!
//! Forks — in the idiomatic-Rust sense: spawns as a subprocess rather than
//! calling `fork()`, which is unsound once a multi-threaded tokio runtime
//! is involved — exactly `numproc` `cpool-worker` children pointed at the
//! same pool socket, each reporting `version_serial`. A child that exits
//! cleanly (exit code 0, the convention `bin/worker` uses for an orderly
//! SIGINT shutdown) is not replaced. Any other exit — crash, SIGKILL,
//! SIGTERM relayed from `bin/worker`'s own convention exit code — is
//! treated as unexpected and the slot is respawned, keeping exactly
//! `numproc` workers alive. On its own SIGTERM the template kills every
//! remaining child and exits, so the pool observes the whole generation
//! gone and schedules a fresh template (spec §4.5 step 4).

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;

use clap::Parser;
use tokio::process::{Child, Command};
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::{Mutex, mpsc};

#[derive(Parser, Debug)]
#[command(name = "cpool-template")]
#[command(about = "Spawns and supervises N compiler worker subprocesses for a fixed pool")]
struct Args {
	/// Unix socket path the workers should connect to.
	#[arg(long, value_name = "PATH")]
	sockname: PathBuf,

	/// Number of worker subprocesses to keep alive.
	#[arg(long)]
	numproc: usize,

	/// Version-serial every spawned worker reports in its handshake.
	#[arg(long, value_name = "N")]
	version_serial: u64,

	/// Path to the `cpool-worker` binary. Defaults to a binary named
	/// `cpool-worker` next to this executable.
	#[arg(long, value_name = "PATH")]
	worker_bin: Option<PathBuf>,

	/// Pass `--multitenant` to every spawned worker, for a template
	/// supervising the inner pool behind a multi-tenant broker (spec
	/// §4.8).
	#[arg(long)]
	multitenant: bool,
}

type ExitTx = mpsc::UnboundedSender<(usize, std::io::Result<ExitStatus>)>;

#[tokio::main]
async fn main() -> std::io::Result<()> {
	let args = Args::parse();
	tracing_subscriber::fmt()
		.with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
		.init();

	let worker_bin = args.worker_bin.clone().unwrap_or_else(|| sibling_binary("cpool-worker"));

	let (tx, mut rx) = mpsc::unbounded_channel();
	let mut slots: HashMap<usize, Arc<Mutex<Child>>> = HashMap::new();
	let mut next_slot = 0usize;

	for _ in 0..args.numproc {
		spawn_slot(next_slot, &worker_bin, &args.sockname, args.version_serial, args.multitenant, &mut slots, tx.clone())?;
		next_slot += 1;
	}

	tracing::info!(numproc = args.numproc, version = args.version_serial, "template up, supervising workers");

	let mut sigterm = signal(SignalKind::terminate())?;

	loop {
		tokio::select! {
			_ = sigterm.recv() => {
				tracing::info!("template received SIGTERM, stopping all workers");
				for (_, child) in slots.drain() {
					let _ = child.lock().await.start_kill();
				}
				return Ok(());
			}
			next = rx.recv() => {
				let Some((slot, status)) = next else { continue };
				slots.remove(&slot);
				if status.as_ref().map(ExitStatus::success).unwrap_or(false) {
					tracing::info!(slot, "worker exited intentionally, not respawning");
				} else {
					tracing::warn!(slot, ?status, "worker exited unexpectedly, respawning");
					spawn_slot(next_slot, &worker_bin, &args.sockname, args.version_serial, args.multitenant, &mut slots, tx.clone())?;
					next_slot += 1;
				}
			}
		}
	}
}

fn spawn_slot(
	slot: usize,
	worker_bin: &PathBuf,
	sockname: &PathBuf,
	version_serial: u64,
	multitenant: bool,
	slots: &mut HashMap<usize, Arc<Mutex<Child>>>,
	tx: ExitTx,
) -> std::io::Result<()> {
	let mut command = Command::new(worker_bin);
	command
		.arg("--sockname")
		.arg(sockname)
		.arg("--version-serial")
		.arg(version_serial.to_string());
	if multitenant {
		command.arg("--multitenant");
	}
	let child = command.kill_on_drop(true).spawn()?;
	let handle = Arc::new(Mutex::new(child));
	slots.insert(slot, Arc::clone(&handle));
	tokio::spawn(async move {
		let status = handle.lock().await.wait().await;
		let _ = tx.send((slot, status));
	});
	Ok(())
}

fn sibling_binary(name: &str) -> PathBuf {
	let mut path = std::env::current_exe().unwrap_or_else(|_| PathBuf::from(name));
	path.set_file_name(name);
	path
}
