//! The worker process dispatch loop (spec §4.3): connect, handshake,
//! then for each framed request decode `(operation, preamble, args)`,
//! dispatch, and reply with the same request id.

use std::path::Path;

use cpool_proto::{CallEnvelope, Reply};
use cpool_transport::DEFAULT_MAX_FRAME_LEN;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{SignalKind, signal};

use crate::agent::Agent;
use crate::compiler::Compiler;

/// Why a worker's dispatch loop stopped.
///
/// Distinguishing `Sigint` from everything else is what lets a process
/// supervisor (the fixed pool's template) tell an intentional, one-off
/// removal apart from a crash: spec §6's signal table has SIGTERM/SIGKILL
/// trigger a restart but SIGINT not, yet both are caught here and produce
/// an orderly exit from the worker's own point of view. `bin/worker` maps
/// this back into a process exit code a supervisor can observe without
/// needing to inspect which signal actually arrived.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownReason {
	/// The pool's connection closed or a frame failed to decode.
	ConnectionLost,
	Sigterm,
	Sigint,
}

/// Connect to the pool's Unix socket at `socket_path`, handshake, and run
/// the dispatch loop until the connection is lost or a terminating signal
/// arrives.
///
/// Returns normally on SIGTERM or SIGINT (orderly exit, matching spec §4.3
/// and §6's signal table — whether the pool restarts this worker is a
/// decision made by the *pool*, not here).
pub async fn run<C: Compiler>(socket_path: impl AsRef<Path>, compiler: C) -> std::io::Result<ShutdownReason> {
	let stream = cpool_transport::connect(socket_path).await?;
	let (reader, writer) = stream.into_split();
	run_on(reader, writer, compiler).await
}

/// Same as [`run`], but over an already-connected stream split in two —
/// used directly by tests and by the multi-tenant worker, which dials a
/// broker instead of a bare pool socket.
pub async fn run_on<R, W, C>(reader: R, writer: W, compiler: C) -> std::io::Result<ShutdownReason>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
	C: Compiler,
{
	run_on_with_pid(reader, writer, compiler, std::process::id() as u64).await
}

/// Same as [`run_on`], but with the handshake pid supplied by the caller
/// instead of read from `std::process::id()`. The real worker binary never
/// needs this; it exists so an in-process test double (several fake
/// workers sharing one OS process) can still report distinct, stable pids
/// the way a pool's worker-process bookkeeping expects.
pub async fn run_on_with_pid<R, W, C>(mut reader: R, mut writer: W, compiler: C, pid: u64) -> std::io::Result<ShutdownReason>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
	C: Compiler,
{
	cpool_transport::write_handshake(&mut writer, pid).await.map_err(std::io::Error::other)?;
	dispatch_loop(reader, writer, compiler).await
}

/// A worker process spawned by a fixed-pool template (spec §4.5): the same
/// `run_on` handshake, plus a trailing `u64 be` version-serial so the pool
/// can kill outdated workers from a superseded template on arrival.
///
/// Not part of the core handshake (spec §4.1 defines that as pid-only) —
/// the version-serial only exists between a template and the fixed pool
/// that spawned it, so it rides immediately after the core handshake
/// rather than inside it.
pub async fn run_on_versioned<R, W, C>(
	mut reader: R,
	mut writer: W,
	compiler: C,
	version_serial: u64,
) -> std::io::Result<ShutdownReason>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
	C: Compiler,
{
	cpool_transport::write_handshake(&mut writer, std::process::id() as u64)
		.await
		.map_err(std::io::Error::other)?;
	writer.write_u64(version_serial).await?;
	writer.flush().await?;
	dispatch_loop(reader, writer, compiler).await
}

async fn dispatch_loop<R, W, C>(mut reader: R, mut writer: W, compiler: C) -> std::io::Result<ShutdownReason>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
	C: Compiler,
{
	let agent = Agent::new(compiler);
	let mut sigterm = signal(SignalKind::terminate())?;
	let mut sigint = signal(SignalKind::interrupt())?;

	loop {
		tokio::select! {
			frame = cpool_transport::read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN) => {
				let (request_id, payload) = match frame {
					Ok(f) => f,
					Err(err) => {
						tracing::debug!(error = %err, "pool connection lost");
						return Ok(ShutdownReason::ConnectionLost);
					}
				};

				let reply = match postcard::from_bytes::<CallEnvelope>(&payload) {
					Ok(call) => agent.dispatch(&call),
					Err(err) => Reply::SerializationFailure { trace: err.to_string() },
				};

				let bytes = encode_reply(&reply);
				if cpool_transport::write_frame(&mut writer, request_id, &bytes).await.is_err() {
					return Ok(ShutdownReason::ConnectionLost);
				}
			}
			_ = sigterm.recv() => {
				tracing::info!("received SIGTERM, exiting");
				return Ok(ShutdownReason::Sigterm);
			}
			_ = sigint.recv() => {
				tracing::info!("received SIGINT, exiting (pool will not restart this worker)");
				return Ok(ShutdownReason::Sigint);
			}
		}
	}
}

fn encode_reply(reply: &Reply) -> Vec<u8> {
	match postcard::to_allocvec(reply) {
		Ok(bytes) => bytes,
		Err(err) => postcard::to_allocvec(&Reply::SerializationFailure { trace: err.to_string() })
			.expect("a plain SerializationFailure always encodes"),
	}
}
