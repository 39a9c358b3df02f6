//! The worker process dispatch loop in multi-tenant mode: the same framed
//! handshake-then-serve shape as [`crate::run`], decoding each frame as a
//! [`cpool_proto::CallForClient`] instead of a bare `CallEnvelope`.

use cpool_proto::{CallForClient, Reply};
use cpool_transport::DEFAULT_MAX_FRAME_LEN;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::signal::unix::{SignalKind, signal};

use crate::compiler::Compiler;
use crate::multitenant_agent::MultiTenantAgent;
use crate::run::ShutdownReason;

/// Same as [`crate::run_on`], but for a worker running behind a
/// multi-tenant broker: decodes `CallForClient` frames and dispatches
/// through a [`MultiTenantAgent`].
pub async fn run_multitenant_on<R, W, C>(reader: R, writer: W, compiler: C) -> std::io::Result<ShutdownReason>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
	C: Compiler,
{
	run_multitenant_on_with_pid(reader, writer, compiler, std::process::id() as u64).await
}

pub async fn run_multitenant_on_with_pid<R, W, C>(
	mut reader: R,
	mut writer: W,
	compiler: C,
	pid: u64,
) -> std::io::Result<ShutdownReason>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
	C: Compiler,
{
	cpool_transport::write_handshake(&mut writer, pid).await.map_err(std::io::Error::other)?;
	mt_dispatch_loop(reader, writer, compiler).await
}

/// Same as [`crate::run_on_versioned`], multi-tenant variant: used when the
/// broker's inner worker pool spawns workers through the same
/// version-serial-gated template mechanism as a fixed pool.
pub async fn run_multitenant_on_versioned<R, W, C>(
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
	mt_dispatch_loop(reader, writer, compiler).await
}

async fn mt_dispatch_loop<R, W, C>(mut reader: R, mut writer: W, compiler: C) -> std::io::Result<ShutdownReason>
where
	R: AsyncRead + Unpin,
	W: AsyncWrite + Unpin,
	C: Compiler,
{
	let agent = MultiTenantAgent::new(compiler);
	let mut sigterm = signal(SignalKind::terminate())?;
	let mut sigint = signal(SignalKind::interrupt())?;

	loop {
		tokio::select! {
			frame = cpool_transport::read_frame(&mut reader, DEFAULT_MAX_FRAME_LEN) => {
				let (request_id, payload) = match frame {
					Ok(f) => f,
					Err(err) => {
						tracing::debug!(error = %err, "broker connection lost");
						return Ok(ShutdownReason::ConnectionLost);
					}
				};

				let reply = match postcard::from_bytes::<CallForClient>(&payload) {
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
