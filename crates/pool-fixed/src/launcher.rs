//! Spawning and waiting on the template process, abstracted behind a trait
//! so tests can stand in an in-process fake instead of a real subprocess —
//! the same shape as the teacher's `LspLauncher`/`ProcessLauncher` split
//! (`crates/broker/broker/src/launcher.rs`).

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;

/// Spawns the template process that, in turn, connects this pool's
/// workers to its socket.
#[async_trait]
pub trait TemplateLauncher: Send + Sync + 'static {
	/// Launch a template that will bring up `pool_size` workers on
	/// `socket_path`, each reporting `version` as its version-serial
	/// handshake value.
	async fn launch(
		&self,
		socket_path: &Path,
		pool_size: usize,
		version: u64,
	) -> std::io::Result<Box<dyn TemplateHandle>>;
}

/// A handle on one running template, real or faked.
#[async_trait]
pub trait TemplateHandle: Send {
	/// Resolve once the template has exited, for any reason. A handle
	/// whose template never exits on its own may simply never resolve.
	async fn wait(&mut self) -> std::io::Result<()>;

	/// Terminate the template (and, transitively, any workers still
	/// attached to it) without waiting for a natural exit.
	async fn kill(&mut self);
}

/// Spawns the real `bin/template` binary as a child process.
pub struct ProcessTemplateLauncher {
	pub template_bin: PathBuf,
	/// Forward `--multitenant` to the template (and transitively to every
	/// worker it spawns), for a template supervising the inner pool behind
	/// a multi-tenant broker (spec §4.8) rather than a plain `cpool-pool`.
	pub multitenant: bool,
}

impl ProcessTemplateLauncher {
	#[must_use]
	pub fn new(template_bin: impl Into<PathBuf>) -> Self {
		Self {
			template_bin: template_bin.into(),
			multitenant: false,
		}
	}

	#[must_use]
	pub fn with_multitenant(mut self, multitenant: bool) -> Self {
		self.multitenant = multitenant;
		self
	}
}

#[async_trait]
impl TemplateLauncher for ProcessTemplateLauncher {
	async fn launch(
		&self,
		socket_path: &Path,
		pool_size: usize,
		version: u64,
	) -> std::io::Result<Box<dyn TemplateHandle>> {
		let mut command = Command::new(&self.template_bin);
		command
			.arg("--sockname")
			.arg(socket_path)
			.arg("--numproc")
			.arg(pool_size.to_string())
			.arg("--version-serial")
			.arg(version.to_string());
		if self.multitenant {
			command.arg("--multitenant");
		}
		let child = command.kill_on_drop(true).spawn()?;
		Ok(Box::new(ProcessTemplateHandle { child }))
	}
}

struct ProcessTemplateHandle {
	child: tokio::process::Child,
}

#[async_trait]
impl TemplateHandle for ProcessTemplateHandle {
	async fn wait(&mut self) -> std::io::Result<()> {
		let status = self.child.wait().await?;
		tracing::info!(?status, "template process exited");
		Ok(())
	}

	async fn kill(&mut self) {
		let _ = self.child.kill().await;
	}
}
