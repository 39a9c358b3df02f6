//! Run-state directory and socket path resolution.

use std::path::PathBuf;

/// Returns the Unix socket path a pool of the given `name` should bind or
/// connect to.
///
/// # Resolution order
///
/// 1. `CPOOL_RUN_DIR` environment variable, if set.
/// 2. `$XDG_RUNTIME_DIR/cpool/`.
/// 3. The system temp directory, under `cpool/`.
///
/// The socket file itself is named `<name>.sock`.
#[must_use]
pub fn socket_path(name: &str) -> PathBuf {
	run_dir().join(format!("{name}.sock"))
}

/// The run-state directory a pool's sockets live under, created if absent.
#[must_use]
pub fn run_dir() -> PathBuf {
	let dir = if let Ok(p) = std::env::var("CPOOL_RUN_DIR") {
		PathBuf::from(p)
	} else if let Ok(p) = std::env::var("XDG_RUNTIME_DIR") {
		PathBuf::from(p).join("cpool")
	} else {
		std::env::temp_dir().join("cpool")
	};
	let _ = std::fs::create_dir_all(&dir);
	dir
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn env_override_wins() {
		// SAFETY: test-local, no other thread in this crate's test binary
		// reads or writes CPOOL_RUN_DIR concurrently.
		unsafe {
			std::env::set_var("CPOOL_RUN_DIR", "/tmp/cpool-test-override");
		}
		assert_eq!(
			socket_path("broker"),
			PathBuf::from("/tmp/cpool-test-override/broker.sock")
		);
		unsafe {
			std::env::remove_var("CPOOL_RUN_DIR");
		}
	}
}
