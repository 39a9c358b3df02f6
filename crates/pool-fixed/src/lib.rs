//! Fixed-size pool (spec §4.5): a template process is spawned once and
//! connects exactly `pool_size` workers to the pool's socket; the pool
//! accepts their handshakes, discards stragglers from a superseded
//! template by version-serial, and restarts the template if it exits.
//!
//! Layered directly on [`cpool_pool::Pool`] — this crate owns process
//! lifecycle only, the call dispatch and state-sync bookkeeping stay in
//! `cpool-pool`.

mod fixed_pool;
mod launcher;

pub use fixed_pool::FixedPool;
pub use launcher::{ProcessTemplateLauncher, TemplateHandle, TemplateLauncher};
