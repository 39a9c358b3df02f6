//! The on-demand adaptive pool (spec §4.6): starts with `floor` workers
//! spawned directly (no template indirection), grows one at a time toward
//! `ceiling` when callers wait on an empty idle queue, and shrinks the
//! least-recently-used workers back to `floor` after a quiet period.
//!
//! Layered on [`cpool_pool::Pool`] exactly as `cpool-pool-fixed` is — this
//! crate owns worker process lifecycle and the grow/shrink timers, not
//! call dispatch.

mod adaptive_pool;
mod spawner;

pub use adaptive_pool::AdaptivePool;
pub use spawner::{ProcessWorkerSpawner, WorkerHandle, WorkerSpawner};
