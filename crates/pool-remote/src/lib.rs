//! A pool whose workers live behind one broker connection instead of
//! locally-spawned processes (spec §4.7). Reuses `cpool-pool`'s public
//! request/outcome types so callers can treat this, `cpool-pool-fixed`, and
//! `cpool-pool-adaptive` interchangeably; builds its own thin wire-call and
//! state-sync-cache machinery since `cpool-pool`'s `Pool`/`WorkerView` are
//! shaped around selecting among many interchangeable workers, which
//! doesn't apply to a single multiplexed connection.

mod preamble;
mod remote_pool;

pub use remote_pool::{InitArgs, RemotePool};
