//! The pool base (spec §4.4): per-worker state tracking, the state-sync
//! preamble, and the `compile*` dispatch family. Does not itself spawn or
//! supervise worker processes — `cpool-pool-fixed` and
//! `cpool-pool-adaptive` build worker lifecycle on top of [`Pool`], and
//! `cpool-pool-remote` adapts the same shape to a single TCP connection to
//! a broker.

mod error;
mod pool;
mod transport;
mod worker_view;

pub use error::PoolError;
pub use pool::{Pool, Request, TxOutcome, TxRequest};
pub use transport::WorkerTransport;
pub use worker_view::{WantedState, WorkerView};
