//! Wire types shared between the pool, the worker agent, and the
//! multi-tenant broker.
//!
//! Everything that crosses a process boundary in this workspace — a compile
//! request, a state-sync preamble, a tagged reply — is defined here so the
//! pool crates and the worker crate agree on one vocabulary.

mod blob;
mod error;
mod ids;
mod init;
mod ops;

pub mod paths;

pub use blob::{Blob, BlobGenerator, REUSE_LAST_STATE_MARKER};
pub use error::ErrorCode;
pub use ids::{ClientId, RequestId, StateId};
pub use init::InitRequest;
pub use ops::{
	CallEnvelope, CallForClient, ClientSchemaDiff, DatabaseState, DatabaseStateDiff, Operation,
	Preamble, Reply, TenantSchema, TxEnvelope,
};
