//! Multi-tenant broker (spec §4.8): a standalone process that accepts many
//! external clients over HMAC-authenticated framed TCP, assigns each a
//! monotonic `client_id`, and fans their compile calls out across an inner
//! fixed-shape pool of worker processes that partition their cache by
//! tenant.

mod broker_pool;
mod client_state;
mod hmac_auth;
mod server;
mod session;
mod tenant_cache;
mod worker_handle;
mod worker_pool;

pub use broker_pool::{BrokerPool, TenantRequest, TenantTxRequest};
pub use hmac_auth::{HmacError, SharedSecret, MAC_LEN};
pub use server::ClientServer;
pub use session::ClientRegistry;
pub use worker_handle::MultiTenantWorkerHandle;
pub use worker_pool::TenantWorkerPool;
