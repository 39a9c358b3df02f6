//! The in-process side of a worker: dispatch logic grounded in spec §4.3,
//! plus the black-box compiler seam and the socket-facing run loop.

mod agent;
mod compiler;
mod mt_run;
mod multitenant_agent;
mod run;

pub use agent::Agent;
pub use compiler::{CompileContext, Compiler, CompilerError, StubCompiler};
pub use mt_run::{run_multitenant_on, run_multitenant_on_versioned, run_multitenant_on_with_pid};
pub use multitenant_agent::MultiTenantAgent;
pub use run::{ShutdownReason, run, run_on, run_on_versioned, run_on_with_pid};
