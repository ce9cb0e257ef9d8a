//! The cook daemon library: build queue, per-build executor, and the
//! collaborator seams the daemon binary wires together.

pub mod cache;
pub mod collaborators;
pub mod executor;
pub mod logsink;
pub mod oven;
pub mod queue;
pub mod recipe;
pub mod server;
pub mod workspace;

pub use executor::{BuildExecutor, ExecutorDeps};
pub use queue::{BuildHandler, BuildRequest, WorkerPool, WorkerState};
