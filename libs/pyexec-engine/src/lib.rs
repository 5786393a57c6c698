//! Execution backends and the batch runner.
//!
//! `Sandbox` is the seam: `DockerSandbox` is the production path,
//! `LocalSandbox` the subprocess fallback. `BatchRunner` picks one per batch
//! and drives every test case through it in order.

pub mod batch;
pub mod docker;
pub mod evaluator;
pub mod local;
pub mod runtime;
pub mod sandbox;

pub use batch::{BatchError, BatchRunner};
pub use docker::DockerSandbox;
pub use local::LocalSandbox;
pub use sandbox::{RunRequest, Sandbox};
