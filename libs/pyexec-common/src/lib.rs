//! Shared model and plumbing for the Python execution service.
//!
//! Both the server (admission, queue, workers) and the CLI depend on this
//! crate so that job payloads, Redis keys and screening rules never drift
//! between them.

pub mod config;
pub mod redis;
pub mod screening;
pub mod types;
