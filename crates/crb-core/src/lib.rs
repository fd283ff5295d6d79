//! Core domain + application logic for the code-runner bot.
//!
//! This crate is framework-agnostic. The chat transport, the remote execution
//! service and the local interpreter live behind ports (traits) implemented in
//! adapter crates.

pub mod config;
pub mod domain;
pub mod errors;
pub mod execution;
pub mod extract;
pub mod formatting;
pub mod logging;
pub mod messaging;
pub mod sandbox;

pub use errors::{Error, ExecutionError, Result, SandboxError};
