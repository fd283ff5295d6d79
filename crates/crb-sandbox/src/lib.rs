//! Local interpreter adapter.
//!
//! Runs untrusted Python in a hardened subprocess, either one-shot
//! ([`ProcessSandbox`], also exposed as an [`crb_core::execution::ExecutionBackend`]
//! through [`LocalBackend`]) or as a chat-driven REPL ([`InteractiveSession`]).

pub mod backend;
pub mod preamble;
pub mod process;
pub mod repl;

pub use backend::LocalBackend;
pub use process::{ProcessSandbox, SandboxSession};
pub use repl::InteractiveSession;
