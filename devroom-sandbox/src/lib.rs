//! devroom-sandbox: per-project execution sandboxes.
//!
//! A sandbox holds one mounted file tree and at most one live run process.
//! [`SandboxController`] owns every project's [`Sandbox`] and publishes
//! lifecycle events (state changes, preview addresses, failures).
//!
//! - [`runtime`]: the runtime boundary (`mount`, `spawn`, `kill`, server-ready events)
//! - [`local`]: a runtime backed by a host directory and child processes
//! - [`state`]: the sandbox state machine
//! - [`controller`]: install → run pipeline and process supervision
//! - `testing` (feature `testing`): a scripted in-memory runtime for tests

pub mod controller;
pub mod error;
pub mod local;
pub mod runtime;
pub mod state;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use controller::{
    PreviewAddress, RunOutcome, Sandbox, SandboxConfig, SandboxController, SandboxEvent,
    SandboxEventKind, SandboxSnapshot,
};
pub use error::{RuntimeError, SandboxError, SpawnError};
pub use local::{LocalRuntime, LocalRuntimeFactory};
pub use runtime::{
    KillSwitch, OutputLine, OutputStream, ProcessHandle, ProcessId, RuntimeEvent, RuntimeFactory,
    SandboxRuntime,
};
pub use state::SandboxState;
