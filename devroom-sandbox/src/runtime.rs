//! The isolated runtime a sandbox drives.
//!
//! A runtime can replace its filesystem with a tree, spawn processes with
//! streamable output, kill them, and announce when a spawned process starts
//! serving on a port.

use std::sync::Arc;

use async_trait::async_trait;
use devroom_sdk::{CommandSpec, FileTree};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{RuntimeError, SpawnError};

pub type ProcessId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub process: ProcessId,
    pub stream: OutputStream,
    pub line: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeEvent {
    /// A spawned process accepted connections on `port`.
    ServerReady {
        process: ProcessId,
        port: u16,
        url: String,
    },
}

/// Non-blocking kill signal for one process.
///
/// Firing the switch only requests termination; the process may still be
/// alive for a short while afterwards. Dropping an unfired switch also
/// requests termination.
#[derive(Debug)]
pub struct KillSwitch(Option<oneshot::Sender<()>>);

impl KillSwitch {
    pub fn new() -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (Self(Some(tx)), rx)
    }

    /// Request termination. Returns false if the switch already fired or the
    /// process is already gone.
    pub fn kill(&mut self) -> bool {
        match self.0.take() {
            Some(tx) => tx.send(()).is_ok(),
            None => false,
        }
    }
}

/// A spawned process.
#[derive(Debug)]
pub struct ProcessHandle {
    pub id: ProcessId,
    /// Interleaved stdout/stderr lines. Closed when both streams end.
    pub output: mpsc::Receiver<OutputLine>,
    /// Resolves with the exit code (`None` when killed by a signal).
    pub exit: oneshot::Receiver<Option<i32>>,
    pub kill: KillSwitch,
}

#[async_trait]
pub trait SandboxRuntime: Send + Sync {
    /// Replace the runtime's filesystem with `tree`.
    async fn mount(&self, tree: &FileTree) -> Result<(), RuntimeError>;

    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle, SpawnError>;

    /// Subscribe to runtime-internal events such as server-ready.
    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent>;

    /// Release everything the runtime holds (files, scratch state).
    async fn teardown(&self) -> Result<(), RuntimeError>;
}

/// Creates one runtime per project sandbox.
pub trait RuntimeFactory: Send + Sync {
    fn create(&self, project_id: &str) -> Result<Arc<dyn SandboxRuntime>, RuntimeError>;
}
