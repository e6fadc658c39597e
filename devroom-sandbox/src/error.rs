use devroom_sdk::TreeError;

use crate::state::SandboxState;

/// A process could not be started (missing executable, permission, ...).
#[derive(Debug, thiserror::Error)]
#[error("failed to spawn `{command}`: {source}")]
pub struct SpawnError {
    pub command: String,
    #[source]
    pub source: std::io::Error,
}

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("invalid file tree: {0}")]
    Tree(#[from] TreeError),
    #[error("sandbox filesystem error: {0}")]
    Io(#[from] std::io::Error),
    #[error("runtime task failed: {0}")]
    Task(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("nothing is mounted in this sandbox")]
    NotMounted,
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    #[error("mount failed: {0}")]
    Mount(#[source] RuntimeError),
    #[error("run superseded by a newer run request")]
    Superseded,
    #[error("illegal sandbox transition {from} -> {to}")]
    IllegalTransition { from: SandboxState, to: SandboxState },
    #[error(transparent)]
    Runtime(RuntimeError),
}
