//! Workspace coordinator.
//!
//! Human chat is echoed to the bus immediately. When the message addresses
//! the AI the prompt goes to the directive generator on its own task, so a
//! slow model never holds up the channel. The directive comes back as an
//! AI-sender message; if it carries a file tree, that tree is stored and
//! mounted. Running is always an explicit request.
//!
//! Tree changes and sandbox lifecycle steps for one project take turns on a
//! per-project lock, so the store and the sandbox end up on the same tree as
//! the last message the channel saw. A project without participants gets no
//! sandbox: its trees are stored, not mounted, and run requests are refused.

use std::collections::HashMap;
use std::sync::Arc;

use devroom_agent::{DirectiveGenerator, UpstreamError};
use devroom_sandbox::{
    RunOutcome, SandboxController, SandboxError, SandboxEvent, SandboxEventKind, SandboxSnapshot,
    SandboxState,
};
use devroom_sdk::event::AI_SENDER_ID;
use devroom_sdk::{
    CommandSpec, Directive, FileTree, ProjectMessage, SandboxStatus, SenderInfo, ServerEvent,
    TreeError,
};
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

use crate::bus::{ChannelJoinError, ConnectionId, Membership, SyncBus};
use crate::config::ServerConfig;
use crate::gate::{CredentialSource, Identity, SessionGate, Unauthorized};
use crate::store::{StoredCommands, StoredTree, TreeStore};

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("invalid file tree: {0}")]
    Tree(#[from] TreeError),
    #[error("tree store: {0}")]
    Store(#[from] rusqlite::Error),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error("no start command: the request, the last directive and the defaults are all empty")]
    NoStartCommand,
    #[error("nobody is connected to this project")]
    NoParticipants,
}

/// One async lock per project, dropped from the map once nobody holds or
/// waits for it.
#[derive(Default)]
struct ProjectLocks(Mutex<HashMap<String, Arc<AsyncMutex<()>>>>);

impl ProjectLocks {
    async fn acquire(&self, project_id: &str) -> ProjectTurn<'_> {
        let lock = Arc::clone(self.0.lock().entry(project_id.to_string()).or_default());
        let guard = Arc::clone(&lock).lock_owned().await;
        ProjectTurn {
            locks: self,
            project_id: project_id.to_string(),
            lock,
            guard: Some(guard),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.0.lock().len()
    }
}

struct ProjectTurn<'a> {
    locks: &'a ProjectLocks,
    project_id: String,
    lock: Arc<AsyncMutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for ProjectTurn<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.0.lock();
        // Two references left: the map's and ours. Nobody else is waiting.
        if locks
            .get(&self.project_id)
            .is_some_and(|l| Arc::ptr_eq(l, &self.lock) && Arc::strong_count(l) == 2)
        {
            locks.remove(&self.project_id);
        }
    }
}

/// What `send` did with a human message.
pub struct SendReceipt {
    /// The echoed message; `None` if the channel is gone.
    pub message: Option<ProjectMessage>,
    /// The AI turn, when the message addressed the AI.
    pub ai_turn: Option<JoinHandle<()>>,
}

pub struct Coordinator {
    gate: SessionGate,
    bus: SyncBus,
    generator: DirectiveGenerator,
    sandboxes: SandboxController,
    store: Mutex<TreeStore>,
    locks: ProjectLocks,
    ai_mention: Option<String>,
    default_build: Option<CommandSpec>,
    default_start: Option<CommandSpec>,
}

impl Coordinator {
    pub fn new(
        config: &ServerConfig,
        gate: SessionGate,
        generator: DirectiveGenerator,
        sandboxes: SandboxController,
        store: TreeStore,
    ) -> Self {
        Self {
            gate,
            bus: SyncBus::new(config.outbound_queue, config.history_limit),
            generator,
            sandboxes,
            store: Mutex::new(store),
            locks: ProjectLocks::default(),
            ai_mention: config.ai_mention.clone().filter(|m| !m.trim().is_empty()),
            default_build: config.default_build_command(),
            default_start: config.default_start_command(),
        }
    }

    pub fn gate(&self) -> &SessionGate {
        &self.gate
    }

    pub fn bus(&self) -> &SyncBus {
        &self.bus
    }

    pub fn sandboxes(&self) -> &SandboxController {
        &self.sandboxes
    }

    /// Authenticate a connection and join it to the project channel.
    pub async fn connect(
        &self,
        project_id: &str,
        credentials: CredentialSource<'_>,
    ) -> Result<Membership, ChannelJoinError> {
        let auth = self.gate.authenticate(credentials).await;
        if let Err(e) = &auth {
            tracing::info!(project = %project_id, reason = %e.reason, "Join refused");
        }
        self.bus.join(project_id, auth)
    }

    /// Drop a connection. The project's sandbox is torn down with its last
    /// participant.
    pub async fn disconnect(&self, project_id: &str, connection: ConnectionId) {
        let _turn = self.locks.acquire(project_id).await;
        if self.bus.leave(project_id, connection)
            && let Err(e) = self.sandboxes.teardown(project_id).await
        {
            tracing::warn!(project = %project_id, "Sandbox teardown failed: {e}");
        }
    }

    /// Log a session out.
    pub async fn logout(&self, credentials: CredentialSource<'_>) -> Result<Identity, Unauthorized> {
        let token = credentials
            .token()
            .ok_or(Unauthorized::from(crate::gate::AuthFailure::Missing))?;
        self.gate.revoke(token).await
    }

    /// The prompt a message carries for the AI, if it addresses the AI.
    pub fn prompt_for(&self, text: &str) -> Option<String> {
        let prompt = match &self.ai_mention {
            None => text.trim().to_string(),
            Some(mention) if text.contains(mention.as_str()) => {
                text.replace(mention.as_str(), " ").trim().to_string()
            }
            Some(_) => return None,
        };
        (!prompt.is_empty()).then_some(prompt)
    }

    /// Echo a human message and, when addressed, start an AI turn.
    pub fn send(self: &Arc<Self>, project_id: &str, from: &Identity, text: String) -> SendReceipt {
        let prompt = self.prompt_for(&text);
        let message = self.bus.broadcast(project_id, from.sender_info(), text);
        let ai_turn = match (&message, prompt) {
            (Some(echoed), Some(prompt)) => {
                let this = Arc::clone(self);
                let project_id = project_id.to_string();
                let reply_to = echoed.id.clone();
                Some(tokio::spawn(async move {
                    this.ai_turn(&project_id, &prompt, &reply_to).await;
                }))
            }
            _ => None,
        };
        SendReceipt { message, ai_turn }
    }

    async fn ai_turn(&self, project_id: &str, prompt: &str, reply_to: &str) {
        tracing::info!(project = %project_id, reply_to, "AI turn started");
        match self.generator.generate(prompt).await {
            Ok(directive) => self.apply_directive(project_id, directive).await,
            Err(e) => self.report_ai_failure(project_id, reply_to, &e),
        }
    }

    fn report_ai_failure(&self, project_id: &str, reply_to: &str, error: &UpstreamError) {
        tracing::warn!(project = %project_id, reply_to, "AI turn failed: {error}");
        self.bus.publish(
            project_id,
            ServerEvent::AiError {
                reply_to: reply_to.to_string(),
                error: error.to_string(),
            },
        );
    }

    async fn apply_directive(&self, project_id: &str, directive: Directive) {
        let _turn = self.locks.acquire(project_id).await;
        let delivered = self
            .bus
            .broadcast(project_id, SenderInfo::ai(), directive.to_payload())
            .is_some();

        if directive.build_command.is_some() || directive.start_command.is_some() {
            let commands = StoredCommands {
                build: directive.build_command.clone(),
                start: directive.start_command.clone(),
            };
            if let Err(e) = self.store.lock().save_commands(project_id, &commands) {
                tracing::error!(project = %project_id, "Failed to store commands: {e}");
            }
        }

        if let Some(tree) = directive.file_tree {
            if let Err(e) = self.store.lock().save_tree(project_id, &tree, AI_SENDER_ID) {
                tracing::error!(project = %project_id, "Failed to store tree: {e}");
            }
            if !delivered {
                tracing::info!(project = %project_id, "Channel closed before the AI answered; tree stored, not mounted");
                return;
            }
            if let Err(e) = self.sandboxes.mount(project_id, tree).await {
                tracing::warn!(project = %project_id, "Mounting AI tree failed: {e}");
                self.bus.publish(
                    project_id,
                    ServerEvent::SandboxStatus(SandboxStatus::RunFailed {
                        error: e.to_string(),
                    }),
                );
            }
        }
    }

    /// A collaborator replaced the whole tree.
    pub async fn update_tree(
        &self,
        project_id: &str,
        from: &Identity,
        tree: FileTree,
    ) -> Result<(), CoordinatorError> {
        tree.validate()?;
        let _turn = self.locks.acquire(project_id).await;
        self.store.lock().save_tree(project_id, &tree, &from.sub)?;
        if self.bus.participants(project_id).is_empty() {
            tracing::info!(project = %project_id, "No participants; tree stored, not mounted");
        } else {
            self.sandboxes.mount(project_id, tree.clone()).await?;
        }
        self.bus.publish(
            project_id,
            ServerEvent::FileTree {
                file_tree: tree,
                updated_by: from.sender_info(),
            },
        );
        Ok(())
    }

    /// Commands for a run. The start command comes from the request, then
    /// the last directive, then the configured defaults; the build step comes
    /// from the same place as the start command unless the request names one.
    pub fn resolve_commands(
        &self,
        project_id: &str,
        build: Option<CommandSpec>,
        start: Option<CommandSpec>,
    ) -> Result<(Option<CommandSpec>, CommandSpec), CoordinatorError> {
        if let Some(start) = start {
            return Ok((build, start));
        }
        let stored = self.store.lock().load_commands(project_id)?;
        let (fallback_build, start) = match stored.start {
            Some(start) => (stored.build, start),
            None => (
                self.default_build.clone(),
                self.default_start
                    .clone()
                    .ok_or(CoordinatorError::NoStartCommand)?,
            ),
        };
        Ok((build.or(fallback_build), start))
    }

    /// Explicit run request from a connected project. Mounts the stored
    /// tree first if the sandbox has nothing mounted.
    ///
    /// The project lock is released before the run itself, which lasts as
    /// long as the build step. A teardown that lands meanwhile supersedes it.
    pub async fn run(
        &self,
        project_id: &str,
        build: Option<CommandSpec>,
        start: Option<CommandSpec>,
    ) -> Result<RunOutcome, CoordinatorError> {
        let (build, start) = {
            let _turn = self.locks.acquire(project_id).await;
            if self.bus.participants(project_id).is_empty() {
                return Err(CoordinatorError::NoParticipants);
            }
            let commands = self.resolve_commands(project_id, build, start)?;
            if self.sandboxes.state(project_id).await == SandboxState::Idle {
                let stored = self.store.lock().load_tree(project_id)?;
                match stored {
                    Some(StoredTree { tree, .. }) => self.sandboxes.mount(project_id, tree).await?,
                    None => return Err(SandboxError::NotMounted.into()),
                }
            }
            commands
        };
        tracing::info!(project = %project_id, build = ?build.as_ref().map(ToString::to_string), start = %start, "Run requested");
        Ok(self.sandboxes.run(project_id, build.as_ref(), &start).await?)
    }

    /// Current tree: the stored one, else whatever the sandbox has mounted.
    pub async fn tree(&self, project_id: &str) -> Result<Option<FileTree>, CoordinatorError> {
        if let Some(stored) = self.store.lock().load_tree(project_id)? {
            return Ok(Some(stored.tree));
        }
        Ok(match self.sandboxes.get(project_id) {
            Some(sandbox) => sandbox.mounted_tree().await,
            None => None,
        })
    }

    pub async fn sandbox_snapshot(&self, project_id: &str) -> Option<SandboxSnapshot> {
        self.sandboxes.snapshot(project_id).await
    }

    /// Republish sandbox lifecycle events on the owning project's channel.
    pub fn spawn_sandbox_republisher(self: &Arc<Self>) -> JoinHandle<()> {
        let mut events = self.sandboxes.subscribe();
        let this = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(SandboxEvent { project_id, kind }) => {
                        this.bus
                            .publish(&project_id, ServerEvent::SandboxStatus(sandbox_status(kind)));
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!("Sandbox republisher missed {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

fn sandbox_status(kind: SandboxEventKind) -> SandboxStatus {
    match kind {
        SandboxEventKind::StateChanged(state) => SandboxStatus::StateChanged {
            state: state.to_string(),
        },
        SandboxEventKind::PreviewReady(address) => SandboxStatus::PreviewReady {
            port: address.port,
            url: address.url,
        },
        SandboxEventKind::BuildFailed { code } => SandboxStatus::BuildFailed { code },
        SandboxEventKind::ProcessExited { code } => SandboxStatus::ProcessExited { code },
        SandboxEventKind::RunFailed { error } => SandboxStatus::RunFailed { error },
    }
}
