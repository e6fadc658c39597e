//! Sandbox execution controller.
//!
//! Every project has at most one [`Sandbox`]. A sandbox owns its session
//! (mounted tree, install process, run process, preview address) and is the
//! only thing that mutates it.
//!
//! Run requests are serialized per sandbox with a generation counter: a new
//! `run` (or a `mount` during install) bumps the generation, kills whatever
//! the previous run had in flight and makes that call return
//! [`SandboxError::Superseded`]. Killing is a request, not a confirmation: the
//! replaced process may outlive its replacement's spawn by a short window.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use devroom_sdk::{CommandSpec, FileTree};
use serde::Serialize;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{Mutex, broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{SandboxError, SpawnError};
use crate::runtime::{
    KillSwitch, OutputLine, OutputStream, ProcessHandle, ProcessId, RuntimeEvent, RuntimeFactory,
    SandboxRuntime,
};
use crate::state::SandboxState;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PreviewAddress {
    pub port: u16,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SandboxEventKind {
    StateChanged(SandboxState),
    PreviewReady(PreviewAddress),
    /// The build step exited unsuccessfully. The start command still runs.
    BuildFailed { code: Option<i32> },
    /// The current run process exited on its own.
    ProcessExited { code: Option<i32> },
    RunFailed { error: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxEvent {
    pub project_id: String,
    pub kind: SandboxEventKind,
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    /// Recent output lines kept per sandbox.
    pub output_buffer_lines: usize,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            output_buffer_lines: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxSnapshot {
    pub project_id: String,
    pub state: SandboxState,
    pub preview: Option<PreviewAddress>,
    pub generation: u64,
    pub mounted_files: Vec<String>,
    pub install_command: Option<String>,
    pub run_command: Option<String>,
    pub recent_output: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunOutcome {
    pub process: ProcessId,
    pub generation: u64,
}

struct ActiveProcess {
    id: ProcessId,
    command: String,
    kill: KillSwitch,
}

#[derive(Default)]
struct SandboxSession {
    state: SandboxState,
    mounted_tree: Option<FileTree>,
    generation: u64,
    install: Option<ActiveProcess>,
    run: Option<ActiveProcess>,
    preview: Option<PreviewAddress>,
    /// Ready signal that beat the run process's registration.
    early_ready: Option<(ProcessId, PreviewAddress)>,
}

struct Shared {
    project_id: String,
    session: Mutex<SandboxSession>,
    events: broadcast::Sender<SandboxEvent>,
    output: parking_lot::Mutex<VecDeque<String>>,
    output_limit: usize,
}

impl Shared {
    fn emit(&self, kind: SandboxEventKind) {
        let _ = self.events.send(SandboxEvent {
            project_id: self.project_id.clone(),
            kind,
        });
    }

    fn transition(
        &self,
        session: &mut SandboxSession,
        to: SandboxState,
    ) -> Result<(), SandboxError> {
        let from = session.state;
        if !from.can_transition_to(to) {
            return Err(SandboxError::IllegalTransition { from, to });
        }
        session.state = to;
        if from != to {
            tracing::info!(project = %self.project_id, %from, %to, "Sandbox state");
            self.emit(SandboxEventKind::StateChanged(to));
        }
        Ok(())
    }

    fn record_output(&self, line: &OutputLine) {
        let stream = match line.stream {
            OutputStream::Stdout => "stdout",
            OutputStream::Stderr => "stderr",
        };
        tracing::debug!(
            target: "devroom_sandbox::output",
            project = %self.project_id,
            process = line.process,
            stream,
            "{}",
            line.line
        );
        let mut buf = self.output.lock();
        if buf.len() >= self.output_limit {
            buf.pop_front();
        }
        buf.push_back(line.line.clone());
    }

    fn pipe_output(self: &Arc<Self>, mut output: mpsc::Receiver<OutputLine>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(line) = output.recv().await {
                shared.record_output(&line);
            }
        });
    }

    fn watch_exit(self: &Arc<Self>, process: ProcessId, exit: oneshot::Receiver<Option<i32>>) {
        let shared = Arc::clone(self);
        tokio::spawn(async move {
            let code = exit.await.unwrap_or(None);
            shared.on_run_exit(process, code).await;
        });
    }

    async fn on_run_exit(&self, process: ProcessId, code: Option<i32>) {
        let mut s = self.session.lock().await;
        if s.run.as_ref().map(|p| p.id) != Some(process) {
            tracing::debug!(project = %self.project_id, process, "Replaced process exited");
            return;
        }
        s.run = None;
        s.preview = None;
        tracing::warn!(project = %self.project_id, process, ?code, "Run process exited");
        if let Err(e) = self.transition(&mut s, SandboxState::Mounted) {
            tracing::warn!(project = %self.project_id, "{e}");
        }
        self.emit(SandboxEventKind::ProcessExited { code });
    }

    async fn on_server_ready(&self, process: ProcessId, address: PreviewAddress) {
        let mut s = self.session.lock().await;
        match s.run.as_ref().map(|p| p.id) {
            Some(current) if current == process => self.publish_ready(&mut s, address),
            current => {
                if current.is_none_or(|id| process > id) {
                    s.early_ready = Some((process, address));
                }
            }
        }
    }

    fn publish_ready(&self, s: &mut SandboxSession, address: PreviewAddress) {
        s.preview = Some(address.clone());
        if s.state == SandboxState::Running
            && let Err(e) = self.transition(s, SandboxState::Ready)
        {
            tracing::warn!(project = %self.project_id, "{e}");
        }
        tracing::info!(project = %self.project_id, url = %address.url, "Preview ready");
        self.emit(SandboxEventKind::PreviewReady(address));
    }

    async fn spawn_failed(&self, generation: u64, err: SpawnError) -> SandboxError {
        let mut s = self.session.lock().await;
        if s.generation == generation {
            s.install = None;
            if let Err(e) = self.transition(&mut s, SandboxState::Mounted) {
                tracing::warn!(project = %self.project_id, "{e}");
            }
            self.emit(SandboxEventKind::RunFailed {
                error: err.to_string(),
            });
        }
        tracing::warn!(project = %self.project_id, "{err}");
        SandboxError::Spawn(err)
    }
}

/// One project's sandbox.
pub struct Sandbox {
    runtime: Arc<dyn SandboxRuntime>,
    shared: Arc<Shared>,
    ready_listener: JoinHandle<()>,
}

impl Drop for Sandbox {
    fn drop(&mut self) {
        self.ready_listener.abort();
    }
}

impl Sandbox {
    pub fn new(
        project_id: &str,
        runtime: Arc<dyn SandboxRuntime>,
        events: broadcast::Sender<SandboxEvent>,
        config: &SandboxConfig,
    ) -> Self {
        let shared = Arc::new(Shared {
            project_id: project_id.to_string(),
            session: Mutex::new(SandboxSession::default()),
            events,
            output: parking_lot::Mutex::new(VecDeque::new()),
            output_limit: config.output_buffer_lines.max(1),
        });

        let mut runtime_events = runtime.subscribe();
        let listener_shared = Arc::clone(&shared);
        let ready_listener = tokio::spawn(async move {
            loop {
                match runtime_events.recv().await {
                    Ok(RuntimeEvent::ServerReady { process, port, url }) => {
                        listener_shared
                            .on_server_ready(process, PreviewAddress { port, url })
                            .await;
                    }
                    Err(RecvError::Lagged(n)) => {
                        tracing::warn!(project = %listener_shared.project_id, "Missed {n} runtime events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Self {
            runtime,
            shared,
            ready_listener,
        }
    }

    pub fn project_id(&self) -> &str {
        &self.shared.project_id
    }

    pub async fn state(&self) -> SandboxState {
        self.shared.session.lock().await.state
    }

    pub async fn preview(&self) -> Option<PreviewAddress> {
        self.shared.session.lock().await.preview.clone()
    }

    pub async fn mounted_tree(&self) -> Option<FileTree> {
        self.shared.session.lock().await.mounted_tree.clone()
    }

    /// Replace the sandbox filesystem with `tree`. Never merges.
    ///
    /// An install in flight is superseded; a live run process keeps running
    /// until the next `run` replaces it.
    pub async fn mount(&self, tree: FileTree) -> Result<(), SandboxError> {
        tree.validate()
            .map_err(|e| SandboxError::Mount(e.into()))?;

        let shared = &self.shared;
        let mut s = shared.session.lock().await;
        if s.state == SandboxState::Installing {
            s.generation += 1;
            if let Some(mut install) = s.install.take() {
                tracing::info!(project = %shared.project_id, process = install.id, "Mount supersedes install");
                install.kill.kill();
            }
        }

        if let Err(e) = self.runtime.mount(&tree).await {
            if s.state == SandboxState::Installing && s.mounted_tree.is_some() {
                shared.transition(&mut s, SandboxState::Mounted)?;
            }
            return Err(SandboxError::Mount(e));
        }

        tracing::info!(project = %shared.project_id, files = tree.file_count(), "Mounted file tree");
        s.mounted_tree = Some(tree);
        shared.transition(&mut s, SandboxState::Mounted)
    }

    /// Run the optional build step to completion, then launch `start`.
    ///
    /// Any previous run process is killed first (without waiting for it to
    /// exit). Build failures are reported but do not stop the start step;
    /// spawn failures fail the call and leave the sandbox `Mounted`.
    pub async fn run(
        &self,
        build: Option<&CommandSpec>,
        start: &CommandSpec,
    ) -> Result<RunOutcome, SandboxError> {
        let shared = &self.shared;
        let generation = {
            let mut s = shared.session.lock().await;
            if !s.state.accepts_run() {
                return Err(SandboxError::NotMounted);
            }
            s.generation += 1;
            if let Some(mut install) = s.install.take() {
                tracing::info!(project = %shared.project_id, process = install.id, "Superseding in-flight install");
                install.kill.kill();
            }
            if let Some(mut previous) = s.run.take() {
                tracing::info!(project = %shared.project_id, process = previous.id, "Replacing run process");
                previous.kill.kill();
            }
            s.preview = None;
            s.early_ready = None;
            shared.transition(&mut s, SandboxState::Installing)?;
            s.generation
        };

        if let Some(build) = build {
            let ProcessHandle {
                id,
                output,
                exit,
                mut kill,
            } = match self.runtime.spawn(build).await {
                Ok(handle) => handle,
                Err(e) => return Err(shared.spawn_failed(generation, e).await),
            };
            shared.pipe_output(output);
            {
                let mut s = shared.session.lock().await;
                if s.generation != generation {
                    kill.kill();
                    return Err(SandboxError::Superseded);
                }
                s.install = Some(ActiveProcess {
                    id,
                    command: build.to_string(),
                    kill,
                });
            }

            let code = exit.await.unwrap_or(None);
            let mut s = shared.session.lock().await;
            if s.generation != generation {
                return Err(SandboxError::Superseded);
            }
            s.install = None;
            if code != Some(0) {
                tracing::warn!(project = %shared.project_id, command = %build, ?code, "Build step failed");
                shared.emit(SandboxEventKind::BuildFailed { code });
            }
        }

        let ProcessHandle {
            id,
            output,
            exit,
            mut kill,
        } = match self.runtime.spawn(start).await {
            Ok(handle) => handle,
            Err(e) => return Err(shared.spawn_failed(generation, e).await),
        };
        shared.pipe_output(output);
        {
            let mut s = shared.session.lock().await;
            if s.generation != generation {
                kill.kill();
                return Err(SandboxError::Superseded);
            }
            s.run = Some(ActiveProcess {
                id,
                command: start.to_string(),
                kill,
            });
            shared.transition(&mut s, SandboxState::Running)?;
            if let Some((early, address)) = s.early_ready.take()
                && early == id
            {
                shared.publish_ready(&mut s, address);
            }
        }
        shared.watch_exit(id, exit);

        tracing::info!(project = %shared.project_id, process = id, command = %start, generation, "Run process started");
        Ok(RunOutcome {
            process: id,
            generation,
        })
    }

    /// Kill everything, drop the mounted tree and return to `Idle`.
    pub async fn teardown(&self) -> Result<(), SandboxError> {
        {
            let shared = &self.shared;
            let mut s = shared.session.lock().await;
            s.generation += 1;
            for mut process in [s.install.take(), s.run.take()].into_iter().flatten() {
                process.kill.kill();
            }
            s.preview = None;
            s.early_ready = None;
            s.mounted_tree = None;
            shared.transition(&mut s, SandboxState::Idle)?;
        }
        self.runtime.teardown().await.map_err(SandboxError::Runtime)
    }

    pub async fn snapshot(&self) -> SandboxSnapshot {
        let s = self.shared.session.lock().await;
        SandboxSnapshot {
            project_id: self.shared.project_id.clone(),
            state: s.state,
            preview: s.preview.clone(),
            generation: s.generation,
            mounted_files: s
                .mounted_tree
                .as_ref()
                .map(FileTree::paths)
                .unwrap_or_default(),
            install_command: s.install.as_ref().map(|p| p.command.clone()),
            run_command: s.run.as_ref().map(|p| p.command.clone()),
            recent_output: self.shared.output.lock().iter().cloned().collect(),
        }
    }
}

/// Owns every project's sandbox and the shared event stream.
pub struct SandboxController {
    factory: Arc<dyn RuntimeFactory>,
    config: SandboxConfig,
    sandboxes: parking_lot::Mutex<HashMap<String, Arc<Sandbox>>>,
    events: broadcast::Sender<SandboxEvent>,
}

impl SandboxController {
    pub fn new(factory: Arc<dyn RuntimeFactory>, config: SandboxConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            factory,
            config,
            sandboxes: parking_lot::Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SandboxEvent> {
        self.events.subscribe()
    }

    pub fn get(&self, project_id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.lock().get(project_id).cloned()
    }

    /// The project's sandbox, created on first use.
    pub fn sandbox(&self, project_id: &str) -> Result<Arc<Sandbox>, SandboxError> {
        let mut sandboxes = self.sandboxes.lock();
        if let Some(existing) = sandboxes.get(project_id) {
            return Ok(Arc::clone(existing));
        }
        let runtime = self
            .factory
            .create(project_id)
            .map_err(SandboxError::Runtime)?;
        let sandbox = Arc::new(Sandbox::new(
            project_id,
            runtime,
            self.events.clone(),
            &self.config,
        ));
        sandboxes.insert(project_id.to_string(), Arc::clone(&sandbox));
        tracing::info!(project = project_id, "Created sandbox");
        Ok(sandbox)
    }

    pub async fn mount(&self, project_id: &str, tree: FileTree) -> Result<(), SandboxError> {
        self.sandbox(project_id)?.mount(tree).await
    }

    pub async fn run(
        &self,
        project_id: &str,
        build: Option<&CommandSpec>,
        start: &CommandSpec,
    ) -> Result<RunOutcome, SandboxError> {
        let sandbox = self.get(project_id).ok_or(SandboxError::NotMounted)?;
        sandbox.run(build, start).await
    }

    pub async fn state(&self, project_id: &str) -> SandboxState {
        match self.get(project_id) {
            Some(sandbox) => sandbox.state().await,
            None => SandboxState::Idle,
        }
    }

    pub async fn snapshot(&self, project_id: &str) -> Option<SandboxSnapshot> {
        let sandbox = self.get(project_id)?;
        Some(sandbox.snapshot().await)
    }

    /// Tear the project's sandbox down and forget it.
    pub async fn teardown(&self, project_id: &str) -> Result<(), SandboxError> {
        let removed = self.sandboxes.lock().remove(project_id);
        match removed {
            Some(sandbox) => sandbox.teardown().await,
            None => Ok(()),
        }
    }

    pub fn projects(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sandboxes.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}
