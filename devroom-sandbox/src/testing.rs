//! In-memory runtime with scripted process behaviour, for tests.
//!
//! Processes are decided by their command line:
//!
//! - `missing`: spawn fails with `NotFound`
//! - `false`: exits with code 1
//! - `true`, `echo ...`, or anything with an `install` argument: exits 0
//! - everything else (including `hang`): stays alive until killed or
//!   [`ScriptedRuntime::exit_process`] is called
//!
//! Nothing announces readiness on its own; call
//! [`ScriptedRuntime::announce_ready`]. Mounts complete at once unless
//! [`ScriptedRuntime::delay_next_mount`] slows one down.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use devroom_sdk::{CommandSpec, FileTree};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::error::{RuntimeError, SpawnError};
use crate::runtime::{
    KillSwitch, OutputLine, OutputStream, ProcessHandle, ProcessId, RuntimeEvent, RuntimeFactory,
    SandboxRuntime,
};

#[derive(Default)]
struct Script {
    mounts: Vec<FileTree>,
    spawned: Vec<String>,
    live: BTreeMap<ProcessId, oneshot::Sender<Option<i32>>>,
    torn_down: bool,
    next_mount_delay: Option<Duration>,
}

pub struct ScriptedRuntime {
    events: broadcast::Sender<RuntimeEvent>,
    next_id: AtomicU64,
    script: Arc<Mutex<Script>>,
}

impl ScriptedRuntime {
    pub fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(64);
        Arc::new(Self {
            events,
            next_id: AtomicU64::new(1),
            script: Arc::new(Mutex::new(Script::default())),
        })
    }

    /// A factory that hands this same runtime to every project.
    pub fn factory(self: &Arc<Self>) -> Arc<dyn RuntimeFactory> {
        Arc::new(SharedFactory(Arc::clone(self)))
    }

    pub fn mounted(&self) -> Option<FileTree> {
        self.script.lock().mounts.last().cloned()
    }

    pub fn mount_count(&self) -> usize {
        self.script.lock().mounts.len()
    }

    /// Command lines spawned so far, oldest first.
    pub fn spawned(&self) -> Vec<String> {
        self.script.lock().spawned.clone()
    }

    /// Long-lived processes that have not exited.
    pub fn live_processes(&self) -> Vec<ProcessId> {
        self.script.lock().live.keys().copied().collect()
    }

    /// Make the next mount take `delay` before it lands.
    pub fn delay_next_mount(&self, delay: Duration) {
        self.script.lock().next_mount_delay = Some(delay);
    }

    pub fn torn_down(&self) -> bool {
        self.script.lock().torn_down
    }

    pub fn announce_ready(&self, process: ProcessId, port: u16) {
        let _ = self.events.send(RuntimeEvent::ServerReady {
            process,
            port,
            url: format!("http://127.0.0.1:{port}"),
        });
    }

    /// Make a live process exit on its own with `code`.
    pub fn exit_process(&self, process: ProcessId, code: Option<i32>) {
        if let Some(exit) = self.script.lock().live.remove(&process) {
            let _ = exit.send(code);
        }
    }
}

fn scripted_exit(command: &CommandSpec) -> Option<i32> {
    match command.executable.as_str() {
        "false" => Some(1),
        "true" | "echo" => Some(0),
        _ if command.arguments.iter().any(|a| a == "install") => Some(0),
        _ => None,
    }
}

#[async_trait]
impl SandboxRuntime for ScriptedRuntime {
    async fn mount(&self, tree: &FileTree) -> Result<(), RuntimeError> {
        tree.validate()?;
        let delay = self.script.lock().next_mount_delay.take();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.script.lock().mounts.push(tree.clone());
        Ok(())
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle, SpawnError> {
        if command.executable == "missing" {
            return Err(SpawnError {
                command: command.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such executable"),
            });
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (output_tx, output_rx) = mpsc::channel(16);
        let (exit_tx, exit_rx) = oneshot::channel();
        let (kill, kill_rx) = KillSwitch::new();
        self.script.lock().spawned.push(command.to_string());

        let _ = output_tx.try_send(OutputLine {
            process: id,
            stream: OutputStream::Stdout,
            line: format!("$ {command}"),
        });

        match scripted_exit(command) {
            Some(code) => {
                let _ = exit_tx.send(Some(code));
            }
            None => {
                let (natural_tx, natural_rx) = oneshot::channel();
                self.script.lock().live.insert(id, natural_tx);
                let script = Arc::clone(&self.script);
                tokio::spawn(async move {
                    let code = tokio::select! {
                        code = natural_rx => code.unwrap_or(None),
                        _ = kill_rx => None,
                    };
                    script.lock().live.remove(&id);
                    drop(output_tx);
                    let _ = exit_tx.send(code);
                });
            }
        }

        Ok(ProcessHandle {
            id,
            output: output_rx,
            exit: exit_rx,
            kill,
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.events.subscribe()
    }

    async fn teardown(&self) -> Result<(), RuntimeError> {
        let mut script = self.script.lock();
        script.torn_down = true;
        script.live.clear();
        Ok(())
    }
}

struct SharedFactory(Arc<ScriptedRuntime>);

impl RuntimeFactory for SharedFactory {
    fn create(&self, _project_id: &str) -> Result<Arc<dyn SandboxRuntime>, RuntimeError> {
        Ok(self.0.clone())
    }
}

/// Factory that builds an independent scripted runtime per project.
#[derive(Default)]
pub struct ScriptedFactory {
    runtimes: Mutex<HashMap<String, Arc<ScriptedRuntime>>>,
}

impl ScriptedFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn runtime(&self, project_id: &str) -> Option<Arc<ScriptedRuntime>> {
        self.runtimes.lock().get(project_id).cloned()
    }
}

impl RuntimeFactory for ScriptedFactory {
    fn create(&self, project_id: &str) -> Result<Arc<dyn SandboxRuntime>, RuntimeError> {
        let runtime = ScriptedRuntime::new();
        self.runtimes
            .lock()
            .insert(project_id.to_string(), Arc::clone(&runtime));
        Ok(runtime)
    }
}
