//! Runtime backed by a host directory and child processes.
//!
//! Each project gets its own root directory. Mounting writes the tree into a
//! staging sibling and swaps it in, so a failed write leaves the previous
//! tree on disk. Processes run with the root as working directory and a
//! scrubbed environment, each in its own process group so a kill reaches
//! everything they started. A process is considered "serving" once a TCP
//! connect succeeds on its assigned `PORT` or on a port it announces in its
//! output.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use devroom_sdk::{CommandSpec, FileTree};
use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::error::{RuntimeError, SpawnError};
use crate::runtime::{
    KillSwitch, OutputLine, OutputStream, ProcessHandle, ProcessId, RuntimeEvent, RuntimeFactory,
    SandboxRuntime,
};

const OUTPUT_CHANNEL_CAPACITY: usize = 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(250);
const POLL_CONNECT_TIMEOUT: Duration = Duration::from_millis(200);

static PORT_ANNOUNCEMENT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\bport\b\s*:?\s*|localhost:|127\.0\.0\.1:|0\.0\.0\.0:|\[::\]:)(\d{2,5})")
        .unwrap_or_else(|e| panic!("port regex: {e}"))
});

/// Ports a process output line claims to be listening on.
pub fn announced_ports(line: &str) -> Vec<u16> {
    PORT_ANNOUNCEMENT
        .captures_iter(line)
        .filter_map(|c| c.get(1)?.as_str().parse::<u16>().ok())
        .filter(|p| *p > 0)
        .collect()
}

pub struct LocalRuntime {
    root: PathBuf,
    host: String,
    events: broadcast::Sender<RuntimeEvent>,
    next_id: AtomicU64,
}

impl LocalRuntime {
    pub fn new(root: PathBuf) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            root,
            host: "127.0.0.1".to_string(),
            events,
            next_id: AtomicU64::new(1),
        }
    }

    /// Host name used in published preview URLs.
    pub fn with_public_host(mut self, host: &str) -> Self {
        self.host = host.to_string();
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Write a tree below `root`, replacing whatever was there.
///
/// The tree is written to a staging directory next to `root` first. Only a
/// complete write replaces the old root.
fn write_tree(root: &Path, tree: &FileTree) -> Result<(), RuntimeError> {
    tree.validate()?;
    let staging = sibling(root, "staging")?;
    if staging.exists() {
        std::fs::remove_dir_all(&staging)?;
    }
    if let Err(e) = populate(&staging, tree) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e.into());
    }

    if !root.exists() {
        std::fs::rename(&staging, root)?;
        return Ok(());
    }
    let retired = sibling(root, "retired")?;
    if retired.exists() {
        std::fs::remove_dir_all(&retired)?;
    }
    if let Err(e) = std::fs::rename(root, &retired) {
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    if let Err(e) = std::fs::rename(&staging, root) {
        // Put the old tree back.
        let _ = std::fs::rename(&retired, root);
        let _ = std::fs::remove_dir_all(&staging);
        return Err(e.into());
    }
    if let Err(e) = std::fs::remove_dir_all(&retired) {
        tracing::warn!(path = %retired.display(), "Failed to remove replaced tree: {e}");
    }
    Ok(())
}

fn populate(dir: &Path, tree: &FileTree) -> std::io::Result<()> {
    std::fs::create_dir_all(dir)?;
    for (path, contents) in tree.files() {
        let full = dir.join(&path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&full, contents)?;
    }
    Ok(())
}

/// `<parent>/.<name>.<tag>`, a hidden neighbour of `root`.
fn sibling(root: &Path, tag: &str) -> std::io::Result<PathBuf> {
    let name = root.file_name().ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("sandbox root {} has no directory name", root.display()),
        )
    })?;
    Ok(root.with_file_name(format!(".{}.{tag}", name.to_string_lossy())))
}

/// Kill every process in the group led by `pgid`.
#[cfg(unix)]
fn kill_group(pgid: u32) -> nix::Result<()> {
    use nix::sys::signal::{Signal, killpg};
    use nix::unistd::Pid;

    let pgid = i32::try_from(pgid).map_err(|_| nix::errno::Errno::EINVAL)?;
    killpg(Pid::from_raw(pgid), Signal::SIGKILL)
}

#[cfg(not(unix))]
fn kill_group(_pgid: u32) -> std::io::Result<()> {
    Err(std::io::ErrorKind::Unsupported.into())
}

fn free_port() -> std::io::Result<u16> {
    let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
    Ok(listener.local_addr()?.port())
}

#[async_trait]
impl SandboxRuntime for LocalRuntime {
    async fn mount(&self, tree: &FileTree) -> Result<(), RuntimeError> {
        // Validate before touching the disk so a bad tree leaves the old one intact.
        tree.validate()?;
        let root = self.root.clone();
        let tree = tree.clone();
        tokio::task::spawn_blocking(move || write_tree(&root, &tree))
            .await
            .map_err(|e| RuntimeError::Task(e.to_string()))?
    }

    async fn spawn(&self, command: &CommandSpec) -> Result<ProcessHandle, SpawnError> {
        let spawn_err = |source| SpawnError {
            command: command.to_string(),
            source,
        };
        let port = free_port().map_err(spawn_err)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);

        let mut cmd = Command::new(&command.executable);
        cmd.args(&command.arguments)
            .current_dir(&self.root)
            .env_clear()
            .env("PORT", port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        for key in ["PATH", "HOME"] {
            if let Ok(value) = std::env::var(key) {
                cmd.env(key, value);
            }
        }

        let mut child = cmd.spawn().map_err(spawn_err)?;
        // The child leads its own group, so its pid is the group id.
        let pgid = child.id();
        tracing::info!(process = id, pid = ?pgid, command = %command, port, "Spawned sandbox process");

        let (output_tx, output_rx) = mpsc::channel(OUTPUT_CHANNEL_CAPACITY);
        let (ports_tx, ports_rx) = mpsc::unbounded_channel();
        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(pump_lines(id, OutputStream::Stdout, stdout, output_tx.clone(), ports_tx.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(pump_lines(id, OutputStream::Stderr, stderr, output_tx, ports_tx));
        }

        let (exited_tx, exited_rx) = watch::channel(false);
        tokio::spawn(poll_port_ready(
            id,
            port,
            self.host.clone(),
            ports_rx,
            exited_rx,
            self.events.clone(),
        ));

        let (kill, kill_rx) = KillSwitch::new();
        let (exit_tx, exit_rx) = oneshot::channel();
        tokio::spawn(async move {
            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let group_killed = match pgid {
                        Some(pgid) => match kill_group(pgid) {
                            Ok(()) => true,
                            Err(e) => {
                                tracing::debug!(process = id, "group kill: {e}");
                                false
                            }
                        },
                        None => false,
                    };
                    if !group_killed && let Err(e) = child.start_kill() {
                        tracing::debug!(process = id, "kill: {e}");
                    }
                    child.wait().await
                }
            };
            // Reap anything the process left behind in its group.
            if let Some(pgid) = pgid {
                let _ = kill_group(pgid);
            }
            let code = match status {
                Ok(status) => status.code(),
                Err(e) => {
                    tracing::warn!(process = id, "wait failed: {e}");
                    None
                }
            };
            tracing::info!(process = id, ?code, "Sandbox process exited");
            let _ = exited_tx.send(true);
            let _ = exit_tx.send(code);
        });

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
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || {
            if root.exists() {
                std::fs::remove_dir_all(&root)?;
            }
            Ok::<_, std::io::Error>(())
        })
        .await
        .map_err(|e| RuntimeError::Task(e.to_string()))??;
        Ok(())
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(
    process: ProcessId,
    stream: OutputStream,
    reader: R,
    output: mpsc::Sender<OutputLine>,
    ports: mpsc::UnboundedSender<u16>,
) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                for port in announced_ports(&line) {
                    let _ = ports.send(port);
                }
                // Keep draining even with no reader so the child never blocks on a full pipe.
                let _ = output.send(OutputLine { process, stream, line }).await;
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(process, "output read error: {e}");
                break;
            }
        }
    }
}

async fn poll_port_ready(
    process: ProcessId,
    assigned_port: u16,
    host: String,
    mut announced: mpsc::UnboundedReceiver<u16>,
    mut exited: watch::Receiver<bool>,
    events: broadcast::Sender<RuntimeEvent>,
) {
    let mut candidates = BTreeSet::from([assigned_port]);
    loop {
        while let Ok(port) = announced.try_recv() {
            candidates.insert(port);
        }
        for &port in &candidates {
            let connect = tokio::net::TcpStream::connect(("127.0.0.1", port));
            if let Ok(Ok(_)) = tokio::time::timeout(POLL_CONNECT_TIMEOUT, connect).await {
                let url = format!("http://{host}:{port}");
                tracing::info!(process, port, %url, "Sandbox server ready");
                let _ = events.send(RuntimeEvent::ServerReady { process, port, url });
                return;
            }
        }
        tokio::select! {
            _ = exited.changed() => return,
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
        }
    }
}

const DIR_PREFIX_CHARS: usize = 24;

/// Directory name for a project: a readable prefix plus the hex-encoded id.
/// The hex part keeps distinct ids in distinct directories.
fn project_dir_name(project_id: &str) -> String {
    let readable: String = project_id
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '-' || *c == '_')
        .take(DIR_PREFIX_CHARS)
        .collect();
    format!("{readable}-{}", hex::encode(project_id))
}

/// Gives every project a directory under a shared base.
pub struct LocalRuntimeFactory {
    base: PathBuf,
    public_host: String,
}

impl LocalRuntimeFactory {
    pub fn new(base: PathBuf) -> Self {
        Self {
            base,
            public_host: "127.0.0.1".to_string(),
        }
    }

    pub fn with_public_host(mut self, host: &str) -> Self {
        self.public_host = host.to_string();
        self
    }
}

impl RuntimeFactory for LocalRuntimeFactory {
    fn create(&self, project_id: &str) -> Result<Arc<dyn SandboxRuntime>, RuntimeError> {
        std::fs::create_dir_all(&self.base)?;
        let runtime = LocalRuntime::new(self.base.join(project_dir_name(project_id)))
            .with_public_host(&self.public_host);
        Ok(Arc::new(runtime))
    }
}
