//! The render supervisor actor.
//!
//! One task owns every piece of interactive render state and consumes one ordered queue of
//! [`SupervisorMessage`]s: client reads, subprocess output, subprocess exits, rebuilds and
//! shutdown. Because a read that finds no state spawns the subprocess inside the same step,
//! concurrent first reads of one key collapse into exactly one spawn.

use std::{
    collections::{HashMap, VecDeque},
    ops::ControlFlow,
    panic::{AssertUnwindSafe, catch_unwind},
    path::PathBuf,
    sync::Arc,
};

use tokio::{
    sync::{mpsc, oneshot},
    task::JoinHandle,
};

use crate::{
    animation::BuildEvent,
    dev::{
        launcher::{
            LaunchRequest, OutputStream, ProcessEvents, ProcessExit, ProcessHandle, ProcessLauncher,
        },
        lines::LineBuffer,
        state::{AssetTable, ProcessState, ReadOutcome, StateSnapshot, asset_url},
    },
    foundation::{
        core::{AssetKey, BuildVersion},
        error::{FramesmithError, FramesmithResult, panic_message},
    },
};

/// Stderr kept per process; older bytes are discarded first.
const MAX_STDERR_BYTES: usize = 64 * 1024;

const STARTING_TEXT: &str = "Starting render process";
const QUEUED_TEXT: &str = "Waiting for a free render slot";

#[derive(Debug)]
pub enum SupervisorMessage {
    ReadState {
        key: AssetKey,
        reply: oneshot::Sender<ReadOutcome>,
    },
    Rebuilt(BuildEvent),
    ProcessOutput {
        version: BuildVersion,
        key: AssetKey,
        stream: OutputStream,
        chunk: Vec<u8>,
    },
    ProcessExited {
        version: BuildVersion,
        key: AssetKey,
        exit: ProcessExit,
    },
    Shutdown,
}

#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Render outputs are written here as `v<version>-animation.mp4` / `v<version>-frame-<i>.png`.
    pub assets_dir: PathBuf,
    /// Animation renders keep their frames in a per-process directory below this one.
    pub scratch_dir: PathBuf,
    pub max_concurrent_processes: usize,
}

#[derive(Debug)]
struct ProcessRecord {
    state: ProcessState,
    stdout: LineBuffer,
    stderr: Vec<u8>,
    /// Present while the process runs; `None` while queued or after exit.
    handle: Option<ProcessHandle>,
}

impl ProcessRecord {
    fn new(state: ProcessState, handle: Option<ProcessHandle>) -> Self {
        Self {
            state,
            stdout: LineBuffer::default(),
            stderr: Vec::new(),
            handle,
        }
    }

    fn stderr_text(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_owned()
    }
}

/// Interactive render state: the current build, one record per asset key, the spawn queue.
pub struct RenderSupervisor {
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
    assets: AssetTable,
    events: mpsc::WeakUnboundedSender<SupervisorMessage>,
    current: Option<BuildEvent>,
    records: HashMap<AssetKey, ProcessRecord>,
    queue: VecDeque<AssetKey>,
    running: usize,
}

impl RenderSupervisor {
    fn handle(&mut self, msg: SupervisorMessage) -> ControlFlow<()> {
        match msg {
            SupervisorMessage::ReadState { key, reply } => {
                let outcome = self.read_state(key);
                let _ = reply.send(outcome);
            }
            SupervisorMessage::Rebuilt(event) => self.on_rebuilt(event),
            SupervisorMessage::ProcessOutput {
                version,
                key,
                stream,
                chunk,
            } => self.on_output(version, key, stream, &chunk),
            SupervisorMessage::ProcessExited { version, key, exit } => {
                self.on_exited(version, key, exit)
            }
            SupervisorMessage::Shutdown => {
                self.teardown();
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn current_version(&self) -> Option<BuildVersion> {
        self.current.as_ref().map(|event| event.version)
    }

    fn read_state(&mut self, key: AssetKey) -> ReadOutcome {
        let Some(current) = &self.current else {
            return ReadOutcome::NoBuild;
        };
        let version = current.version;
        let build = match &current.outcome {
            Ok(build) => Arc::clone(build),
            Err(error_text) => {
                return ReadOutcome::Snapshot(StateSnapshot::Invalid {
                    build_version: version,
                    error_text: error_text.clone(),
                });
            }
        };
        if let AssetKey::Frame(index) = key
            && index.0 >= build.module.frame_count
        {
            return ReadOutcome::InvalidKey(format!(
                "frame index {index} is outside 0..{}",
                build.module.frame_count
            ));
        }

        if !self.records.contains_key(&key) {
            self.first_read(key, version);
        }
        let state = self
            .records
            .get(&key)
            .map(|record| record.state.snapshot())
            .unwrap_or_else(|| ProcessState::active(STARTING_TEXT).snapshot());

        ReadOutcome::Snapshot(StateSnapshot::Valid {
            build_version: version,
            animation_name: build.module.name.clone(),
            frame_count: build.module.frame_count,
            process_state: state,
        })
    }

    fn first_read(&mut self, key: AssetKey, version: BuildVersion) {
        if self.running >= self.config.max_concurrent_processes {
            tracing::debug!(%key, "render slot limit reached, queueing");
            self.queue.push_back(key);
            self.records
                .insert(key, ProcessRecord::new(ProcessState::active(QUEUED_TEXT), None));
            return;
        }
        let record = self.start(key, version);
        self.records.insert(key, record);
    }

    fn start(&mut self, key: AssetKey, version: BuildVersion) -> ProcessRecord {
        match self.launch(key, version) {
            Ok(handle) => {
                self.running += 1;
                ProcessRecord::new(ProcessState::active(STARTING_TEXT), Some(handle))
            }
            Err(e) => {
                tracing::warn!(%key, error = %e, "render process launch failed");
                ProcessRecord::new(
                    ProcessState::Failed {
                        error_text: e.to_string(),
                    },
                    None,
                )
            }
        }
    }

    fn launch(&self, key: AssetKey, version: BuildVersion) -> FramesmithResult<ProcessHandle> {
        let bundle_path = match self.current.as_ref().map(|c| &c.outcome) {
            Some(Ok(build)) => build.bundle_path.clone(),
            _ => return Err(FramesmithError::render("no valid build to render")),
        };
        let tx = self
            .events
            .upgrade()
            .ok_or_else(|| FramesmithError::render("render supervisor is shutting down"))?;
        let request = LaunchRequest {
            version,
            key,
            bundle_path,
            asset_path: self.config.assets_dir.join(key.asset_file_name(version)),
            scratch_dir: matches!(key, AssetKey::Animation)
                .then(|| self.config.scratch_dir.join(format!("{version}-animation"))),
        };
        self.launcher
            .launch(request, ProcessEvents::new(version, key, tx))
    }

    fn on_output(&mut self, version: BuildVersion, key: AssetKey, stream: OutputStream, chunk: &[u8]) {
        if Some(version) != self.current_version() {
            return;
        }
        let Some(record) = self.records.get_mut(&key) else {
            return;
        };
        match stream {
            OutputStream::Stdout => {
                if let Some(line) = record.stdout.push(chunk)
                    && let ProcessState::Active { progress_text } = &mut record.state
                {
                    *progress_text = line;
                }
            }
            OutputStream::Stderr => {
                record.stderr.extend_from_slice(chunk);
                if record.stderr.len() > MAX_STDERR_BYTES {
                    let excess = record.stderr.len() - MAX_STDERR_BYTES;
                    record.stderr.drain(..excess);
                }
            }
        }
    }

    fn on_exited(&mut self, version: BuildVersion, key: AssetKey, exit: ProcessExit) {
        if Some(version) != self.current_version() {
            // Killed by a rebuild, but it may have written its output before it went down.
            remove_files(vec![self.config.assets_dir.join(key.asset_file_name(version))]);
            return;
        }
        let Some(record) = self.records.get_mut(&key) else {
            return;
        };
        if record.handle.take().is_none() {
            return;
        }
        self.running = self.running.saturating_sub(1);

        match exit {
            ProcessExit::Code(0) => {
                let file_name = key.asset_file_name(version);
                self.assets
                    .register(file_name.clone(), self.config.assets_dir.join(&file_name));
                record.state = ProcessState::Successful {
                    asset_url: asset_url(&file_name),
                };
                tracing::info!(%key, %version, "render process succeeded");
            }
            ProcessExit::Code(1) => {
                let stderr = record.stderr_text();
                record.state = ProcessState::Failed {
                    error_text: if stderr.is_empty() {
                        "render process failed without error output".to_owned()
                    } else {
                        stderr
                    },
                };
                tracing::info!(%key, %version, "render process failed");
            }
            ProcessExit::Code(code) => {
                let stderr = record.stderr_text();
                record.state = ProcessState::Failed {
                    error_text: if stderr.is_empty() {
                        format!("render process exited with code {code}")
                    } else {
                        format!("render process exited with code {code}: {stderr}")
                    },
                };
                tracing::warn!(%key, %version, code, "render process exited unexpectedly");
            }
            ProcessExit::Signal => {
                self.records.remove(&key);
                tracing::info!(%key, %version, "render process terminated externally");
            }
        }
        self.start_queued();
    }

    fn start_queued(&mut self) {
        let Some(version) = self.current_version() else {
            return;
        };
        while self.running < self.config.max_concurrent_processes {
            let Some(key) = self.queue.pop_front() else {
                break;
            };
            let waiting = self
                .records
                .get(&key)
                .is_some_and(|r| r.handle.is_none() && !r.state.is_terminal());
            if waiting {
                let record = self.start(key, version);
                self.records.insert(key, record);
            }
        }
    }

    fn on_rebuilt(&mut self, event: BuildEvent) {
        if let Some(current) = self.current_version()
            && event.version <= current
        {
            tracing::debug!(version = %event.version, %current, "ignoring stale build");
            return;
        }
        self.teardown();
        let mut stale = self.assets.clear();
        if let Some(BuildEvent {
            outcome: Ok(previous),
            ..
        }) = self.current.take()
        {
            stale.push(previous.bundle_path.clone());
        }
        remove_files(stale);
        tracing::info!(version = %event.version, ok = event.outcome.is_ok(), "build version changed");
        self.current = Some(event);
    }

    /// Kill every tracked process and forget all per-key state.
    fn teardown(&mut self) {
        let mut killed = 0usize;
        for record in self.records.values_mut() {
            if let Some(mut handle) = record.handle.take() {
                handle.kill();
                killed += 1;
            }
        }
        if killed > 0 {
            tracing::info!(killed, "render processes killed");
        }
        self.records.clear();
        self.queue.clear();
        self.running = 0;
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<SupervisorMessage>) {
        while let Some(msg) = rx.recv().await {
            match catch_unwind(AssertUnwindSafe(|| self.handle(msg))) {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break,
                Err(payload) => {
                    tracing::error!(panic = %panic_message(payload.as_ref()), "supervisor step panicked");
                }
            }
        }
        self.teardown();
        tracing::debug!("render supervisor stopped");
    }
}

/// Delete outputs of a replaced build on the blocking pool. Files that are already gone are fine.
fn remove_files(paths: Vec<PathBuf>) {
    if paths.is_empty() {
        return;
    }
    tokio::task::spawn_blocking(move || {
        for path in paths {
            match std::fs::remove_file(&path) {
                Ok(()) => tracing::debug!(path = %path.display(), "removed stale render output"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove stale render output")
                }
            }
        }
    });
}

/// Cloneable front door to the supervisor actor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    tx: mpsc::UnboundedSender<SupervisorMessage>,
    assets: AssetTable,
}

impl SupervisorHandle {
    /// Read (and on first read, start) the render state for `key`.
    pub async fn read_state(&self, key: AssetKey) -> FramesmithResult<ReadOutcome> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(SupervisorMessage::ReadState { key, reply })
            .map_err(|_| anyhow::anyhow!("render supervisor is not running"))?;
        let outcome = rx
            .await
            .map_err(|_| anyhow::anyhow!("render supervisor dropped the request"))?;
        Ok(outcome)
    }

    pub fn rebuilt(&self, event: BuildEvent) -> FramesmithResult<()> {
        self.tx
            .send(SupervisorMessage::Rebuilt(event))
            .map_err(|_| anyhow::anyhow!("render supervisor is not running"))?;
        Ok(())
    }

    pub fn shutdown(&self) {
        let _ = self.tx.send(SupervisorMessage::Shutdown);
    }

    pub fn assets(&self) -> &AssetTable {
        &self.assets
    }
}

/// Start the supervisor actor on the current tokio runtime.
///
/// The actor stops on [`SupervisorHandle::shutdown`] or once every handle and every running
/// process has gone away.
pub fn spawn_supervisor(
    config: SupervisorConfig,
    launcher: Arc<dyn ProcessLauncher>,
) -> (SupervisorHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let assets = AssetTable::default();
    let supervisor = RenderSupervisor {
        config: SupervisorConfig {
            max_concurrent_processes: config.max_concurrent_processes.max(1),
            ..config
        },
        launcher,
        assets: assets.clone(),
        events: tx.downgrade(),
        current: None,
        records: HashMap::new(),
        queue: VecDeque::new(),
        running: 0,
    };
    let join = tokio::spawn(supervisor.run(rx));
    (SupervisorHandle { tx, assets }, join)
}
