//! Render subprocess launching.

use std::{
    ffi::OsString,
    path::{Path, PathBuf},
    process::Stdio,
};

use anyhow::Context as _;
use tokio::{
    io::{AsyncRead, AsyncReadExt},
    sync::{mpsc, oneshot},
};

use crate::{
    dev::supervisor::SupervisorMessage,
    foundation::{
        core::{AssetKey, BuildVersion},
        error::{FramesmithError, FramesmithResult},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    Code(i32),
    /// Terminated externally; there is no exit code.
    Signal,
}

/// Everything needed to start the render process for one asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub version: BuildVersion,
    pub key: AssetKey,
    pub bundle_path: PathBuf,
    pub asset_path: PathBuf,
    /// Frame directory root for animation renders, removed once the process has exited.
    pub scratch_dir: Option<PathBuf>,
}

/// Posts output and exit events of one process back into the supervisor queue.
#[derive(Debug, Clone)]
pub struct ProcessEvents {
    version: BuildVersion,
    key: AssetKey,
    tx: mpsc::UnboundedSender<SupervisorMessage>,
}

impl ProcessEvents {
    pub(crate) fn new(
        version: BuildVersion,
        key: AssetKey,
        tx: mpsc::UnboundedSender<SupervisorMessage>,
    ) -> Self {
        Self { version, key, tx }
    }

    pub fn output(&self, stream: OutputStream, chunk: Vec<u8>) {
        let _ = self.tx.send(SupervisorMessage::ProcessOutput {
            version: self.version,
            key: self.key,
            stream,
            chunk,
        });
    }

    pub fn exited(&self, exit: ProcessExit) {
        let _ = self.tx.send(SupervisorMessage::ProcessExited {
            version: self.version,
            key: self.key,
            exit,
        });
    }
}

/// Kill switch for one launched process. Killing twice, or after exit, is a no-op.
///
/// Dropping the handle kills the process as well.
#[derive(Debug)]
pub struct ProcessHandle {
    kill: Option<oneshot::Sender<()>>,
}

impl ProcessHandle {
    pub fn new(kill: oneshot::Sender<()>) -> Self {
        Self { kill: Some(kill) }
    }

    pub fn kill(&mut self) {
        if let Some(tx) = self.kill.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        self.kill();
    }
}

/// Starts render processes. Must not block: the call happens inside an actor step.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, request: LaunchRequest, events: ProcessEvents)
    -> FramesmithResult<ProcessHandle>;
}

/// Launches render processes by re-invoking a `framesmith` executable.
#[derive(Debug, Clone)]
pub struct SubprocessLauncher {
    program: PathBuf,
    worker_count: usize,
}

impl SubprocessLauncher {
    pub fn new(program: impl Into<PathBuf>, worker_count: usize) -> Self {
        Self {
            program: program.into(),
            worker_count,
        }
    }

    /// Launcher for the currently running executable.
    pub fn current_exe(worker_count: usize) -> FramesmithResult<Self> {
        let program = std::env::current_exe().context("locate current executable")?;
        Ok(Self::new(program, worker_count))
    }

    pub fn command_args(&self, request: &LaunchRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = Vec::with_capacity(9);
        match request.key {
            AssetKey::Animation => {
                args.push("renderAnimation".into());
                args.push("--animationModulePath".into());
                args.push(request.bundle_path.clone().into());
                args.push("--animationMp4OutputPath".into());
                args.push(request.asset_path.clone().into());
                args.push("--numberOfFrameRendererWorkers".into());
                args.push(self.worker_count.to_string().into());
                if let Some(dir) = &request.scratch_dir {
                    args.push("--outputDirectoryPath".into());
                    args.push(dir.clone().into());
                }
            }
            AssetKey::Frame(index) => {
                args.push("renderAnimationFrame".into());
                args.push("--animationModulePath".into());
                args.push(request.bundle_path.clone().into());
                args.push("--frameIndex".into());
                args.push(index.0.to_string().into());
                args.push("--frameFileOutputPath".into());
                args.push(request.asset_path.clone().into());
            }
        }
        args
    }
}

impl ProcessLauncher for SubprocessLauncher {
    fn launch(
        &self,
        request: LaunchRequest,
        events: ProcessEvents,
    ) -> FramesmithResult<ProcessHandle> {
        let mut child = tokio::process::Command::new(&self.program)
            .args(self.command_args(&request))
            .env("FRAMESMITH_LOG", "warn")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                FramesmithError::render(format!(
                    "failed to spawn render process '{}': {e}",
                    self.program.display()
                ))
            })?;
        tracing::info!(key = %request.key, version = %request.version, pid = ?child.id(), "render process started");

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let scratch_dir = request.scratch_dir;

        tokio::spawn(async move {
            let out_task = stdout.map(|r| tokio::spawn(pump(r, events.clone(), OutputStream::Stdout)));
            let err_task = stderr.map(|r| tokio::spawn(pump(r, events.clone(), OutputStream::Stderr)));

            let status = tokio::select! {
                status = child.wait() => status,
                _ = kill_rx => {
                    let _ = child.start_kill();
                    child.wait().await
                }
            };
            for task in [out_task, err_task].into_iter().flatten() {
                let _ = task.await;
            }
            if let Some(dir) = scratch_dir {
                remove_scratch_dir(&dir).await;
            }

            let exit = match status {
                Ok(status) => status.code().map_or(ProcessExit::Signal, ProcessExit::Code),
                Err(e) => {
                    tracing::warn!(error = %e, "waiting for render process failed");
                    ProcessExit::Signal
                }
            };
            events.exited(exit);
        });

        Ok(ProcessHandle::new(kill_tx))
    }
}

/// A killed render never reaches its own cleanup, so its frames are removed here.
async fn remove_scratch_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => tracing::debug!(dir = %dir.display(), "render scratch removed"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(dir = %dir.display(), error = %e, "failed to remove render scratch"),
    }
}

async fn pump(mut reader: impl AsyncRead + Unpin, events: ProcessEvents, stream: OutputStream) {
    let mut buf = vec![0u8; 4096];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => events.output(stream, buf[..n].to_vec()),
            Err(e) => {
                tracing::debug!(error = %e, ?stream, "render process pipe closed");
                break;
            }
        }
    }
}
