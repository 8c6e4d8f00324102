//! Interactive development mode.
//!
//! A watch loop rebuilds the module on every source change and hands each versioned build to
//! the [`supervisor`], which lazily runs one render subprocess per requested asset. A small
//! HTTP server exposes the supervisor state to a polling client and serves finished assets.

use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context as _;
use tokio::{net::TcpListener, sync::mpsc};

use crate::{
    animation::{BundleBuilder, BuildSequence, run_watch_loop},
    foundation::error::{FramesmithError, FramesmithResult},
};

pub mod launcher;
pub mod lines;
pub mod server;
pub mod state;
pub mod supervisor;

pub use launcher::{ProcessLauncher, SubprocessLauncher};
pub use state::{AssetTable, ProcessState, ReadOutcome, StateSnapshot};
pub use supervisor::{SupervisorConfig, SupervisorHandle, spawn_supervisor};

#[derive(Clone, Debug)]
pub struct DevelopmentConfig {
    pub animation_module_path: PathBuf,
    pub client_server_port: u16,
    pub worker_count: usize,
    pub max_concurrent_render_processes: usize,
    /// Bundles, render outputs and render scratch space live below this directory.
    pub generated_assets_dir: PathBuf,
}

impl DevelopmentConfig {
    pub fn validate(&self) -> FramesmithResult<()> {
        if self.worker_count == 0 {
            return Err(FramesmithError::validation(
                "numberOfFrameRendererWorkers must be >= 1",
            ));
        }
        if self.max_concurrent_render_processes == 0 {
            return Err(FramesmithError::validation(
                "maxConcurrentRenderProcesses must be >= 1",
            ));
        }
        if !self.animation_module_path.is_file() {
            return Err(FramesmithError::validation(format!(
                "animation module '{}' does not exist",
                self.animation_module_path.display()
            )));
        }
        Ok(())
    }

    pub fn bundles_dir(&self) -> PathBuf {
        self.generated_assets_dir.join("bundles")
    }

    pub fn assets_dir(&self) -> PathBuf {
        self.generated_assets_dir.join("assets")
    }

    /// Parent of the per-process frame directories of animation renders.
    pub fn scratch_dir(&self) -> PathBuf {
        self.generated_assets_dir.join("scratch")
    }
}

/// Default render process cap: one per available core.
pub fn default_max_concurrent_render_processes() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn create_dir(path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(path).with_context(|| format!("create '{}'", path.display()))
}

/// Run the development server until Ctrl-C.
pub async fn start_development(cfg: DevelopmentConfig) -> anyhow::Result<()> {
    cfg.validate()?;
    create_dir(&cfg.bundles_dir())?;
    create_dir(&cfg.assets_dir())?;
    // Frame directories left behind by an earlier run that did not shut down cleanly.
    let _ = std::fs::remove_dir_all(cfg.scratch_dir());
    create_dir(&cfg.scratch_dir())?;

    let launcher = SubprocessLauncher::current_exe(cfg.worker_count)?;
    let (handle, actor) = spawn_supervisor(
        SupervisorConfig {
            assets_dir: std::fs::canonicalize(cfg.assets_dir())?,
            scratch_dir: std::fs::canonicalize(cfg.scratch_dir())?,
            max_concurrent_processes: cfg.max_concurrent_render_processes,
        },
        Arc::new(launcher),
    );

    let (build_tx, mut build_rx) = mpsc::unbounded_channel();
    let sequence = BuildSequence::new(
        BundleBuilder::new(&cfg.animation_module_path),
        std::fs::canonicalize(cfg.bundles_dir())?,
    );
    let watch = tokio::spawn(run_watch_loop(
        sequence,
        cfg.generated_assets_dir.clone(),
        build_tx,
    ));

    let forward = handle.clone();
    tokio::spawn(async move {
        while let Some(event) = build_rx.recv().await {
            if forward.rebuilt(event).is_err() {
                break;
            }
        }
    });

    let listener = TcpListener::bind(("127.0.0.1", cfg.client_server_port))
        .await
        .with_context(|| format!("bind port {}", cfg.client_server_port))?;
    tracing::info!(
        addr = %listener.local_addr()?,
        module = %cfg.animation_module_path.display(),
        "development server listening"
    );

    server::serve(listener, handle.clone(), async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutting down");
    })
    .await?;

    handle.shutdown();
    watch.abort();
    let _ = actor.await;
    Ok(())
}
