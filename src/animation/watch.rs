//! Versioned rebuilds: one-shot and file-watching.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use anyhow::Context as _;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::{sync::mpsc, time::Instant};

use crate::{
    animation::{
        bundle::BundleBuilder,
        loader::{AnimationModule, load_module_value},
    },
    foundation::{core::BuildVersion, error::FramesmithResult},
};

const WATCH_DEBOUNCE_MS: u64 = 100;

/// A successful build: the bundle file written for its version and the module loaded from it.
#[derive(Debug)]
pub struct LoadedBuild {
    pub bundle_path: PathBuf,
    pub module: Arc<AnimationModule>,
}

/// One outcome of the build loop. Versions strictly increase across events.
#[derive(Debug, Clone)]
pub struct BuildEvent {
    pub version: BuildVersion,
    pub outcome: Result<Arc<LoadedBuild>, String>,
}

/// Assigns versions to successive builds of one entry file.
#[derive(Debug)]
pub struct BuildSequence {
    builder: BundleBuilder,
    bundles_dir: PathBuf,
    next: BuildVersion,
    dependencies: Vec<PathBuf>,
}

impl BuildSequence {
    pub fn new(builder: BundleBuilder, bundles_dir: impl Into<PathBuf>) -> Self {
        Self {
            builder,
            bundles_dir: bundles_dir.into(),
            next: BuildVersion::INITIAL,
            dependencies: Vec::new(),
        }
    }

    pub fn bundle_path(&self, version: BuildVersion) -> PathBuf {
        self.bundles_dir.join(format!("animation-{}.json", version.0))
    }

    /// Files read by the most recent successful bundle.
    pub fn dependencies(&self) -> &[PathBuf] {
        &self.dependencies
    }

    /// Build, write and load the module under the next version.
    ///
    /// Failures are captured in the event; the version advances either way.
    pub fn rebuild(&mut self) -> BuildEvent {
        let version = self.next;
        self.next = version.next();
        let outcome = self.build_version(version).map(Arc::new).map_err(|e| {
            tracing::warn!(%version, error = %e, "build failed");
            e.to_string()
        });
        if let Ok(build) = &outcome {
            tracing::info!(
                %version,
                name = %build.module.name,
                frames = build.module.frame_count,
                "build ready"
            );
        }
        BuildEvent { version, outcome }
    }

    fn build_version(&mut self, version: BuildVersion) -> FramesmithResult<LoadedBuild> {
        let bundle = self.builder.build()?;
        self.dependencies = bundle.dependencies.clone();
        let module = load_module_value(bundle.value.clone())?;
        let bundle_path = self.bundle_path(version);
        bundle.write_to(&bundle_path)?;
        Ok(LoadedBuild {
            bundle_path,
            module: Arc::new(module),
        })
    }

    fn desired_watches(&self) -> HashMap<PathBuf, RecursiveMode> {
        let source_dir = self
            .builder
            .entry()
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let source_dir = std::fs::canonicalize(&source_dir).unwrap_or(source_dir);

        let mut desired = HashMap::from([(source_dir.clone(), RecursiveMode::Recursive)]);
        for dep in &self.dependencies {
            if let Some(parent) = dep.parent()
                && !parent.starts_with(&source_dir)
            {
                desired
                    .entry(parent.to_path_buf())
                    .or_insert(RecursiveMode::NonRecursive);
            }
        }
        desired
    }
}

/// Only module sources trigger rebuilds; anything under `ignored` (generated output) does not.
fn is_relevant_change(event: &notify::Event, ignored: &Path) -> bool {
    if matches!(event.kind, notify::EventKind::Access(_)) {
        return false;
    }
    event.paths.iter().any(|p| {
        p.extension().is_some_and(|ext| ext == "json") && !p.starts_with(ignored)
    })
}

fn refresh_watches(
    watcher: &mut RecommendedWatcher,
    watched: &mut HashMap<PathBuf, RecursiveMode>,
    desired: HashMap<PathBuf, RecursiveMode>,
) {
    let stale = watched
        .iter()
        .filter(|(p, mode)| desired.get(*p) != Some(*mode))
        .map(|(p, _)| p.clone())
        .collect::<Vec<_>>();
    for path in stale {
        let _ = watcher.unwatch(&path);
        watched.remove(&path);
    }
    for (path, mode) in desired {
        if watched.contains_key(&path) {
            continue;
        }
        match watcher.watch(&path, mode) {
            Ok(()) => {
                watched.insert(path, mode);
            }
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "watch failed"),
        }
    }
}

/// Build immediately, then rebuild after every debounced source change.
///
/// Returns when the receiving side of `events` is dropped.
pub async fn run_watch_loop(
    mut sequence: BuildSequence,
    ignored_dir: PathBuf,
    events: mpsc::UnboundedSender<BuildEvent>,
) -> anyhow::Result<()> {
    let (fs_tx, mut fs_rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = fs_tx.send(res);
    })
    .context("create file watcher")?;
    let ignored_dir = std::fs::canonicalize(&ignored_dir).unwrap_or(ignored_dir);
    let mut watched = HashMap::new();

    loop {
        let (returned, event) = tokio::task::spawn_blocking(move || {
            let event = sequence.rebuild();
            (sequence, event)
        })
        .await
        .context("build task panicked")?;
        sequence = returned;

        refresh_watches(&mut watcher, &mut watched, sequence.desired_watches());
        if events.send(event).is_err() {
            return Ok(());
        }

        let mut deadline: Option<Instant> = None;
        loop {
            tokio::select! {
                res = fs_rx.recv() => match res {
                    None => return Ok(()),
                    Some(Ok(ev)) => {
                        if is_relevant_change(&ev, &ignored_dir) {
                            tracing::debug!(paths = ?ev.paths, "source changed");
                            deadline = Some(Instant::now() + Duration::from_millis(WATCH_DEBOUNCE_MS));
                        }
                    }
                    Some(Err(err)) => tracing::warn!(error = %err, "file watcher error"),
                },
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => break,
                _ = events.closed() => return Ok(()),
            }
        }
    }
}
