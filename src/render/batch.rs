//! One-shot `renderAnimation`: frames in a scratch directory, then one video.

use std::{
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use anyhow::Context as _;

use crate::{
    animation::{BundleBuilder, load_module_value},
    encode::{EncodeConfig, VideoEncoder},
    foundation::error::{FramesmithError, FramesmithResult},
    render::{
        pool::{FramePoolConfig, FrameWorkers, RenderStats, render_frames},
        renderer::BundleRendererFactory,
    },
};

#[derive(Clone, Debug)]
pub struct RenderAnimationOpts {
    pub animation_module_path: PathBuf,
    pub output_path: PathBuf,
    pub worker_count: usize,
    /// Parent of the temporary frame directory; the system temp dir when unset.
    pub scratch_root: Option<PathBuf>,
}

impl RenderAnimationOpts {
    pub fn validate(&self) -> FramesmithResult<()> {
        if self.worker_count == 0 {
            return Err(FramesmithError::validation(
                "numberOfFrameRendererWorkers must be >= 1",
            ));
        }
        if self.output_path.as_os_str().is_empty() {
            return Err(FramesmithError::validation("output path must be non-empty"));
        }
        Ok(())
    }
}

/// Default worker count: one less than the available cores, at least one.
pub fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}

/// Removes its directory (recursively) when dropped.
///
/// Frame workers writing into the directory are owned by the guard and joined first, so a frame
/// still rendering when a batch fails cannot recreate files after the removal.
#[derive(Debug)]
pub struct TempDirGuard {
    path: PathBuf,
    workers: FrameWorkers,
}

impl TempDirGuard {
    pub fn create(root: Option<&Path>) -> FramesmithResult<Self> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);
        let root = root.map(Path::to_path_buf).unwrap_or_else(std::env::temp_dir);
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or(0);
        let path = root.join(format!(
            "framesmith-frames-{}-{nanos}-{}",
            std::process::id(),
            COUNTER.fetch_add(1, Ordering::Relaxed)
        ));
        std::fs::create_dir_all(&path)
            .with_context(|| format!("create scratch dir '{}'", path.display()))?;
        Ok(Self {
            path,
            workers: FrameWorkers::default(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn workers_mut(&mut self) -> &mut FrameWorkers {
        &mut self.workers
    }
}

impl Drop for TempDirGuard {
    fn drop(&mut self) {
        self.workers.join();
        if let Err(e) = std::fs::remove_dir_all(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove scratch dir");
        }
    }
}

/// Render all frames with the worker pool and compose them into a video.
///
/// The encoder never runs when any frame fails. The video is encoded inside the scratch
/// directory and moved to the output path once complete; the scratch directory is removed on
/// every path.
#[tracing::instrument(skip_all, fields(module = %opts.animation_module_path.display()))]
pub fn render_animation(
    opts: &RenderAnimationOpts,
    encoder: &dyn VideoEncoder,
    progress: impl FnMut(u64, u64),
) -> FramesmithResult<RenderStats> {
    opts.validate()?;
    let bundle = BundleBuilder::new(&opts.animation_module_path).build()?;
    let module = load_module_value(bundle.value.clone())?;

    let mut scratch = TempDirGuard::create(opts.scratch_root.as_deref())?;
    let frames_dir = scratch.path().join("frames");
    std::fs::create_dir_all(&frames_dir)
        .with_context(|| format!("create frame dir '{}'", frames_dir.display()))?;

    let extension = opts.output_path.extension().unwrap_or(OsStr::new("mp4"));
    let encode_cfg = EncodeConfig {
        frame_dir: frames_dir.clone(),
        frame_count: module.frame_count,
        frame_size: module.frame_size,
        frame_rate: module.frame_rate,
        quality_factor: module.quality_factor,
        out_path: scratch.path().join("video").with_extension(extension),
    };
    encode_cfg.validate()?;

    let bundle_path = scratch.path().join("bundle.json");
    bundle.write_to(&bundle_path)?;

    let pool_cfg = FramePoolConfig {
        frame_count: module.frame_count,
        worker_count: opts.worker_count,
        output_dir: frames_dir,
    };
    let stats = render_frames(
        Arc::new(BundleRendererFactory::new(bundle_path)),
        &pool_cfg,
        scratch.workers_mut(),
        progress,
    )?;
    tracing::info!(frames = stats.frames_rendered, "frames rendered");

    encoder.encode_image_sequence(&encode_cfg)?;
    publish(&encode_cfg.out_path, &opts.output_path)?;
    Ok(stats)
}

/// Move a finished video out of the scratch directory, copying when a rename is not possible.
fn publish(staged: &Path, out: &Path) -> FramesmithResult<()> {
    crate::encode::ensure_parent_dir(out)?;
    if let Err(e) = std::fs::rename(staged, out) {
        tracing::debug!(error = %e, "rename failed, copying video instead");
        std::fs::copy(staged, out)
            .with_context(|| format!("move video to '{}'", out.display()))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::{
        foundation::core::FrameIndex,
        render::{
            raster::RgbaFrame,
            renderer::{FrameRenderer, FrameRendererFactory},
        },
    };

    #[derive(Default)]
    struct RecordingEncoder {
        seen_frames: Mutex<Option<Vec<String>>>,
        seen_out: Mutex<Option<PathBuf>>,
    }

    impl VideoEncoder for RecordingEncoder {
        fn encode_image_sequence(&self, cfg: &EncodeConfig) -> FramesmithResult<()> {
            let mut names = std::fs::read_dir(&cfg.frame_dir)
                .unwrap()
                .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
                .collect::<Vec<_>>();
            names.sort();
            *self.seen_frames.lock() = Some(names);
            *self.seen_out.lock() = Some(cfg.out_path.clone());
            std::fs::write(&cfg.out_path, b"video").map_err(anyhow::Error::from)?;
            Ok(())
        }
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("target")
            .join("unit-scratch")
            .join(format!("batch-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_module(dir: &Path, radius: &str) -> PathBuf {
        let path = dir.join("orbit.json");
        let value = json!({
            "name": "orbit",
            "frameCount": 10,
            "frameSize": {"width": 100, "height": 100},
            "frameRate": 10,
            "qualityFactor": 18,
            "frame": {
                "element": "svg",
                "children": [{
                    "element": "circle",
                    "attributes": {
                        "cx": {"expression": "15 * cos(2 * PI * frameIndex / frameCount) + 50"},
                        "cy": {"expression": "15 * sin(2 * PI * frameIndex / frameCount) + 50"},
                        "r": {"expression": radius}
                    }
                }]
            }
        });
        std::fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();
        path
    }

    fn opts(dir: &Path, module: PathBuf) -> RenderAnimationOpts {
        let scratch_root = dir.join("scratch");
        std::fs::create_dir_all(&scratch_root).unwrap();
        RenderAnimationOpts {
            animation_module_path: module,
            output_path: dir.join("out").join("orbit.mp4"),
            worker_count: 7,
            scratch_root: Some(scratch_root),
        }
    }

    fn scratch_is_empty(opts: &RenderAnimationOpts) -> bool {
        std::fs::read_dir(opts.scratch_root.as_ref().unwrap())
            .unwrap()
            .next()
            .is_none()
    }

    #[test]
    fn frames_are_composed_and_scratch_is_removed() {
        let dir = scratch_dir("ok");
        let opts = opts(&dir, write_module(&dir, "5"));
        let encoder = RecordingEncoder::default();

        let stats = render_animation(&opts, &encoder, |_, _| {}).unwrap();
        assert_eq!(stats.frames_rendered, 10);

        let mut expected = (0..10).map(|i| format!("{i}.png")).collect::<Vec<_>>();
        expected.sort();
        assert_eq!(encoder.seen_frames.lock().clone(), Some(expected));
        assert!(opts.output_path.is_file());
        assert!(scratch_is_empty(&opts));

        // The encoder writes inside the scratch dir; only a complete video reaches the output.
        let staged = encoder.seen_out.lock().clone().unwrap();
        assert!(staged.starts_with(opts.scratch_root.as_ref().unwrap()), "{}", staged.display());
        assert_eq!(staged.extension(), Some(OsStr::new("mp4")));
    }

    #[test]
    fn a_failing_frame_skips_composition_and_cleans_up() {
        let dir = scratch_dir("fail");
        let opts = opts(&dir, write_module(&dir, "5 / (frameIndex - 3)"));
        let encoder = RecordingEncoder::default();

        let err = render_animation(&opts, &encoder, |_, _| {}).unwrap_err();
        assert!(matches!(err, FramesmithError::Render(_)), "{err}");
        assert!(encoder.seen_frames.lock().is_none());
        assert!(!opts.output_path.exists());
        assert!(scratch_is_empty(&opts));
    }

    #[test]
    fn guard_removes_directory_on_drop() {
        let dir = scratch_dir("guard");
        let guard = TempDirGuard::create(Some(&dir)).unwrap();
        let path = guard.path().to_path_buf();
        std::fs::write(path.join("0.png"), b"x").unwrap();
        drop(guard);
        assert!(!path.exists());
    }

    struct SlowFrames {
        fail_first: bool,
    }

    struct SlowFrameRenderer {
        fail_first: bool,
    }

    impl FrameRendererFactory for SlowFrames {
        fn create(&self) -> FramesmithResult<Box<dyn FrameRenderer>> {
            Ok(Box::new(SlowFrameRenderer {
                fail_first: self.fail_first,
            }))
        }
    }

    impl FrameRenderer for SlowFrameRenderer {
        fn render_to_file(&mut self, frame_index: FrameIndex, out: &Path) -> FramesmithResult<()> {
            if self.fail_first && frame_index.0 == 0 {
                return Err(FramesmithError::render("first frame is broken"));
            }
            std::thread::sleep(Duration::from_millis(400));
            RgbaFrame {
                width: 1,
                height: 1,
                data: vec![0, 0, 0, 255],
            }
            .write_png(out)
        }
    }

    #[test]
    fn frames_in_flight_do_not_outlive_the_scratch_dir() {
        let dir = scratch_dir("inflight");
        let mut guard = TempDirGuard::create(Some(&dir)).unwrap();
        let frames_dir = guard.path().join("frames");
        std::fs::create_dir_all(&frames_dir).unwrap();
        let cfg = FramePoolConfig {
            frame_count: 8,
            worker_count: 4,
            output_dir: frames_dir,
        };

        let started = Instant::now();
        let err = render_frames(
            Arc::new(SlowFrames { fail_first: true }),
            &cfg,
            guard.workers_mut(),
            |_, _| {},
        )
        .unwrap_err();
        assert!(err.to_string().contains("first frame is broken"), "{err}");
        assert!(started.elapsed() < Duration::from_millis(300));

        let path = guard.path().to_path_buf();
        drop(guard);
        assert!(!path.exists());
        std::thread::sleep(Duration::from_millis(600));
        assert!(!path.exists(), "scratch dir was recreated by a late frame");
        assert_eq!(std::fs::read_dir(&dir).unwrap().count(), 0);
    }

    #[test]
    fn default_worker_count_is_at_least_one() {
        assert!(default_worker_count() >= 1);
    }
}
