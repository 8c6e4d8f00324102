use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use crate::{
    animation::{AnimationModule, BundleBuilder, load_module_file, load_module_value},
    foundation::{
        core::FrameIndex,
        error::{FramesmithError, FramesmithResult},
    },
    render::raster::{Rasterizer, SvgRasterizer},
};

/// Renders single frames of one loaded module to image files.
pub trait FrameRenderer {
    fn render_to_file(&mut self, frame_index: FrameIndex, out: &Path) -> FramesmithResult<()>;
}

/// Creates one [`FrameRenderer`] per worker thread.
///
/// `create` runs on the worker thread itself, so each worker loads its own copy of the module.
pub trait FrameRendererFactory: Send + Sync {
    fn create(&self) -> FramesmithResult<Box<dyn FrameRenderer>>;
}

/// Evaluates an [`AnimationModule`] and rasterizes the resulting markup.
pub struct ModuleFrameRenderer<R> {
    module: Arc<AnimationModule>,
    rasterizer: R,
}

impl<R: Rasterizer> ModuleFrameRenderer<R> {
    pub fn new(module: Arc<AnimationModule>, rasterizer: R) -> Self {
        Self { module, rasterizer }
    }
}

impl<R: Rasterizer> FrameRenderer for ModuleFrameRenderer<R> {
    fn render_to_file(&mut self, frame_index: FrameIndex, out: &Path) -> FramesmithResult<()> {
        let description = self
            .module
            .render_frame(frame_index, self.module.frame_count)?;
        let markup = description.to_svg_markup(self.module.frame_size);
        let frame = self.rasterizer.rasterize(&markup, self.module.frame_size)?;
        frame.write_png(out)
    }
}

/// Loads the bundle file on every worker and renders through [`SvgRasterizer`].
#[derive(Debug, Clone)]
pub struct BundleRendererFactory {
    bundle_path: PathBuf,
}

impl BundleRendererFactory {
    pub fn new(bundle_path: impl Into<PathBuf>) -> Self {
        Self {
            bundle_path: bundle_path.into(),
        }
    }
}

impl FrameRendererFactory for BundleRendererFactory {
    fn create(&self) -> FramesmithResult<Box<dyn FrameRenderer>> {
        let module = load_module_file(&self.bundle_path)?;
        Ok(Box::new(ModuleFrameRenderer::new(
            Arc::new(module),
            SvgRasterizer::new(),
        )))
    }
}

/// Render one frame of the module at `module_path` in the calling thread.
///
/// The source is bundled first, so both module sources and bundles written by the watch loop
/// are accepted.
#[tracing::instrument(skip_all, fields(frame = %frame_index))]
pub fn render_single_frame(
    module_path: &Path,
    frame_index: FrameIndex,
    out: &Path,
) -> FramesmithResult<()> {
    let bundle = BundleBuilder::new(module_path).build()?;
    let module = load_module_value(bundle.value)?;
    if frame_index.0 >= module.frame_count {
        return Err(FramesmithError::validation(format!(
            "frame index {frame_index} is outside 0..{}",
            module.frame_count
        )));
    }
    crate::encode::ensure_parent_dir(out)?;
    let mut renderer = ModuleFrameRenderer::new(Arc::new(module), SvgRasterizer::new());
    renderer.render_to_file(frame_index, out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{foundation::core::FrameSize, render::raster::RgbaFrame};

    fn orbit_fixture() -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/orbit/orbit.json")
    }

    fn scratch_dir(name: &str) -> PathBuf {
        let dir = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("target")
            .join("unit-scratch")
            .join(format!("renderer-{name}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    /// Keeps the markup it was asked to rasterize and returns a blank frame.
    #[derive(Default)]
    struct RecordingRasterizer {
        markup: Vec<String>,
    }

    impl Rasterizer for RecordingRasterizer {
        fn rasterize(&mut self, markup: &str, size: FrameSize) -> FramesmithResult<RgbaFrame> {
            self.markup.push(markup.to_owned());
            Ok(RgbaFrame {
                width: size.width,
                height: size.height,
                data: vec![0; (size.width * size.height * 4) as usize],
            })
        }
    }

    fn orbit_module() -> Arc<AnimationModule> {
        let bundle = BundleBuilder::new(orbit_fixture()).build().unwrap();
        Arc::new(load_module_value(bundle.value).unwrap())
    }

    #[test]
    fn module_renderer_rasterizes_the_evaluated_markup() {
        let dir = scratch_dir("markup");
        let out = dir.join("0.png");
        let mut renderer = ModuleFrameRenderer::new(orbit_module(), RecordingRasterizer::default());
        renderer.render_to_file(FrameIndex(0), &out).unwrap();

        assert!(out.exists());
        let markup = &renderer.rasterizer.markup[0];
        assert!(markup.contains(r#"cx="65""#), "{markup}");
        assert!(markup.contains(r#"cy="50""#), "{markup}");
    }

    #[test]
    fn single_frame_rejects_indices_past_the_end() {
        let dir = scratch_dir("range");
        let err = render_single_frame(&orbit_fixture(), FrameIndex(10), &dir.join("10.png"))
            .unwrap_err();
        assert!(err.is_validation(), "{err}");
        assert!(err.to_string().contains("outside 0..10"), "{err}");
        assert!(!dir.join("10.png").exists());
    }

    #[test]
    fn single_frame_creates_the_output_directory() {
        let dir = scratch_dir("nested");
        let out = dir.join("assets").join("v1").join("3.png");
        render_single_frame(&orbit_fixture(), FrameIndex(3), &out).unwrap();
        assert!(out.is_file());
    }

    #[test]
    fn bundle_factory_reports_unreadable_bundles() {
        let factory = BundleRendererFactory::new("does/not/exist.json");
        assert!(factory.create().is_err());
    }
}
