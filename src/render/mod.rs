//! Batch frame rendering: module evaluation, rasterization and the frame worker pool.

pub mod batch;
pub mod pool;
pub mod raster;
pub mod renderer;

pub use batch::{RenderAnimationOpts, TempDirGuard, default_worker_count, render_animation};
pub use pool::{FrameJob, FramePoolConfig, RenderStats, render_frames};
pub use raster::{Rasterizer, RgbaFrame, SvgRasterizer};
pub use renderer::{
    BundleRendererFactory, FrameRenderer, FrameRendererFactory, ModuleFrameRenderer,
    render_single_frame,
};
