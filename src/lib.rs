//! framesmith renders procedurally-defined animations.
//!
//! An animation module is a JSON document describing a pure function from frame index to an
//! SVG-like frame description. The crate offers two ways to turn it into pixels:
//!
//! - batch: [`render_animation`] fans frames out over a worker pool and composes the image
//!   sequence into an MP4 with `ffmpeg`
//! - interactive: [`start_development`] rebuilds on every source change and renders requested
//!   assets in subprocesses, exposing their state over HTTP
#![forbid(unsafe_code)]

mod foundation;

pub(crate) mod expression;

pub mod animation;
pub mod dev;
pub mod encode;
pub mod render;

pub use crate::foundation::core::{AssetKey, BuildVersion, FrameIndex, FrameSize};
pub use crate::foundation::error::{FramesmithError, FramesmithResult};

pub use crate::animation::{AnimationModule, BundleBuilder, FrameDescription};
pub use crate::dev::{DevelopmentConfig, start_development};
pub use crate::encode::{EncodeConfig, FfmpegEncoder, VideoEncoder};
pub use crate::render::{RenderAnimationOpts, RenderStats, render_animation, render_single_frame};
