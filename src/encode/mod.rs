//! Video composition through the system `ffmpeg`.

use std::path::{Path, PathBuf};

use crate::foundation::{
    core::FrameSize,
    error::{FramesmithError, FramesmithResult},
};

pub mod ffmpeg;

pub use ffmpeg::{FfmpegEncoder, VideoInfo, convert_to_gif, read_video_info};

/// Parameters for composing a numbered image sequence into an MP4.
#[derive(Clone, Debug)]
pub struct EncodeConfig {
    pub frame_dir: PathBuf,
    pub frame_count: u64,
    pub frame_size: FrameSize,
    pub frame_rate: u32,
    /// Constant rate factor, `0..=51`.
    pub quality_factor: u8,
    pub out_path: PathBuf,
}

impl EncodeConfig {
    pub fn validate(&self) -> FramesmithResult<()> {
        self.frame_size.validate()?;
        if !self.frame_size.width.is_multiple_of(2) || !self.frame_size.height.is_multiple_of(2) {
            return Err(FramesmithError::validation(
                "frame width/height must be even (required for yuv420p mp4 output)",
            ));
        }
        if self.frame_rate == 0 {
            return Err(FramesmithError::validation("frame rate must be > 0"));
        }
        if self.quality_factor > 51 {
            return Err(FramesmithError::validation("quality factor must be <= 51"));
        }
        if self.frame_count == 0 {
            return Err(FramesmithError::validation(
                "cannot compose a video from zero frames",
            ));
        }
        Ok(())
    }

    /// Input pattern matching the `<index>.png` files written by the frame worker pool.
    pub fn input_pattern(&self) -> PathBuf {
        self.frame_dir.join("%d.png")
    }
}

/// Parameters of an MP4 to GIF conversion.
#[derive(Clone, Debug)]
pub struct GifConversionConfig {
    pub source: PathBuf,
    pub output: PathBuf,
    /// Output width in pixels; the height follows the source aspect ratio.
    pub width: u32,
}

impl GifConversionConfig {
    pub fn validate(&self) -> FramesmithResult<()> {
        if self.width == 0 {
            return Err(FramesmithError::validation("gif width must be > 0"));
        }
        if !self.source.is_file() {
            return Err(FramesmithError::validation(format!(
                "source video '{}' does not exist",
                self.source.display()
            )));
        }
        Ok(())
    }

    pub fn run(&self) -> FramesmithResult<()> {
        self.validate()?;
        convert_to_gif(&self.source, &self.output, self.width)
    }
}

/// Composes rendered frames into a video file.
pub trait VideoEncoder: Send + Sync {
    fn encode_image_sequence(&self, cfg: &EncodeConfig) -> FramesmithResult<()>;
}

/// Ensure the parent directory of `path` exists.
pub fn ensure_parent_dir(path: &Path) -> FramesmithResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        use anyhow::Context as _;
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create output directory '{}'", parent.display()))?;
    }
    Ok(())
}

/// Return `true` when `ffmpeg` can be invoked from `PATH`.
pub fn is_ffmpeg_on_path() -> bool {
    tool_runs("ffmpeg")
}

/// Return `true` when `ffprobe` can be invoked from `PATH`.
pub fn is_ffprobe_on_path() -> bool {
    tool_runs("ffprobe")
}

fn tool_runs(name: &str) -> bool {
    std::process::Command::new(name)
        .arg("-version")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
