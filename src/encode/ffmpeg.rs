use std::{
    path::{Path, PathBuf},
    process::{Command, Stdio},
};

use crate::{
    encode::{EncodeConfig, VideoEncoder, ensure_parent_dir, is_ffmpeg_on_path, is_ffprobe_on_path},
    foundation::error::{FramesmithError, FramesmithResult},
};

/// [`VideoEncoder`] backed by the system `ffmpeg` binary (h264, yuv420p).
#[derive(Clone, Debug, Default)]
pub struct FfmpegEncoder;

impl VideoEncoder for FfmpegEncoder {
    #[tracing::instrument(skip_all, fields(out = %cfg.out_path.display(), frames = cfg.frame_count))]
    fn encode_image_sequence(&self, cfg: &EncodeConfig) -> FramesmithResult<()> {
        cfg.validate()?;
        require_ffmpeg("MP4 encoding")?;
        ensure_parent_dir(&cfg.out_path)?;

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-y", "-loglevel", "error"])
            .args(["-framerate", &cfg.frame_rate.to_string()])
            .args(["-start_number", "0", "-i"])
            .arg(cfg.input_pattern())
            .args(["-frames:v", &cfg.frame_count.to_string()])
            .args([
                "-an",
                "-c:v",
                "libx264",
                "-crf",
                &cfg.quality_factor.to_string(),
                "-pix_fmt",
                "yuv420p",
                "-movflags",
                "+faststart",
            ])
            .arg(&cfg.out_path);

        run_ffmpeg(cmd)?;
        tracing::info!("video composed");
        Ok(())
    }
}

/// Convert a video into a looping GIF of `width` pixels, preserving the aspect ratio.
///
/// Uses a two-pass palette (`palettegen` + `paletteuse`) in a single filter graph.
#[tracing::instrument(skip_all, fields(src = %src.display(), out = %out.display()))]
pub fn convert_to_gif(src: &Path, out: &Path, width: u32) -> FramesmithResult<()> {
    if width == 0 {
        return Err(FramesmithError::validation("gif width must be > 0"));
    }
    if !src.is_file() {
        return Err(FramesmithError::validation(format!(
            "source video '{}' does not exist",
            src.display()
        )));
    }
    require_ffmpeg("GIF conversion")?;
    ensure_parent_dir(out)?;

    let mut cmd = Command::new("ffmpeg");
    cmd.args(["-y", "-loglevel", "error", "-i"])
        .arg(src)
        .args(["-filter_complex", &gif_filter(width), "-loop", "0"])
        .arg(out);
    run_ffmpeg(cmd)
}

fn gif_filter(width: u32) -> String {
    format!("scale={width}:-1:flags=lanczos,split[a][b];[a]palettegen[p];[b][p]paletteuse")
}

fn require_ffmpeg(purpose: &str) -> FramesmithResult<()> {
    if !is_ffmpeg_on_path() {
        return Err(FramesmithError::encode(format!(
            "ffmpeg is required for {purpose}, but was not found on PATH"
        )));
    }
    Ok(())
}

fn run_ffmpeg(mut cmd: Command) -> FramesmithResult<()> {
    let out = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .output()
        .map_err(|e| {
            FramesmithError::encode(format!(
                "failed to spawn ffmpeg (is it installed and on PATH?): {e}"
            ))
        })?;
    if !out.status.success() {
        return Err(FramesmithError::encode(format!(
            "ffmpeg exited with status {}: {}",
            out.status,
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }
    Ok(())
}

/// Basic metadata about a video file.
#[derive(Clone, Debug)]
pub struct VideoInfo {
    pub source_path: PathBuf,
    pub width: u32,
    pub height: u32,
}

/// Dimensions of the first video stream, as reported by `ffprobe`.
pub fn read_video_info(source_path: &Path) -> FramesmithResult<VideoInfo> {
    #[derive(serde::Deserialize)]
    struct FfprobeStream {
        codec_type: Option<String>,
        width: Option<u32>,
        height: Option<u32>,
    }
    #[derive(serde::Deserialize)]
    struct FfprobeOutput {
        streams: Vec<FfprobeStream>,
    }

    if !is_ffprobe_on_path() {
        return Err(FramesmithError::encode(
            "ffprobe is required to inspect videos, but was not found on PATH",
        ));
    }
    let out = Command::new("ffprobe")
        .args(["-v", "error", "-print_format", "json", "-show_streams"])
        .arg(source_path)
        .output()
        .map_err(|e| FramesmithError::encode(format!("failed to run ffprobe: {e}")))?;
    if !out.status.success() {
        return Err(FramesmithError::encode(format!(
            "ffprobe failed for '{}': {}",
            source_path.display(),
            String::from_utf8_lossy(&out.stderr).trim()
        )));
    }

    let parsed: FfprobeOutput = serde_json::from_slice(&out.stdout)
        .map_err(|e| FramesmithError::encode(format!("ffprobe json parse failed: {e}")))?;
    let stream = parsed
        .streams
        .iter()
        .find(|s| s.codec_type.as_deref() == Some("video"))
        .ok_or_else(|| FramesmithError::encode("no video stream found"))?;
    let (Some(width), Some(height)) = (stream.width, stream.height) else {
        return Err(FramesmithError::encode(
            "missing video width/height from ffprobe",
        ));
    };

    Ok(VideoInfo {
        source_path: source_path.to_path_buf(),
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gif_filter_scales_then_builds_a_palette() {
        assert_eq!(
            gif_filter(512),
            "scale=512:-1:flags=lanczos,split[a][b];[a]palettegen[p];[b][p]paletteuse"
        );
    }

    #[test]
    fn gif_conversion_rejects_missing_source_and_zero_width() {
        let missing = Path::new("target/unit-scratch/definitely-missing.mp4");
        assert!(convert_to_gif(missing, Path::new("target/x.gif"), 512).unwrap_err().is_validation());
        assert!(convert_to_gif(missing, Path::new("target/x.gif"), 0).unwrap_err().is_validation());
    }

    #[test]
    fn video_info_without_a_readable_video_is_an_encode_error() {
        let err = read_video_info(Path::new("target/unit-scratch/definitely-missing.mp4")).unwrap_err();
        assert!(matches!(err, FramesmithError::Encode(_)), "{err}");
        if !is_ffprobe_on_path() {
            assert!(err.to_string().contains("ffprobe is required"), "{err}");
        }
    }
}
