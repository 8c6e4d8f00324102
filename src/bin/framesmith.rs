use std::path::PathBuf;

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use framesmith::{
    DevelopmentConfig, FfmpegEncoder, FrameIndex, RenderAnimationOpts, dev, encode::GifConversionConfig,
    render, render_animation, render_single_frame,
};

#[derive(Parser, Debug)]
#[command(name = "framesmith", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Render every frame and compose an MP4 (requires `ffmpeg` on PATH).
    #[command(name = "renderAnimation")]
    RenderAnimation(RenderAnimationArgs),
    /// Render a single frame as a PNG.
    #[command(name = "renderAnimationFrame")]
    RenderAnimationFrame(RenderFrameArgs),
    /// Convert an MP4 into a looping GIF (requires `ffmpeg` on PATH).
    #[command(name = "convertAnimationToGif")]
    ConvertAnimationToGif(GifArgs),
    /// Watch the module, rebuild on change and serve render state over HTTP.
    #[command(name = "startDevelopment")]
    StartDevelopment(DevelopmentArgs),
}

#[derive(Parser, Debug)]
struct RenderAnimationArgs {
    /// Animation module source or bundle (JSON).
    #[arg(long = "animationModulePath")]
    animation_module_path: PathBuf,

    /// Output MP4 path.
    #[arg(long = "animationMp4OutputPath")]
    animation_mp4_output_path: PathBuf,

    /// Parallel frame renderers. Defaults to one less than the number of cores.
    #[arg(long = "numberOfFrameRendererWorkers")]
    number_of_frame_renderer_workers: Option<usize>,

    /// Directory that holds the temporary frame directory while rendering.
    #[arg(long = "outputDirectoryPath")]
    output_directory_path: Option<PathBuf>,
}

#[derive(Parser, Debug)]
struct RenderFrameArgs {
    #[arg(long = "animationModulePath")]
    animation_module_path: PathBuf,

    /// Frame index (0-based).
    #[arg(long = "frameIndex")]
    frame_index: u64,

    /// Output PNG path.
    #[arg(long = "frameFileOutputPath")]
    frame_file_output_path: PathBuf,
}

#[derive(Parser, Debug)]
struct GifArgs {
    #[arg(long = "animationMp4SourcePath")]
    animation_mp4_source_path: PathBuf,

    #[arg(long = "animationGifOutputPath")]
    animation_gif_output_path: PathBuf,

    /// Output width in pixels; height follows the source aspect ratio.
    #[arg(long = "gifAspectRatioWidth", default_value_t = 512)]
    gif_aspect_ratio_width: u32,
}

#[derive(Parser, Debug)]
struct DevelopmentArgs {
    #[arg(long = "animationModulePath")]
    animation_module_path: PathBuf,

    #[arg(long = "clientServerPort", default_value_t = 3000)]
    client_server_port: u16,

    /// Workers per `renderAnimation` subprocess.
    #[arg(long = "numberOfFrameRendererWorkers")]
    number_of_frame_renderer_workers: Option<usize>,

    /// Render subprocesses allowed to run at once. Defaults to the number of cores.
    #[arg(long = "maxConcurrentRenderProcesses")]
    max_concurrent_render_processes: Option<usize>,

    #[arg(long = "generatedAssetsDirectoryPath", default_value = ".framesmith")]
    generated_assets_directory_path: PathBuf,
}

fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match cli.cmd {
        Command::RenderAnimation(args) => cmd_render_animation(args),
        Command::RenderAnimationFrame(args) => cmd_render_frame(args),
        Command::ConvertAnimationToGif(args) => cmd_convert_gif(args),
        Command::StartDevelopment(args) => cmd_start_development(args),
    }
}

/// Logs go to stderr; stdout carries one progress line per step.
fn init_tracing() {
    let filter = EnvFilter::try_from_env("FRAMESMITH_LOG").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init()
        .ok();
}

fn cmd_render_animation(args: RenderAnimationArgs) -> anyhow::Result<()> {
    let opts = RenderAnimationOpts {
        animation_module_path: args.animation_module_path,
        output_path: args.animation_mp4_output_path,
        worker_count: args
            .number_of_frame_renderer_workers
            .unwrap_or_else(render::default_worker_count),
        scratch_root: args.output_directory_path,
    };

    let stats = render_animation(&opts, &FfmpegEncoder, |done, total| {
        println!("Rendered {done}/{total} frames");
    })?;
    println!(
        "Wrote {} ({} frames)",
        opts.output_path.display(),
        stats.frames_rendered
    );
    Ok(())
}

fn cmd_render_frame(args: RenderFrameArgs) -> anyhow::Result<()> {
    let index = FrameIndex(args.frame_index);
    println!("Rendering frame {index}");
    render_single_frame(&args.animation_module_path, index, &args.frame_file_output_path)?;
    println!("Wrote {}", args.frame_file_output_path.display());
    Ok(())
}

fn cmd_convert_gif(args: GifArgs) -> anyhow::Result<()> {
    let cfg = GifConversionConfig {
        source: args.animation_mp4_source_path,
        output: args.animation_gif_output_path,
        width: args.gif_aspect_ratio_width,
    };
    cfg.validate()?;
    println!("Converting {} to GIF", cfg.source.display());
    cfg.run()?;
    println!("Wrote {}", cfg.output.display());
    Ok(())
}

fn cmd_start_development(args: DevelopmentArgs) -> anyhow::Result<()> {
    let cfg = DevelopmentConfig {
        animation_module_path: args.animation_module_path,
        client_server_port: args.client_server_port,
        worker_count: args
            .number_of_frame_renderer_workers
            .unwrap_or_else(render::default_worker_count),
        max_concurrent_render_processes: args
            .max_concurrent_render_processes
            .unwrap_or_else(dev::default_max_concurrent_render_processes),
        generated_assets_dir: args.generated_assets_directory_path,
    };
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("start async runtime")?;
    runtime.block_on(framesmith::start_development(cfg))
}
