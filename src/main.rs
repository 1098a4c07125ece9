use anyhow::Context;
use clap::Parser;
use tracing::{error, info};

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use lpr_edge::config::AppConfig;
use lpr_edge::inference::{Accelerator, InferenceBackend};
use lpr_edge::logging::init_logging;
use lpr_edge::publisher::{JsonLinesPublisher, Publisher};
use lpr_edge::source::{FfmpegSource, FrameSource, ImageFolderSource, VideoSource};
use lpr_edge::Pipeline;

#[derive(Parser, Debug)]
#[command(name = "lpr-edge", version, author, about = "Licence-plate recognition for fixed gate cameras")]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Which [[camera]] entry to run
    #[arg(long, default_value_t = 0)]
    camera: usize,

    /// Override the camera's input stream URI
    #[arg(long)]
    source: Option<String>,

    /// Replay the images in a directory instead of opening the stream
    #[arg(long, conflicts_with = "source")]
    images: Option<PathBuf>,

    /// Stop after this many frames
    #[arg(long)]
    max_frames: Option<u64>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{:#}", e);
            eprintln!("lpr-edge: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let config = AppConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let _guard = init_logging(&config.logging);
    let camera = config.camera(cli.camera)?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || flag.store(true, Ordering::SeqCst)).context("installing Ctrl+C handler")?;

    let backend = backend()?;
    let accelerator = Accelerator::new();
    let pipeline = Pipeline::build(&config, camera, backend.as_ref(), &accelerator, JsonLinesPublisher::stdout())?;

    match &cli.images {
        Some(dir) => {
            let uri = dir.to_string_lossy();
            drive(&pipeline, ImageFolderSource::new(camera.image_size), &uri, &config, &shutdown, cli.max_frames)
        }
        None => {
            let uri = cli.source.as_deref().unwrap_or(&camera.input_stream);
            let source = FfmpegSource::new(camera.image_size).with_timeout(config.retry.capture_timeout());
            drive(&pipeline, source, uri, &config, &shutdown, cli.max_frames)
        }
    }
}

fn drive<S: VideoSource, P: Publisher>(
    pipeline: &Pipeline<P>,
    source: S,
    uri: &str,
    config: &AppConfig,
    shutdown: &AtomicBool,
    max_frames: Option<u64>,
) -> anyhow::Result<()> {
    let mut frames = FrameSource::open(source, uri, &config.retry).with_context(|| format!("opening {}", uri))?;
    let summary = pipeline.run(&mut frames, shutdown, max_frames);
    frames.close();
    let summary = summary?;
    info!(frames = summary.frames, plates = summary.plates, "done");
    Ok(())
}

#[cfg(feature = "tensorflow")]
fn backend() -> anyhow::Result<Box<dyn InferenceBackend>> {
    Ok(Box::new(lpr_edge::tf::TensorFlowBackend))
}

#[cfg(not(feature = "tensorflow"))]
fn backend() -> anyhow::Result<Box<dyn InferenceBackend>> {
    anyhow::bail!("no inference backend compiled in, rebuild with `--features tensorflow`")
}
