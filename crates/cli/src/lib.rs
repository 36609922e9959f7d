use std::io::Write;
use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use enscale_core::config::{self, AppConfig};
use enscale_core::engine::backend::InferenceBackend;
use enscale_core::engine::{clear_sessions, NetSession, UpscaleEngine};
use enscale_core::face::{FaceDetector, FaceRefiner};
use enscale_core::logging::{self, LoggingOptions};
use enscale_core::models::{DirModelStore, ModelStore};
use enscale_core::pipeline::ImagePipeline;
use enscale_core::progress::{ProgressEvent, ProgressSender};
use enscale_core::types::{
    Crop, EncoderPreference, OutputFormat, QualityMode, UpscaleRequest, VideoUpscaleRequest,
};
use enscale_core::video::VideoPipeline;

#[derive(Parser)]
#[command(name = "enscale", about = "AI image and video upscaling")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(
        short = 'v',
        long = "verbose",
        action = ArgAction::Count,
        global = true,
        help = "Increase log verbosity (-v: debug, -vv: trace)"
    )]
    verbose: u8,

    #[arg(
        long = "log-filter",
        value_name = "FILTER",
        global = true,
        help = "Explicit tracing filter (overrides RUST_LOG and -v)"
    )]
    log_filter: Option<String>,

    #[arg(long, global = true, help = "Data directory (config, logs)")]
    data_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Upscale one or more still images
    Image(ImageArgs),
    /// Upscale a video file
    Video(VideoArgs),
    /// List models available in the model directory
    Models,
}

#[derive(Args)]
struct EnhanceArgs {
    #[arg(short = 'o', long, default_value = "output", help = "Output directory")]
    output_dir: PathBuf,

    #[arg(short = 's', long, default_value_t = 2, help = "Nominal scale factor")]
    scale: u32,

    #[arg(short = 'm', long, default_value = "general-x2", help = "Model name or path")]
    model: String,

    #[arg(long, default_value = "balanced", help = "fast | balanced | quality")]
    quality: String,

    #[arg(long, default_value_t = 0, help = "Tile edge in pixels (0 = auto)")]
    tile_size: u32,

    #[arg(long, help = "Tile overlap in pixels")]
    tile_overlap: Option<u32>,

    #[arg(long, default_value = "original", help = "original | png | jpeg | webp")]
    format: String,

    #[arg(long, help = "Lossy encode quality, 1-100")]
    encode_quality: Option<u8>,

    #[arg(long, value_name = "X,Y,W,H", help = "Process only this region")]
    crop: Option<String>,

    #[arg(long, help = "Pre-inference denoise strength, 0.0-1.0")]
    denoise: Option<f32>,

    #[arg(long, help = "Blend alpha against the previous output, 0.0-1.0")]
    temporal_blend: Option<f32>,

    #[arg(long, help = "Run face detection and refinement on the output")]
    refine_faces: bool,

    #[arg(long, default_value = "face-detect", help = "Face detection model")]
    detector_model: String,

    #[arg(long, default_value = "face-restore", help = "Face restoration model")]
    face_model: String,
}

#[derive(Args)]
struct ImageArgs {
    #[arg(required = true, help = "Input image files")]
    inputs: Vec<PathBuf>,

    #[command(flatten)]
    enhance: EnhanceArgs,
}

#[derive(Args)]
struct VideoArgs {
    #[arg(help = "Input video file")]
    input: PathBuf,

    #[command(flatten)]
    enhance: EnhanceArgs,

    #[arg(long, help = "Use hardware-accelerated decode")]
    hw_decode: bool,

    #[arg(long, default_value = "auto", help = "auto | nvenc | qsv | software")]
    encoder: String,
}

pub fn run_from_env() -> Result<()> {
    let cli = Cli::parse();
    let data_dir = config::data_dir(cli.data_dir.as_deref());

    enscale_core::runtime::setup_runtime_libs();
    config::initialize_data_dir(&data_dir)?;
    let app_config = AppConfig::load_from_path(&config::config_path(&data_dir))?;

    logging::init(&LoggingOptions {
        verbose: cli.verbose,
        cli_log_filter: cli
            .log_filter
            .clone()
            .or_else(|| app_config.log_filter.clone()),
        rust_log_env: std::env::var("RUST_LOG").ok(),
        data_dir: Some(data_dir.clone()),
    })?;
    enscale_core::runtime::log_runtime_lib_status();

    let models_dir = config::resolve_relative_to(&data_dir, &app_config.paths.models_dir);
    let trt_cache_dir = config::resolve_relative_to(&data_dir, &app_config.paths.trt_cache_dir);
    let store = DirModelStore::new(models_dir);

    let result = match &cli.command {
        Commands::Image(args) => run_image(args, &store, &app_config, &trt_cache_dir),
        Commands::Video(args) => run_video(args, &store, &app_config, &trt_cache_dir),
        Commands::Models => run_models(&store),
    };
    clear_sessions();
    result
}

fn parse_quality(s: &str) -> Result<QualityMode> {
    match s.to_ascii_lowercase().as_str() {
        "fast" => Ok(QualityMode::Fast),
        "balanced" => Ok(QualityMode::Balanced),
        "quality" => Ok(QualityMode::Quality),
        other => bail!("unknown quality mode '{other}' (expected fast, balanced, or quality)"),
    }
}

fn parse_format(s: &str) -> Result<OutputFormat> {
    match s.to_ascii_lowercase().as_str() {
        "original" => Ok(OutputFormat::Original),
        "png" => Ok(OutputFormat::Png),
        "jpeg" | "jpg" => Ok(OutputFormat::Jpeg),
        "webp" => Ok(OutputFormat::Webp),
        other => bail!("unknown output format '{other}' (expected original, png, jpeg, or webp)"),
    }
}

fn parse_encoder(s: &str) -> Result<EncoderPreference> {
    match s.to_ascii_lowercase().as_str() {
        "auto" => Ok(EncoderPreference::Auto),
        "nvenc" => Ok(EncoderPreference::Nvenc),
        "qsv" => Ok(EncoderPreference::Qsv),
        "software" | "x264" => Ok(EncoderPreference::Software),
        other => bail!("unknown encoder '{other}' (expected auto, nvenc, qsv, or software)"),
    }
}

fn parse_crop(s: &str) -> Result<Crop> {
    let parts: Vec<u32> = s
        .split(',')
        .map(|part| part.trim().parse::<u32>())
        .collect::<Result<_, _>>()
        .with_context(|| format!("invalid crop '{s}' (expected X,Y,W,H)"))?;
    let [x, y, width, height] = parts[..] else {
        bail!("invalid crop '{s}' (expected exactly four values X,Y,W,H)");
    };
    if width == 0 || height == 0 {
        bail!("crop region must have a non-zero size");
    }
    Ok(Crop {
        x,
        y,
        width,
        height,
    })
}

fn build_request(
    inputs: Vec<PathBuf>,
    args: &EnhanceArgs,
    app_config: &AppConfig,
) -> Result<UpscaleRequest> {
    let mut request = UpscaleRequest::new(
        inputs,
        args.output_dir.clone(),
        args.scale,
        args.model.clone(),
    );
    request.quality = parse_quality(&args.quality)?;
    request.tile_size = args.tile_size;
    request.tile_overlap = args
        .tile_overlap
        .unwrap_or(app_config.defaults.tile_overlap);
    request.format = parse_format(&args.format)?;
    request.encode_quality = args
        .encode_quality
        .unwrap_or(app_config.defaults.encode_quality);
    request.crop = args.crop.as_deref().map(parse_crop).transpose()?;
    request.denoise = args.denoise;
    request.temporal_blend = args.temporal_blend;
    request.refine_faces = args.refine_faces;
    Ok(request)
}

struct LoadedRefiner(Option<FaceRefiner>);

fn load_engine(
    args: &EnhanceArgs,
    store: &DirModelStore,
    trt_cache_dir: &std::path::Path,
) -> Result<(UpscaleEngine, LoadedRefiner)> {
    let quality = parse_quality(&args.quality)?;
    let backend = InferenceBackend::for_quality(quality);
    let model_path = store.resolve(&args.model)?;
    let engine = UpscaleEngine::load(&model_path, backend, Some(trt_cache_dir))?;

    let refiner = if args.refine_faces {
        let detector_path = store.resolve(&args.detector_model)?;
        let face_path = store.resolve(&args.face_model)?;
        let detector =
            FaceDetector::new(NetSession::load(&detector_path, backend, Some(trt_cache_dir))?);
        let restorer = NetSession::load(&face_path, backend, Some(trt_cache_dir))?;
        Some(FaceRefiner::new(detector, restorer))
    } else {
        None
    };
    Ok((engine, LoadedRefiner(refiner)))
}

/// Drain progress events onto stderr: a single updating line for stage
/// progress, full lines for warnings.
fn spawn_progress_printer() -> (ProgressSender, std::thread::JoinHandle<()>) {
    let (tx, rx) = mpsc::channel();
    let handle = std::thread::spawn(move || {
        let mut printed = false;
        for event in rx {
            match event {
                ProgressEvent::Progress { stage, overall } => {
                    eprint!("\r{:?}: {:5.1}%   ", stage, overall * 100.0);
                    let _ = std::io::stderr().flush();
                    printed = true;
                }
                ProgressEvent::Warning(message) => {
                    if printed {
                        eprintln!();
                        printed = false;
                    }
                    warn!("{message}");
                }
            }
        }
        if printed {
            eprintln!();
        }
    });
    (tx, handle)
}

fn run_image(
    args: &ImageArgs,
    store: &DirModelStore,
    app_config: &AppConfig,
    trt_cache_dir: &std::path::Path,
) -> Result<()> {
    let request = build_request(args.inputs.clone(), &args.enhance, app_config)?;
    let (engine, refiner) = load_engine(&args.enhance, store, trt_cache_dir)?;

    let mut pipeline = ImagePipeline::new(&engine);
    if let Some(refiner) = refiner.0.as_ref() {
        pipeline = pipeline.with_refiner(refiner);
    }

    let cancel = CancellationToken::new();
    let (tx, printer) = spawn_progress_printer();
    let result = pipeline.run(&request, Some(&tx), &cancel);
    drop(tx);
    let _ = printer.join();

    let result = result?;
    for output in &result.outputs {
        println!("{}", output.display());
    }
    info!(outputs = result.outputs.len(), "done");
    Ok(())
}

fn run_video(
    args: &VideoArgs,
    store: &DirModelStore,
    app_config: &AppConfig,
    trt_cache_dir: &std::path::Path,
) -> Result<()> {
    let frame_options = build_request(Vec::new(), &args.enhance, app_config)?;
    let request = VideoUpscaleRequest {
        input: args.input.clone(),
        frame_options,
        hw_decode: args.hw_decode,
        encoder: parse_encoder(&args.encoder)?,
    };
    let (engine, refiner) = load_engine(&args.enhance, store, trt_cache_dir)?;

    let mut pipeline = ImagePipeline::new(&engine);
    if let Some(refiner) = refiner.0.as_ref() {
        pipeline = pipeline.with_refiner(refiner);
    }
    let video = VideoPipeline::new(pipeline);

    let cancel = CancellationToken::new();
    let (tx, printer) = spawn_progress_printer();
    let result = video.run(&request, Some(&tx), &cancel);
    drop(tx);
    let _ = printer.join();

    let output = result?;
    println!("{}", output.display());
    Ok(())
}

fn run_models(store: &DirModelStore) -> Result<()> {
    let models = store.list()?;
    if models.is_empty() {
        println!("no models found in {}", store.models_dir().display());
        return Ok(());
    }
    for name in models {
        println!("{name}");
    }
    Ok(())
}
