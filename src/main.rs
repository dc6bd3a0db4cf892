//! # Media Compressor - Main Entry Point
//!
//! Composition root of the binary.
//!
//! ## Responsibilities:
//! - Parse a small command line with `clap`
//! - Initialize `tracing` (stderr, `RUST_LOG` honoured)
//! - Load the configuration file and apply command-line overrides
//! - Wire Ctrl-C to the run's cancellation token
//! - Pick the terminal or JSON progress sink and start the run
//!
//! ## Example:
//! ```bash
//! media-compressor ~/Pictures/takeout --output ~/Pictures/compressed --encoder nvenc --verbose
//! ```

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use media_compressor::json_output::JsonMessage;
use media_compressor::{
    CompressionOrchestrator, Config, EncoderId, JsonProgress, Layout, ProgressManager, ProgressSink,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum EncoderArg {
    Nvenc,
    Qsv,
    Amf,
    Videotoolbox,
    Software,
}

impl From<EncoderArg> for EncoderId {
    fn from(arg: EncoderArg) -> Self {
        match arg {
            EncoderArg::Nvenc => EncoderId::Nvenc,
            EncoderArg::Qsv => EncoderId::Qsv,
            EncoderArg::Amf => EncoderId::Amf,
            EncoderArg::Videotoolbox => EncoderId::VideoToolbox,
            EncoderArg::Software => EncoderId::Software,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LayoutArg {
    Mirror,
    Flatten,
    ByPeriod,
}

impl From<LayoutArg> for Layout {
    fn from(arg: LayoutArg) -> Self {
        match arg {
            LayoutArg::Mirror => Layout::Mirror,
            LayoutArg::Flatten => Layout::Flatten,
            LayoutArg::ByPeriod => Layout::OrganizeByPeriod,
        }
    }
}

#[derive(Parser)]
#[command(name = "media-compressor")]
#[command(about = "Compress and rename photo/video collections by capture date")]
struct Args {
    /// Directory containing media files to compress
    media_directory: PathBuf,

    /// Configuration file (default: ~/.media-compressor/config.json)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Output directory layout
    #[arg(long, value_enum)]
    layout: Option<LayoutArg>,

    /// Preferred video encoder (falls back if unavailable)
    #[arg(long, value_enum)]
    encoder: Option<EncoderArg>,

    /// Path to the ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// Keep original file names instead of renaming by capture date
    #[arg(long)]
    keep_names: bool,

    /// Write the effective configuration back to the configuration file
    #[arg(long)]
    save_config: bool,

    /// Output progress and results as JSON lines
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)))
        .with_writer(std::io::stderr)
        .init();

    let json = args.json;
    let result = run(args).await;
    if let (true, Err(e)) = (json, &result) {
        JsonMessage::error("Run failed".to_string(), Some(format!("{:#}", e))).emit();
    }
    result
}

async fn run(args: Args) -> Result<()> {
    let config_path = args.config.clone().or_else(Config::default_path);
    let mut config = match &config_path {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    if args.save_config {
        if let Some(path) = &config_path {
            config.save_to_file(path).await?;
            info!("Configuration saved to {}", path.display());
        }
    }

    let sink: Arc<dyn ProgressSink> = if config.json_output {
        Arc::new(JsonProgress::new())
    } else {
        Arc::new(ProgressManager::new())
    };

    let cancel = CancellationToken::new();
    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, finishing files already in progress");
            ctrl_c.cancel();
        }
    });

    let json_output = config.json_output;
    let orchestrator = CompressionOrchestrator::with_tools(config, sink)?.with_cancel_token(cancel);

    if !json_output {
        let spinner = ProgressManager::spinner("Detecting video encoders...");
        orchestrator.negotiator().detect(false).await;
        spinner.finish_and_clear();
    }

    orchestrator.run(&args.media_directory).await?;
    Ok(())
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(output) = &args.output {
        config.output.output_root = output.clone();
    }
    if let Some(layout) = args.layout {
        config.output.layout = layout.into();
    }
    if let Some(encoder) = args.encoder {
        config.video_encoder = Some(encoder.into());
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.ffmpeg_path = Some(ffmpeg.clone());
    }
    if args.keep_names {
        config.output.rename_by_date = false;
    }
    if args.json {
        config.json_output = true;
    }
}
