use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use open_screencast::capture::default_providers;
use open_screencast::config::RecorderSettings;
use open_screencast::export::{
    clamp_selection, probe_media, FfmpegEncoderFactory, FfmpegFormatProbe, FfmpegPaths,
    FfmpegPlaybackEngine, TrimReencoder,
};
use open_screencast::recorder::{
    EncodingServices, FormatProbe, RecordedArtifact, RecorderController, RecordingEvent,
    RecordingFormat, StartOutcome,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "open-screencast", version, about)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Record the screen until Ctrl-C (or for a fixed time)
    Record {
        /// Settings file (JSON)
        #[arg(long)]
        config: Option<PathBuf>,

        /// Stop automatically after this many seconds
        #[arg(long)]
        seconds: Option<u64>,

        #[arg(long)]
        no_camera: bool,

        #[arg(long)]
        no_mic: bool,

        #[arg(long)]
        no_system_audio: bool,
    },

    /// Re-encode part of a recording
    Trim {
        input: PathBuf,

        /// Start of the selection in seconds
        #[arg(long, value_parser = parse_seconds)]
        start: Duration,

        /// End of the selection in seconds
        #[arg(long, value_parser = parse_seconds)]
        end: Duration,

        #[arg(long)]
        output: PathBuf,

        /// Duration of the input in seconds, probed when omitted
        #[arg(long, value_parser = parse_seconds)]
        duration: Option<Duration>,

        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// List recording formats and whether the local ffmpeg supports them
    Formats {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn parse_seconds(value: &str) -> Result<Duration, String> {
    let secs: f64 = value
        .parse()
        .map_err(|_| format!("not a number of seconds: {value}"))?;
    Duration::try_from_secs_f64(secs).map_err(|e| e.to_string())
}

fn load_settings(path: Option<&Path>) -> anyhow::Result<RecorderSettings> {
    match path {
        Some(path) => RecorderSettings::load(path)
            .with_context(|| format!("loading settings from {}", path.display())),
        None => Ok(RecorderSettings::default()),
    }
}

fn ffmpeg_paths(settings: &RecorderSettings) -> FfmpegPaths {
    FfmpegPaths {
        ffmpeg: settings.ffmpeg_path.clone(),
        ffprobe: settings.ffprobe_path.clone(),
    }
}

fn trimmer(settings: &RecorderSettings, encoders: Arc<FfmpegEncoderFactory>) -> TrimReencoder {
    let engine = FfmpegPlaybackEngine::new(ffmpeg_paths(settings));
    TrimReencoder::new(Arc::new(engine), encoders)
        .with_seek_timeout(settings.seek_timeout())
        .with_frame_rate(settings.recording.frame_rate)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    open_screencast::init_logging(cli.verbose);
    tracing::info!("Starting Open Screencast v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Record {
            config,
            seconds,
            no_camera,
            no_mic,
            no_system_audio,
        } => {
            let mut settings = load_settings(config.as_deref())?;
            settings.recording.show_camera &= !no_camera;
            settings.recording.enable_mic &= !no_mic;
            settings.recording.enable_system_audio &= !no_system_audio;
            record(settings, seconds.map(Duration::from_secs)).await
        }
        Command::Trim {
            input,
            start,
            end,
            output,
            duration,
            config,
        } => {
            let settings = load_settings(config.as_deref())?;
            trim(settings, &input, start, end, &output, duration).await
        }
        Command::Formats { config } => {
            let settings = load_settings(config.as_deref())?;
            let probe = FfmpegFormatProbe::new(&settings.ffmpeg_path);
            for format in RecordingFormat::preferences() {
                let status = if probe.is_supported(format) {
                    "supported"
                } else {
                    "unsupported"
                };
                println!("{format}\t{status}");
            }
            Ok(())
        }
    }
}

async fn record(settings: RecorderSettings, limit: Option<Duration>) -> anyhow::Result<()> {
    let (providers, _position, _viewport) = default_providers(&settings);
    let encoders = Arc::new(FfmpegEncoderFactory::new(&settings.ffmpeg_path));
    let encoding = EncodingServices {
        encoders: encoders.clone(),
        formats: Arc::new(FfmpegFormatProbe::new(&settings.ffmpeg_path)),
    };
    let controller = RecorderController::new(providers, encoding, trimmer(&settings, encoders));
    let mut events = controller.subscribe();

    match controller.start(settings.recording.clone()).await? {
        StartOutcome::Started => {}
        StartOutcome::Cancelled(reason) => bail!("recording not started: {reason}"),
    }
    eprintln!("Recording... press Ctrl-C to stop");

    let timer = async {
        match limit {
            Some(limit) => tokio::time::sleep(limit).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(timer);

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = &mut timer => break,
            event = events.recv() => match event {
                Ok(RecordingEvent::Stopped { .. }) | Ok(RecordingEvent::Error(_)) => break,
                Ok(event) => tracing::debug!("{:?}", event),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::debug!("Skipped {} events", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    let artifact = match controller.stop().await {
        Ok(artifact) => artifact,
        // the session already ended on its own
        Err(_) => controller.last_artifact(),
    };
    controller.shutdown().await;

    let Some(artifact) = artifact else {
        bail!("nothing was recorded");
    };
    persist(&artifact, &settings).await?;
    println!("{}", serde_json::to_string_pretty(&artifact.info().await)?);
    Ok(())
}

/// Write in-memory or multipart artifacts to the output directory
async fn persist(artifact: &RecordedArtifact, settings: &RecorderSettings) -> anyhow::Result<()> {
    if artifact.single_file().is_some() {
        return Ok(());
    }
    tokio::fs::create_dir_all(&settings.output_dir).await?;
    let path = settings.output_dir.join(format!(
        "{}-{}.{}",
        settings.recording.suggested_name,
        artifact.id(),
        artifact.format().extension()
    ));
    let bytes = artifact.save_to(&path).await?;
    eprintln!("Saved {} bytes to {}", bytes, path.display());
    Ok(())
}

async fn trim(
    settings: RecorderSettings,
    input: &Path,
    start: Duration,
    end: Duration,
    output: &Path,
    duration: Option<Duration>,
) -> anyhow::Result<()> {
    let duration = match duration {
        Some(duration) => duration,
        None => probe_media(&settings.ffprobe_path, input)
            .await?
            .duration
            .context("input has no duration, pass --duration")?,
    };

    let selection = clamp_selection(start, end, duration);
    if selection.start != start || selection.end != end {
        tracing::info!(
            "Selection adjusted to {:?}..{:?}",
            selection.start,
            selection.end
        );
    }

    let source = RecordedArtifact::from_file(input, duration, RecordingFormat::Webm);
    let encoders = Arc::new(FfmpegEncoderFactory::new(&settings.ffmpeg_path));
    let trimmed = trimmer(&settings, encoders)
        .trim(&source, selection.start, selection.end)
        .await?;

    let bytes = trimmed.save_to(output).await?;
    eprintln!("Wrote {} bytes to {}", bytes, output.display());
    println!("{}", serde_json::to_string_pretty(&trimmed.info().await)?);
    Ok(())
}
