use std::{num::NonZeroU32, path::PathBuf};

use anyhow::bail;
use clap::{Parser, ValueEnum};
use rinktv::{
    config::{DecryptBackend, DownloaderBackend},
    Pipeline, PipelineConfig, StreamDescriptor,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Downloader {
    Aria2,
    Http,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Decrypt {
    Native,
    Openssl,
}

#[derive(Parser, Debug, Clone)]
#[clap(version, about)]
pub struct RinkArgs {
    /// Debug output
    #[clap(long, alias = "debug")]
    verbose: bool,

    /// Configuration file in TOML format
    #[clap(short, long, env = "RINKTV_CONFIG")]
    config: Option<PathBuf>,

    /// Target bitrate in kbps. The last variant is used if it is not offered.
    #[clap(short, long)]
    quality: Option<u32>,

    /// Parallel downloads
    #[clap(long)]
    threads: Option<NonZeroU32>,

    /// Directory that receives the working files and the output
    #[clap(short, long)]
    work_dir: Option<PathBuf>,

    /// Bulk downloader backend
    #[clap(long, value_enum)]
    downloader: Option<Downloader>,

    /// Segment decryption backend
    #[clap(long, value_enum)]
    decrypt: Option<Decrypt>,

    /// Only fetch the first segments of the stream. For testing.
    #[clap(long)]
    shorten: bool,

    /// Remove the working files of the game instead of downloading it
    #[clap(long)]
    clean: bool,

    /// Game id, used to name every file of the run
    game_id: u64,

    /// Url of the adaptive manifest
    #[clap(required_unless_present = "clean")]
    stream_url: Option<String>,

    /// Session token sent to the origin as a cookie
    #[clap(
        env = "RINKTV_SESSION_KEY",
        hide_env_values = true,
        required_unless_present = "clean"
    )]
    session_key: Option<String>,
}

impl RinkArgs {
    fn pipeline_config(&self) -> anyhow::Result<PipelineConfig> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };

        if let Some(quality) = self.quality {
            config.quality = quality;
        }
        if let Some(threads) = self.threads {
            config.concurrency = threads;
        }
        if let Some(work_dir) = &self.work_dir {
            config.work_dir = work_dir.clone();
        }
        if let Some(downloader) = self.downloader {
            config.downloader = match downloader {
                Downloader::Aria2 => DownloaderBackend::Aria2,
                Downloader::Http => DownloaderBackend::Http,
            };
        }
        if let Some(decrypt) = self.decrypt {
            config.decrypt = match decrypt {
                Decrypt::Native => DecryptBackend::Native,
                Decrypt::Openssl => DecryptBackend::Openssl,
            };
        }
        config.shorten |= self.shorten;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = RinkArgs::parse();

    let level = if args.verbose {
        tracing_subscriber::filter::LevelFilter::DEBUG
    } else {
        tracing_subscriber::filter::LevelFilter::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let pipeline = Pipeline::new(args.pipeline_config()?);
    if args.clean {
        pipeline.clean_up(args.game_id, true).await?;
        log::info!("Removed working files of game {}", args.game_id);
        return Ok(());
    }

    let (Some(stream_url), Some(session_key)) = (args.stream_url, args.session_key) else {
        bail!("A stream url and a session key are required");
    };
    let descriptor = StreamDescriptor::new(args.game_id, stream_url, session_key);
    match pipeline.run(&descriptor).await {
        Ok(outcome) => {
            log::info!(
                "Game {} saved to {} ({} segment(s), {} download attempt(s))",
                descriptor.game_id,
                outcome.output.display(),
                outcome.segments,
                outcome.attempts
            );
            Ok(())
        }
        Err(e) => {
            log::error!(
                "Game {} failed ({:?}), working files kept in {}",
                descriptor.game_id,
                e.kind(),
                pipeline.workspace(descriptor.game_id).dir().display()
            );
            Err(e.into())
        }
    }
}
