use std::{num::NonZeroU32, path::Path, path::PathBuf, time::Duration};

use serde::Deserialize;

use crate::error::RinkResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloaderBackend {
    /// Hand the whole manifest to an external `aria2c` process.
    #[default]
    Aria2,
    /// Download in-process with reqwest.
    Http,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecryptBackend {
    #[default]
    Native,
    Openssl,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Programs {
    pub aria2c: PathBuf,
    pub ffmpeg: PathBuf,
    pub openssl: PathBuf,
}

impl Default for Programs {
    fn default() -> Self {
        Self {
            aria2c: "aria2c".into(),
            ffmpeg: "ffmpeg".into(),
            openssl: "openssl".into(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Target bitrate in kbps, matched against `<quality>K` in the master manifest.
    pub quality: u32,
    /// File name the stream URL must end with.
    pub manifest_name: String,
    pub segment_extension: String,

    /// Parallel downloads inside one bulk fetch.
    pub concurrency: NonZeroU32,
    /// Retries per file inside one bulk fetch, after the first try.
    pub per_file_retries: u32,
    pub retry_wait_secs: u64,
    /// Narrowing passes of the bulk fetcher.
    pub max_attempts: u32,
    /// More distinct failures than this on one pass aborts the fetch.
    pub outage_threshold: usize,
    pub manifest_retries: u32,

    pub bulk_timeout_secs: u64,
    pub command_timeout_secs: u64,

    /// Only fetch the head of the playlist. Debugging aid.
    pub shorten: bool,
    /// Extra ffmpeg arguments applied while concatenating.
    pub bitstream_filter: Option<String>,

    pub session_cookie: String,
    pub user_agent: Option<String>,
    pub origin: Option<String>,

    pub work_dir: PathBuf,
    pub programs: Programs,
    pub downloader: DownloaderBackend,
    pub decrypt: DecryptBackend,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            quality: 5000,
            manifest_name: "master_tablet60.m3u8".to_string(),
            segment_extension: "ts".to_string(),
            concurrency: NonZeroU32::new(10).unwrap_or(NonZeroU32::MIN),
            per_file_retries: 5,
            retry_wait_secs: 10,
            max_attempts: 5,
            outage_threshold: 100,
            manifest_retries: 3,
            bulk_timeout_secs: 30 * 60,
            command_timeout_secs: 5 * 60,
            shorten: false,
            bitstream_filter: Some("-bsf:a aac_adtstoasc".to_string()),
            session_cookie: "mediaAuth".to_string(),
            user_agent: None,
            origin: Some("https://www.nhl.com".to_string()),
            work_dir: PathBuf::from("."),
            programs: Programs::default(),
            downloader: DownloaderBackend::default(),
            decrypt: DecryptBackend::default(),
        }
    }
}

impl PipelineConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> RinkResult<Self> {
        let data = std::fs::read_to_string(path.as_ref())?;
        let config = toml::from_str(&data)?;
        log::debug!("Loaded configuration from {}", path.as_ref().display());
        Ok(config)
    }

    pub fn bulk_timeout(&self) -> Duration {
        Duration::from_secs(self.bulk_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn retry_wait(&self) -> Duration {
        Duration::from_secs(self.retry_wait_secs)
    }

    pub fn user_agent(&self) -> String {
        self.user_agent
            .clone()
            .unwrap_or_else(|| fake_user_agent::get_chrome_rua().to_string())
    }

    /// `bitstream_filter` split into separate arguments.
    pub fn concat_extra_args(&self) -> Vec<String> {
        self.bitstream_filter
            .as_deref()
            .and_then(shlex::split)
            .unwrap_or_default()
    }
}
