use aes::cipher::block_padding::UnpadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RinkError {
    #[error("HTTP error: {0}")]
    HttpError(reqwest::StatusCode),

    #[error("Manifest fetch error: {0}")]
    ManifestFetchError(String),

    #[error("Invalid manifest: {0}")]
    ManifestFormat(String),

    #[error("Download failed: {0}")]
    Download(#[from] DownloadFailure),

    #[error("{program} {reason}: {output}")]
    ExternalProgram {
        program: String,
        reason: String,
        output: String,
    },

    #[error("Invalid key material for key {key_number}: {reason}")]
    KeyMaterial { key_number: u64, reason: String },

    #[error("Failed to decrypt segment {segment_number}: {reason}")]
    Decode { segment_number: u64, reason: String },

    #[error("Invalid initialization vector: {0}")]
    InvalidIv(String),

    #[error("Pkcs7 unpad error")]
    UnpadError(#[from] UnpadError),

    #[error("Segment {0} is missing from the store")]
    MissingSegment(u64),

    #[error("Key {0} is missing from the store")]
    MissingKey(u64),

    #[error("Assembly list is not contiguous: expected segment {expected}, found {found}")]
    AssemblyOrder { expected: u64, found: u64 },

    #[error(transparent)]
    IOError(#[from] std::io::Error),

    #[error(transparent)]
    UrlParseError(#[from] url::ParseError),

    #[error(transparent)]
    HexDecodeError(#[from] hex::FromHexError),

    #[error(transparent)]
    RequestError(#[from] reqwest::Error),

    #[error(transparent)]
    MissingExecutable(#[from] which::Error),

    #[error(transparent)]
    ConfigError(#[from] toml::de::Error),

    #[error("Task failed: {0}")]
    JoinError(#[from] tokio::task::JoinError),
}

/// Why the bulk fetcher gave up.
#[derive(Error, Debug)]
pub enum DownloadFailure {
    #[error("{missing} file(s) still missing after {attempts} attempt(s)")]
    AttemptsExhausted { attempts: u32, missing: usize },

    #[error("{failed} distinct URLs failed on attempt {attempt}, treating as an outage")]
    SystemicOutage { attempt: u32, failed: usize },
}

/// Coarse classification callers use to decide whether a run is worth retrying.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ManifestFormat,
    Download,
    ExternalProgram,
    Decode,
    Io,
}

impl RinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ManifestFormat(_) | Self::UrlParseError(_) => ErrorKind::ManifestFormat,
            Self::Download(_)
            | Self::HttpError(_)
            | Self::ManifestFetchError(_)
            | Self::RequestError(_) => ErrorKind::Download,
            Self::ExternalProgram { .. } | Self::KeyMaterial { .. } | Self::MissingExecutable(_) => {
                ErrorKind::ExternalProgram
            }
            Self::Decode { .. } | Self::UnpadError(_) | Self::InvalidIv(_) => ErrorKind::Decode,
            Self::MissingSegment(_)
            | Self::MissingKey(_)
            | Self::AssemblyOrder { .. }
            | Self::IOError(_)
            | Self::HexDecodeError(_)
            | Self::ConfigError(_)
            | Self::JoinError(_) => ErrorKind::Io,
        }
    }
}

pub type RinkResult<T> = Result<T, RinkError>;
