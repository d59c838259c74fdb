//! Archive AES-128 protected HLS streams.
//!
//! ```text
//! stream url ──► ManifestResolver ──► build_plan ──► BulkFetcher ──► KeyGroupDecryptor ──► Assembler ──► <gameId>_raw.mkv
//!                 master.m3u8          keys/N          N.ts (cipher)    N.ts (plain)         concat.txt
//!                 input.m3u8           N.ts
//! ```
//!
//! Stages run strictly one after another. Only the fetcher and the decryptor
//! work concurrently inside their stage.

pub mod assemble;
pub mod config;
pub mod decrypt;
pub mod error;
pub mod fetch;
pub mod hls;
pub mod http;
pub mod layout;
pub mod pipeline;
pub mod process;
pub mod store;

pub use config::PipelineConfig;
pub use error::{ErrorKind, RinkError, RinkResult};
pub use layout::GameWorkspace;
pub use pipeline::{Pipeline, PipelineOutcome};

/// One resolved stream to archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamDescriptor {
    pub game_id: u64,
    /// Url of the adaptive manifest.
    pub stream_url: String,
    /// Opaque session token the origin expects as a cookie.
    pub session_key: String,
}

impl StreamDescriptor {
    pub fn new<U, K>(game_id: u64, stream_url: U, session_key: K) -> Self
    where
        U: Into<String>,
        K: Into<String>,
    {
        Self {
            game_id,
            stream_url: stream_url.into(),
            session_key: session_key.into(),
        }
    }

    /// `name=<session key>`, as sent in the `Cookie` header.
    pub fn session_cookie(&self, name: &str) -> String {
        format!("{name}={}", self.session_key)
    }
}
