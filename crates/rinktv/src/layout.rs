use std::path::{Path, PathBuf};

use crate::error::RinkResult;

/// Paths of every file a run creates for one game.
///
/// ```text
/// <base>/<game_id>/master.m3u8
/// <base>/<game_id>/input.m3u8
/// <base>/<game_id>/keys/<key_number>
/// <base>/<game_id>/<segment_number>.<ext>
/// <base>/<game_id>/download_file.txt
/// <base>/<game_id>/concat.txt
/// <base>/<game_id>_dl.log
/// <base>/<game_id>_fail_<timestamp>_attempt<n>.log
/// <base>/<game_id>_raw.mkv
/// ```
#[derive(Debug, Clone)]
pub struct GameWorkspace {
    base: PathBuf,
    game_id: u64,
}

impl GameWorkspace {
    pub fn new<P: Into<PathBuf>>(base: P, game_id: u64) -> Self {
        Self {
            base: base.into(),
            game_id,
        }
    }

    pub fn game_id(&self) -> u64 {
        self.game_id
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn dir(&self) -> PathBuf {
        self.base.join(self.game_id.to_string())
    }

    pub fn master_manifest(&self) -> PathBuf {
        self.dir().join("master.m3u8")
    }

    pub fn quality_playlist(&self) -> PathBuf {
        self.dir().join("input.m3u8")
    }

    pub fn keys_dir(&self) -> PathBuf {
        self.dir().join("keys")
    }

    pub fn download_file(&self) -> PathBuf {
        self.dir().join("download_file.txt")
    }

    pub fn concat_file(&self) -> PathBuf {
        self.dir().join("concat.txt")
    }

    pub fn download_log(&self) -> PathBuf {
        self.base.join(format!("{}_dl.log", self.game_id))
    }

    pub fn failed_log(&self, timestamp: &str, attempt: u32) -> PathBuf {
        self.base
            .join(format!("{}_fail_{timestamp}_attempt{attempt}.log", self.game_id))
    }

    /// Cookie jar left by the sign-in step that produced the session key.
    /// The pipeline never writes it. `clean_up(true)` removes it.
    pub fn cookie_file(&self) -> PathBuf {
        self.base.join(format!("{}.txt", self.game_id))
    }

    pub fn raw_output(&self) -> PathBuf {
        self.base.join(format!("{}_raw.mkv", self.game_id))
    }

    /// Wipe leftovers of a previous run and create the directory tree.
    pub async fn prepare(&self) -> RinkResult<()> {
        self.clean_up(false).await?;
        tokio::fs::create_dir_all(self.keys_dir()).await?;
        Ok(())
    }

    /// Remove the download log and the game directory, and the cookie file if asked to.
    ///
    /// Archived failure logs and the assembled output are left alone.
    pub async fn clean_up(&self, delete_cookie: bool) -> RinkResult<()> {
        remove_file_if_exists(&self.download_log()).await?;
        let dir = self.dir();
        if dir.is_dir() {
            tokio::fs::remove_dir_all(&dir).await?;
        }
        if delete_cookie {
            remove_file_if_exists(&self.cookie_file()).await?;
        }
        Ok(())
    }

    /// Move the current download log aside so the next attempt starts with an empty one.
    pub async fn archive_download_log(&self, attempt: u32) -> RinkResult<Option<PathBuf>> {
        let log = self.download_log();
        if !log.exists() {
            return Ok(None);
        }

        let timestamp = chrono::Local::now().format("%Y%m%dT%H%M%S%.3f").to_string();
        let archived = self.failed_log(&timestamp, attempt);
        tokio::fs::rename(&log, &archived).await?;
        log::warn!("Download log of attempt {attempt} kept at {}", archived.display());
        Ok(Some(archived))
    }
}

async fn remove_file_if_exists(path: &Path) -> RinkResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
