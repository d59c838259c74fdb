use std::{path::PathBuf, sync::Arc};

use crate::{
    assemble::{Assembler, Concatenator, FfmpegConcat},
    config::{DecryptBackend, DownloaderBackend, PipelineConfig},
    decrypt::{Aes128Cipher, KeyGroupDecryptor, OpensslCipher},
    error::{RinkError, RinkResult},
    fetch::{
        Aria2Downloader, BulkDownloader, BulkFetcher, FetchOptions, HttpBulkDownloader,
        ProgressCallback,
    },
    hls::{build_plan, variant::playlist_root, ManifestResolver},
    http::HttpClient,
    layout::GameWorkspace,
    store::FileSegmentStore,
    StreamDescriptor,
};

/// What a successful run produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub output: PathBuf,
    pub segments: usize,
    /// Bulk fetch passes it took.
    pub attempts: u32,
}

/// Resolver, plan builder, fetcher, decryptor and assembler run one after another.
pub struct Pipeline {
    config: PipelineConfig,
    progress: Option<ProgressCallback>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            progress: None,
        }
    }

    /// Called with `(done, total)` whenever a segment finishes downloading.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn workspace(&self, game_id: u64) -> GameWorkspace {
        GameWorkspace::new(&self.config.work_dir, game_id)
    }

    /// Remove the working files of a game, as left behind by a failed run.
    pub async fn clean_up(&self, game_id: u64, delete_cookie: bool) -> RinkResult<()> {
        self.workspace(game_id).clean_up(delete_cookie).await
    }

    /// Fail early when a program the configured backends call is not installed.
    pub fn check_programs(&self) -> RinkResult<()> {
        let programs = &self.config.programs;
        let mut required = vec![&programs.ffmpeg];
        if self.config.downloader == DownloaderBackend::Aria2 {
            required.push(&programs.aria2c);
        }
        if self.config.decrypt == DecryptBackend::Openssl {
            required.push(&programs.openssl);
        }

        for program in required {
            let path = which::which(program)?;
            log::debug!("Found {} at {}", program.display(), path.display());
        }
        Ok(())
    }

    pub async fn run(&self, descriptor: &StreamDescriptor) -> RinkResult<PipelineOutcome> {
        self.check_programs()?;
        self.run_with(descriptor, &FfmpegConcat::from_config(&self.config))
            .await
    }

    /// [Pipeline::run] with a caller-supplied concatenation step.
    pub async fn run_with<C>(
        &self,
        descriptor: &StreamDescriptor,
        concatenator: &C,
    ) -> RinkResult<PipelineOutcome>
    where
        C: Concatenator,
    {
        let config = &self.config;
        let workspace = self.workspace(descriptor.game_id);
        tracing::info!(
            "Archiving game {} into {}",
            descriptor.game_id,
            workspace.dir().display()
        );
        workspace.prepare().await?;

        let client = HttpClient::for_stream(config, descriptor)?;
        let playlist = ManifestResolver::new(&client, config)
            .resolve(descriptor, &workspace)
            .await?;

        let mut plan = build_plan(
            &playlist.text,
            playlist_root(&playlist.url)?,
            &config.segment_extension,
        )?;
        if config.shorten {
            plan = plan.shorten();
        }
        if plan.entries.is_empty() {
            return Err(RinkError::ManifestFormat(format!(
                "Playlist {} lists no .{} segments",
                playlist.url, config.segment_extension
            )));
        }

        let store = Arc::new(FileSegmentStore::new(
            workspace.dir(),
            &config.segment_extension,
        ));
        let options = FetchOptions::from(config);
        let expected = plan.entries.len();
        let attempts = match config.downloader {
            DownloaderBackend::Aria2 => {
                let downloader = Aria2Downloader::new(config, descriptor, &workspace);
                self.fetcher(downloader, store.clone(), &workspace, options)
                    .fetch_all(&plan.downloads, expected)
                    .await?
            }
            DownloaderBackend::Http => {
                let downloader = HttpBulkDownloader::new(client.clone(), store.clone(), config);
                self.fetcher(downloader, store.clone(), &workspace, options)
                    .fetch_all(&plan.downloads, expected)
                    .await?
            }
        };

        let list = match config.decrypt {
            DecryptBackend::Native => {
                KeyGroupDecryptor::new(Arc::new(Aes128Cipher), store.clone(), &config.segment_extension)
                    .decrypt_all(&plan.entries)
                    .await?
            }
            DecryptBackend::Openssl => {
                KeyGroupDecryptor::new(
                    Arc::new(OpensslCipher::from_config(config)),
                    store.clone(),
                    &config.segment_extension,
                )
                .decrypt_all(&plan.entries)
                .await?
            }
        };

        let output = Assembler::new(concatenator, &store, &workspace)
            .assemble(&list)
            .await?;
        workspace.clean_up(false).await?;

        Ok(PipelineOutcome {
            output,
            segments: list.len(),
            attempts,
        })
    }

    fn fetcher<D>(
        &self,
        downloader: D,
        store: Arc<FileSegmentStore>,
        workspace: &GameWorkspace,
        options: FetchOptions,
    ) -> BulkFetcher<D, Arc<FileSegmentStore>>
    where
        D: BulkDownloader,
    {
        let fetcher = BulkFetcher::new(downloader, store, workspace.clone(), options);
        match &self.progress {
            Some(callback) => fetcher.with_progress(callback.clone()),
            None => fetcher,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::Programs, error::ErrorKind};

    #[test]
    fn test_missing_program() {
        let config = PipelineConfig {
            programs: Programs {
                ffmpeg: "rinktv-no-such-ffmpeg".into(),
                ..Default::default()
            },
            ..Default::default()
        };
        let err = Pipeline::new(config).check_programs().unwrap_err();
        assert!(matches!(err, RinkError::MissingExecutable(_)));
        assert_eq!(err.kind(), ErrorKind::ExternalProgram);
    }

    #[tokio::test]
    async fn test_bad_stream_url_touches_nothing_remote() -> RinkResult<()> {
        let base = tempfile::tempdir()?;
        let config = PipelineConfig {
            work_dir: base.path().to_path_buf(),
            ..Default::default()
        };
        let descriptor = StreamDescriptor::new(9, "http://127.0.0.1:9/index.m3u8", "key");
        let concat = FfmpegConcat::new("ffmpeg");

        let err = Pipeline::new(config)
            .run_with(&descriptor, &concat)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ManifestFormat);
        Ok(())
    }
}
