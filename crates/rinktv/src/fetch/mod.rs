mod aria2;
mod http;
pub mod failures;

pub use aria2::Aria2Downloader;
pub use http::HttpBulkDownloader;

use std::{
    collections::HashSet,
    future::Future,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

use crate::{
    config::PipelineConfig,
    error::{DownloadFailure, RinkResult},
    hls::DownloadManifest,
    layout::GameWorkspace,
    store::{SegmentStore, StoreItem},
};

/// One invocation of a bulk downloader.
pub struct BulkJob<'a> {
    pub manifest: &'a DownloadManifest,
    /// The rendered manifest, already written to disk.
    pub manifest_file: &'a Path,
    pub log_file: &'a Path,
    pub attempt: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkOutcome {
    /// The downloader claims every file completed.
    pub succeeded: bool,
    /// Sources that failed, when the downloader reports them directly.
    /// `None` means the log has to be read instead.
    pub failed_sources: Option<Vec<String>>,
}

/// Something that downloads a whole [DownloadManifest] concurrently.
pub trait BulkDownloader: Send + Sync {
    fn download(
        &self,
        job: &BulkJob<'_>,
        progress: &ProgressReporter,
    ) -> impl Future<Output = RinkResult<BulkOutcome>> + Send;
}

impl<D> BulkDownloader for Arc<D>
where
    D: BulkDownloader,
{
    fn download(
        &self,
        job: &BulkJob<'_>,
        progress: &ProgressReporter,
    ) -> impl Future<Output = RinkResult<BulkOutcome>> + Send {
        self.as_ref().download(job, progress)
    }
}

pub type ProgressCallback = Arc<dyn Fn(usize, usize) + Send + Sync>;

/// Counts finished segments across all attempts of one fetch.
#[derive(Clone)]
pub struct ProgressReporter {
    done: Arc<AtomicUsize>,
    total: usize,
    callback: Option<ProgressCallback>,
}

impl ProgressReporter {
    pub fn new(total: usize, callback: Option<ProgressCallback>) -> Self {
        Self {
            done: Arc::new(AtomicUsize::new(0)),
            total,
            callback,
        }
    }

    pub fn done(&self) -> usize {
        self.done.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn segment_done(&self, name: &str) {
        let result = self
            .done
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |done| {
                (done < self.total).then_some(done + 1)
            });
        let Ok(previous) = result else {
            return;
        };

        let done = previous + 1;
        let percentage = if self.total == 0 {
            0.
        } else {
            done as f32 / self.total as f32 * 100.
        };
        tracing::info!(
            "Downloading {name} finished. ({done} / {} or {percentage:.2}%)",
            self.total
        );
        if let Some(callback) = &self.callback {
            callback(done, self.total);
        }
    }
}

/// Items of `pending` that are not complete yet, in their original order.
///
/// Items are matched by destination, so a url listed twice is retried only
/// for the destination that is actually missing.
pub fn narrow_manifest(pending: &DownloadManifest, missing: &HashSet<StoreItem>) -> DownloadManifest {
    DownloadManifest {
        items: pending
            .items
            .iter()
            .filter(|item| missing.contains(&item.target))
            .cloned()
            .collect(),
    }
}

#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub max_attempts: u32,
    pub outage_threshold: usize,
    pub extension: String,
}

impl From<&PipelineConfig> for FetchOptions {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            outage_threshold: config.outage_threshold,
            extension: config.segment_extension.clone(),
        }
    }
}

/// Drives a [BulkDownloader] until every item of a manifest is in the store.
pub struct BulkFetcher<D, S> {
    downloader: D,
    store: S,
    workspace: GameWorkspace,
    options: FetchOptions,
    progress: Option<ProgressCallback>,
}

impl<D, S> BulkFetcher<D, S>
where
    D: BulkDownloader,
    S: SegmentStore,
{
    pub fn new(downloader: D, store: S, workspace: GameWorkspace, options: FetchOptions) -> Self {
        Self {
            downloader,
            store,
            workspace,
            options,
            progress: None,
        }
    }

    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    async fn missing_items(&self, manifest: &DownloadManifest) -> HashSet<StoreItem> {
        let mut missing = HashSet::new();
        for item in &manifest.items {
            if !self.store.exists(item.target).await {
                missing.insert(item.target);
            }
        }
        missing
    }

    async fn failed_sources(&self, outcome: BulkOutcome) -> Vec<String> {
        match outcome.failed_sources {
            Some(mut sources) => {
                let mut seen = HashSet::new();
                sources.retain(|s| seen.insert(s.clone()));
                sources
            }
            None => match tokio::fs::read_to_string(self.workspace.download_log()).await {
                Ok(log) => failures::parse_failed_uris(&log),
                Err(e) => {
                    tracing::warn!("Failed to read download log: {e}");
                    Vec::new()
                }
            },
        }
    }

    /// Download everything in `manifest`, returning the number of attempts used.
    pub async fn fetch_all(
        &self,
        manifest: &DownloadManifest,
        expected_segments: usize,
    ) -> RinkResult<u32> {
        let progress = ProgressReporter::new(expected_segments, self.progress.clone());
        let manifest_file = self.workspace.download_file();
        let log_file = self.workspace.download_log();

        let mut pending = manifest.clone();
        for attempt in 1..=self.options.max_attempts {
            tracing::info!(
                "Download attempt {attempt}/{}: {} file(s).",
                self.options.max_attempts,
                pending.len()
            );
            tokio::fs::write(&manifest_file, pending.render(&self.options.extension)).await?;

            let job = BulkJob {
                manifest: &pending,
                manifest_file: &manifest_file,
                log_file: &log_file,
                attempt,
            };
            let outcome = self.downloader.download(&job, &progress).await?;
            let succeeded = outcome.succeeded;
            let missing = self.missing_items(&pending).await;
            if succeeded && missing.is_empty() {
                tracing::info!("Downloaded {} file(s) in {attempt} attempt(s).", manifest.len());
                return Ok(attempt);
            }

            let failed = self.failed_sources(outcome).await;
            self.workspace.archive_download_log(attempt).await?;

            if failed.len() > self.options.outage_threshold {
                tracing::error!(
                    "{} distinct urls failed on attempt {attempt}, giving up.",
                    failed.len()
                );
                return Err(DownloadFailure::SystemicOutage {
                    attempt,
                    failed: failed.len(),
                }
                .into());
            }

            if missing.is_empty() {
                tracing::warn!(
                    "Downloader reported {} failure(s) but every file is present.",
                    failed.len()
                );
                return Ok(attempt);
            }

            let reported: HashSet<&str> = failed.iter().map(String::as_str).collect();
            let unreported = pending
                .items
                .iter()
                .filter(|i| missing.contains(&i.target) && !reported.contains(i.source.as_str()))
                .count();
            if unreported > 0 {
                tracing::warn!("{unreported} missing file(s) were not reported as failed.");
            }

            pending = narrow_manifest(&pending, &missing);
            tracing::warn!(
                "Attempt {attempt} failed: {} url(s) reported, {} file(s) missing.",
                failed.len(),
                pending.len()
            );
        }

        let missing = self.missing_items(manifest).await.len();
        tracing::error!(
            "Game {}: {missing} file(s) still missing after {} attempt(s).",
            self.workspace.game_id(),
            self.options.max_attempts
        );
        Err(DownloadFailure::AttemptsExhausted {
            attempts: self.options.max_attempts,
            missing,
        }
        .into())
    }
}
