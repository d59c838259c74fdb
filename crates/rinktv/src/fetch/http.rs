use std::{fmt::Write, num::NonZeroU32, sync::Arc, time::Duration};

use tokio::{sync::Semaphore, task::JoinSet};

use super::{BulkDownloader, BulkJob, BulkOutcome, ProgressReporter};
use crate::{
    config::PipelineConfig,
    error::{RinkError, RinkResult},
    hls::DownloadItem,
    http::HttpClient,
    store::SegmentStore,
};

/// Downloads a manifest in-process, writing straight into a [SegmentStore].
///
/// Failures are returned directly, and also written to the job's log file in
/// the same shape aria2 uses so archived logs read the same for both backends.
pub struct HttpBulkDownloader<S> {
    client: HttpClient,
    store: Arc<S>,
    concurrency: NonZeroU32,
    retries: u32,
    retry_wait: Duration,
}

impl<S> HttpBulkDownloader<S>
where
    S: SegmentStore,
{
    pub fn new(client: HttpClient, store: Arc<S>, config: &PipelineConfig) -> Self {
        Self {
            client,
            store,
            concurrency: config.concurrency,
            retries: config.per_file_retries,
            retry_wait: config.retry_wait(),
        }
    }

    pub fn with_retry_wait(mut self, retry_wait: Duration) -> Self {
        self.retry_wait = retry_wait;
        self
    }
}

async fn fetch_bytes(client: &HttpClient, url: &str) -> RinkResult<Vec<u8>> {
    let response = client.get(url).send().await?;
    if !response.status().is_success() {
        return Err(RinkError::HttpError(response.status()));
    }
    Ok(response.bytes().await?.to_vec())
}

async fn fetch_item<S: SegmentStore>(
    client: &HttpClient,
    store: &S,
    item: &DownloadItem,
    retries: u32,
    retry_wait: Duration,
) -> RinkResult<()> {
    let mut retries = retries;
    loop {
        let result = match fetch_bytes(client, &item.source).await {
            Ok(data) => store.write(item.target, data).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) => {
                if retries == 0 {
                    return Err(e);
                }
                retries -= 1;
                tracing::warn!("Downloading {} failed, retry later. {e}", item.source);
                tokio::time::sleep(retry_wait).await;
            }
        }
    }
}

impl<S> BulkDownloader for HttpBulkDownloader<S>
where
    S: SegmentStore,
{
    async fn download(
        &self,
        job: &BulkJob<'_>,
        progress: &ProgressReporter,
    ) -> RinkResult<BulkOutcome> {
        tracing::info!(
            "Start downloading {} file(s) with {} thread(s).",
            job.manifest.len(),
            self.concurrency.get()
        );

        let permits = Arc::new(Semaphore::new(self.concurrency.get() as usize));
        let mut tasks = JoinSet::new();
        for (index, item) in job.manifest.items.iter().cloned().enumerate() {
            let permits = permits.clone();
            let client = self.client.clone();
            let store = self.store.clone();
            let progress = progress.clone();
            let retries = self.retries;
            let retry_wait = self.retry_wait;

            tasks.spawn(async move {
                let result = match permits.acquire().await {
                    Ok(_permit) => {
                        fetch_item(&client, store.as_ref(), &item, retries, retry_wait).await
                    }
                    Err(e) => Err(RinkError::IOError(std::io::Error::other(e))),
                };
                if result.is_ok() && item.target.is_segment() {
                    progress.segment_done(&item.source);
                }
                (index, item, result)
            });
        }

        let mut finished = Vec::with_capacity(job.manifest.len());
        while let Some(joined) = tasks.join_next().await {
            finished.push(joined?);
        }
        finished.sort_by_key(|(index, _, _)| *index);

        let mut log = String::new();
        let mut failed = Vec::new();
        for (index, item, result) in finished {
            let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.6f");
            match result {
                Ok(()) => {
                    let _ = writeln!(log, "{timestamp} [NOTICE] Download complete: {}", item.source);
                }
                Err(e) => {
                    tracing::error!("Downloading {} failed, max retries exceed. {e}", item.source);
                    let _ = writeln!(
                        log,
                        "{timestamp} [ERROR] CUID#{index} - Download aborted. URI={}",
                        item.source
                    );
                    let _ = writeln!(log, "Exception: {e}");
                    failed.push(item.source);
                }
            }
        }
        tokio::fs::write(job.log_file, log).await?;

        Ok(BulkOutcome {
            succeeded: failed.is_empty(),
            failed_sources: Some(failed),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        fetch::failures::parse_failed_uris,
        hls::DownloadManifest,
        store::{MemorySegmentStore, StoreItem},
    };
    use reqwest::Client;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    async fn run(
        store: Arc<MemorySegmentStore>,
        manifest: &DownloadManifest,
    ) -> RinkResult<(BulkOutcome, String)> {
        let dir = tempfile::tempdir()?;
        let log_file = dir.path().join("dl.log");
        let manifest_file = dir.path().join("download_file.txt");
        let config = PipelineConfig {
            per_file_retries: 2,
            ..Default::default()
        };
        let downloader = HttpBulkDownloader::new(HttpClient::new(Client::builder())?, store, &config)
            .with_retry_wait(Duration::ZERO);
        let job = BulkJob {
            manifest,
            manifest_file: &manifest_file,
            log_file: &log_file,
            attempt: 1,
        };
        let progress = ProgressReporter::new(manifest.segment_count(), None);
        let outcome = downloader.download(&job, &progress).await?;
        Ok((outcome, std::fs::read_to_string(log_file)?))
    }

    #[tokio::test]
    async fn test_download_into_store() -> RinkResult<()> {
        let server = MockServer::start().await;
        for (name, body) in [("/key/1", "0123456789abcdef"), ("/1.ts", "one"), ("/2.ts", "two")] {
            Mock::given(method("GET"))
                .and(path(name))
                .respond_with(ResponseTemplate::new(200).set_body_string(body))
                .mount(&server)
                .await;
        }

        let manifest = DownloadManifest {
            items: vec![
                DownloadItem {
                    source: format!("{}/key/1", server.uri()),
                    target: StoreItem::Key(1),
                },
                DownloadItem {
                    source: format!("{}/1.ts", server.uri()),
                    target: StoreItem::Segment(1),
                },
                DownloadItem {
                    source: format!("{}/2.ts", server.uri()),
                    target: StoreItem::Segment(2),
                },
            ],
        };
        let store = Arc::new(MemorySegmentStore::new());
        let (outcome, log) = run(store.clone(), &manifest).await?;

        assert!(outcome.succeeded);
        assert_eq!(outcome.failed_sources, Some(vec![]));
        assert_eq!(store.read(StoreItem::Key(1)).await?, b"0123456789abcdef");
        assert_eq!(store.read(StoreItem::Segment(2)).await?, b"two");
        assert!(parse_failed_uris(&log).is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_failures_are_reported_and_logged() -> RinkResult<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/1.ts"))
            .respond_with(ResponseTemplate::new(200).set_body_string("one"))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/2.ts"))
            .respond_with(ResponseTemplate::new(404))
            .expect(3)
            .mount(&server)
            .await;

        let missing = format!("{}/2.ts", server.uri());
        let manifest = DownloadManifest {
            items: vec![
                DownloadItem {
                    source: format!("{}/1.ts", server.uri()),
                    target: StoreItem::Segment(1),
                },
                DownloadItem {
                    source: missing.clone(),
                    target: StoreItem::Segment(2),
                },
            ],
        };
        let store = Arc::new(MemorySegmentStore::new());
        let (outcome, log) = run(store.clone(), &manifest).await?;

        assert!(!outcome.succeeded);
        assert_eq!(outcome.failed_sources, Some(vec![missing.clone()]));
        assert_eq!(parse_failed_uris(&log), vec![missing]);
        assert!(store.exists(StoreItem::Segment(1)).await);
        assert!(!store.exists(StoreItem::Segment(2)).await);
        Ok(())
    }
}
