mod origin;

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use rinktv::{
    config::{DecryptBackend, DownloaderBackend},
    error::DownloadFailure,
    ErrorKind, Pipeline, PipelineConfig, RinkError, StreamDescriptor,
};

use self::origin::{expected_output, ByteConcat, Origin, SESSION_KEY};

const GAME_ID: u64 = 2019020001;

fn config(work_dir: &std::path::Path) -> PipelineConfig {
    PipelineConfig {
        work_dir: work_dir.to_path_buf(),
        downloader: DownloaderBackend::Http,
        decrypt: DecryptBackend::Native,
        per_file_retries: 0,
        retry_wait_secs: 0,
        user_agent: Some("rinktv-test".to_string()),
        ..Default::default()
    }
}

fn archived_logs(dir: &std::path::Path) -> anyhow::Result<Vec<String>> {
    let mut names = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let name = entry?.file_name().to_string_lossy().into_owned();
        if name.starts_with(&format!("{GAME_ID}_fail_")) {
            names.push(name);
        }
    }
    Ok(names)
}

#[tokio::test]
async fn test_pipeline_two_keys_four_segments() -> anyhow::Result<()> {
    let origin = Origin::start().await;
    let base = tempfile::tempdir()?;
    let progress = Arc::new(AtomicUsize::new(0));
    let progress_inner = progress.clone();

    let pipeline = Pipeline::new(config(base.path())).with_progress(Arc::new(
        move |done: usize, total: usize| {
            assert!(done <= total);
            progress_inner.store(done, Ordering::Relaxed);
        },
    ));
    let descriptor = StreamDescriptor::new(GAME_ID, origin.stream_url(), SESSION_KEY);
    let outcome = pipeline.run_with(&descriptor, &ByteConcat).await?;

    assert_eq!(outcome.segments, 4);
    assert_eq!(outcome.attempts, 1);
    assert_eq!(outcome.output, base.path().join(format!("{GAME_ID}_raw.mkv")));
    assert_eq!(std::fs::read(&outcome.output)?, expected_output());
    assert_eq!(progress.load(Ordering::Relaxed), 4);

    // nothing but the output is left behind
    let workspace = pipeline.workspace(GAME_ID);
    assert!(!workspace.dir().exists());
    assert!(!workspace.download_log().exists());
    assert!(archived_logs(base.path())?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_pipeline_retries_failed_segment() -> anyhow::Result<()> {
    let origin = Origin::start().await;
    origin.fail("/vod/3500K/segment_3.ts", 503, 1).await;
    let base = tempfile::tempdir()?;

    let pipeline = Pipeline::new(config(base.path()));
    let descriptor = StreamDescriptor::new(GAME_ID, origin.stream_url(), SESSION_KEY);
    let outcome = pipeline.run_with(&descriptor, &ByteConcat).await?;

    assert_eq!(outcome.attempts, 2);
    assert_eq!(std::fs::read(&outcome.output)?, expected_output());

    let logs = archived_logs(base.path())?;
    assert_eq!(logs.len(), 1);
    assert!(logs[0].ends_with("_attempt1.log"));
    let log = std::fs::read_to_string(base.path().join(&logs[0]))?;
    assert!(log.contains(&format!(
        "URI={}/vod/3500K/segment_3.ts",
        origin.server.uri()
    )));
    Ok(())
}

#[tokio::test]
async fn test_pipeline_keeps_files_when_download_fails() -> anyhow::Result<()> {
    let origin = Origin::start().await;
    origin.fail("/keys/2", 404, 100).await;
    let base = tempfile::tempdir()?;

    let pipeline = Pipeline::new(PipelineConfig {
        max_attempts: 2,
        ..config(base.path())
    });
    let descriptor = StreamDescriptor::new(GAME_ID, origin.stream_url(), SESSION_KEY);
    let err = pipeline.run_with(&descriptor, &ByteConcat).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Download);
    assert!(matches!(
        err,
        RinkError::Download(DownloadFailure::AttemptsExhausted {
            attempts: 2,
            missing: 1
        })
    ));
    let workspace = pipeline.workspace(GAME_ID);
    assert!(workspace.dir().join("1.ts").exists());
    assert!(workspace.master_manifest().exists());
    assert_eq!(archived_logs(base.path())?.len(), 2);

    pipeline.clean_up(GAME_ID, false).await?;
    assert!(!workspace.dir().exists());
    Ok(())
}

#[tokio::test]
async fn test_pipeline_without_session_cookie() -> anyhow::Result<()> {
    let origin = Origin::start().await;
    let base = tempfile::tempdir()?;

    let pipeline = Pipeline::new(PipelineConfig {
        manifest_retries: 1,
        ..config(base.path())
    });
    let descriptor = StreamDescriptor::new(GAME_ID, origin.stream_url(), "wrong");
    let err = pipeline.run_with(&descriptor, &ByteConcat).await.unwrap_err();

    assert!(matches!(err, RinkError::ManifestFetchError(_)));
    assert!(!base.path().join(format!("{GAME_ID}_raw.mkv")).exists());
    Ok(())
}
