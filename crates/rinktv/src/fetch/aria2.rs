use std::{path::PathBuf, time::Duration};

use super::{failures, BulkDownloader, BulkJob, BulkOutcome, ProgressReporter};
use crate::{
    config::PipelineConfig, error::RinkResult, layout::GameWorkspace, process::ExternalCommand,
    StreamDescriptor,
};

/// Runs the whole manifest through one `aria2c` process.
///
/// aria2 exits 0 only if every file completed. Which files failed is read
/// back from its log by the caller.
pub struct Aria2Downloader {
    program: PathBuf,
    dir: PathBuf,
    concurrency: u32,
    per_file_retries: u32,
    retry_wait: Duration,
    headers: Vec<String>,
    user_agent: String,
    extension: String,
    timeout: Duration,
}

impl Aria2Downloader {
    pub fn new(
        config: &PipelineConfig,
        descriptor: &StreamDescriptor,
        workspace: &GameWorkspace,
    ) -> Self {
        let mut headers = vec![
            "Accept: */*".to_string(),
            "Accept-Language: en-US,en;q=0.8".to_string(),
        ];
        if let Some(origin) = &config.origin {
            headers.push(format!("Origin: {origin}"));
        }
        headers.push(format!(
            "Cookie: {}",
            descriptor.session_cookie(&config.session_cookie)
        ));

        Self {
            program: config.programs.aria2c.clone(),
            dir: workspace.dir(),
            concurrency: config.concurrency.get(),
            per_file_retries: config.per_file_retries,
            retry_wait: config.retry_wait(),
            headers,
            user_agent: config.user_agent(),
            extension: config.segment_extension.clone(),
            timeout: config.bulk_timeout(),
        }
    }

    pub fn command(&self, job: &BulkJob<'_>) -> ExternalCommand {
        let mut command = ExternalCommand::new(&self.program)
            .arg("-i")
            .arg(job.manifest_file)
            .arg(format!("-j{}", self.concurrency))
            .arg(format!("--dir={}", self.dir.display()))
            .arg(format!("--log={}", job.log_file.display()))
            .args([
                "--log-level=notice",
                "--console-log-level=notice",
                "--summary-interval=0",
                "--quiet=false",
                "--enable-http-pipelining=true",
                "--auto-file-renaming=false",
                "--allow-overwrite=true",
            ])
            .arg(format!("--retry-wait={}", self.retry_wait.as_secs()))
            // aria2 counts the first try
            .arg(format!("--max-tries={}", self.per_file_retries + 1))
            .arg(format!("--user-agent={}", self.user_agent));
        for header in &self.headers {
            command = command.arg(format!("--header={header}"));
        }
        command.timeout(self.timeout)
    }

    /// Remove files aria2 left half-written, recognised by their `.aria2` control file.
    async fn remove_partial_files(&self, job: &BulkJob<'_>) -> RinkResult<()> {
        for item in &job.manifest.items {
            let path = self.dir.join(item.target.relative_path(&self.extension));
            let mut control = path.clone().into_os_string();
            control.push(".aria2");
            let control = PathBuf::from(control);
            if !control.exists() {
                continue;
            }

            tracing::debug!("Removing partial download {}", path.display());
            if path.exists() {
                tokio::fs::remove_file(&path).await?;
            }
            tokio::fs::remove_file(&control).await?;
        }
        Ok(())
    }
}

impl BulkDownloader for Aria2Downloader {
    async fn download(
        &self,
        job: &BulkJob<'_>,
        progress: &ProgressReporter,
    ) -> RinkResult<BulkOutcome> {
        tracing::info!(
            "Start downloading {} file(s) with aria2c, {} connection(s).",
            job.manifest.len(),
            self.concurrency
        );

        let output = self
            .command(job)
            .run_streaming(|line| {
                if failures::is_segment_complete(line, &self.extension) {
                    if let Some(name) = line.rsplit('/').next() {
                        progress.segment_done(name.trim());
                    }
                }
            })
            .await?;

        let succeeded = output.success();
        if !succeeded {
            tracing::warn!("aria2c exited with {}", output.status);
            self.remove_partial_files(job).await?;
        }
        Ok(BulkOutcome {
            succeeded,
            failed_sources: None,
        })
    }
}
