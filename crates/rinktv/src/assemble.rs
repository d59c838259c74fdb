use std::{
    fmt::Write,
    future::Future,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    config::PipelineConfig,
    error::{RinkError, RinkResult},
    layout::GameWorkspace,
    process::ExternalCommand,
    store::{SegmentStore, StoreItem},
};

/// Decrypted segments in playback order.
///
/// Always ascending and gapless from segment 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssemblyList {
    segments: Vec<u64>,
    extension: String,
}

impl AssemblyList {
    pub fn new<E: Into<String>>(mut segments: Vec<u64>, extension: E) -> RinkResult<Self> {
        segments.sort_unstable();
        for (expected, found) in (1..).zip(segments.iter().copied()) {
            if expected != found {
                return Err(RinkError::AssemblyOrder { expected, found });
            }
        }

        Ok(Self {
            segments,
            extension: extension.into(),
        })
    }

    pub fn segments(&self) -> &[u64] {
        &self.segments
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    pub fn file_name(&self, segment_number: u64) -> String {
        StoreItem::Segment(segment_number).relative_path(&self.extension)
    }

    /// Lines of the ffmpeg concat list, `file <segmentNumber>.<ext>`.
    pub fn lines(&self) -> Vec<String> {
        self.segments
            .iter()
            .map(|n| format!("file {}", self.file_name(*n)))
            .collect()
    }

    pub fn render(&self) -> String {
        self.lines().iter().fold(String::new(), |mut output, line| {
            let _ = writeln!(output, "{line}");
            output
        })
    }
}

/// Joins the files named by a concat list into one container without re-encoding.
pub trait Concatenator: Send + Sync {
    fn concatenate(
        &self,
        list_file: &Path,
        output: &Path,
    ) -> impl Future<Output = RinkResult<()>> + Send;
}

/// ffmpeg's concat demuxer with stream copy.
pub struct FfmpegConcat {
    program: PathBuf,
    extra_args: Vec<String>,
    timeout: Duration,
}

impl FfmpegConcat {
    pub fn new<P: Into<PathBuf>>(program: P) -> Self {
        Self {
            program: program.into(),
            extra_args: Vec::new(),
            timeout: Duration::from_secs(5 * 60),
        }
    }

    pub fn from_config(config: &PipelineConfig) -> Self {
        Self::new(&config.programs.ffmpeg)
            .extra_args(config.concat_extra_args())
            .timeout(config.command_timeout())
    }

    /// Arguments placed after `-c copy`, such as a bitstream filter.
    pub fn extra_args(mut self, args: Vec<String>) -> Self {
        self.extra_args = args;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Runs in the caller's directory. The concat demuxer resolves the
    /// `file` entries relative to the list file.
    pub fn command(&self, list_file: &Path, output: &Path) -> ExternalCommand {
        ExternalCommand::new(&self.program)
            .args(["-y", "-nostats", "-loglevel", "error"])
            .args(["-f", "concat", "-safe", "0", "-i"])
            .arg(list_file)
            .args(["-c", "copy"])
            .args(&self.extra_args)
            .arg(output)
            .timeout(self.timeout)
    }
}

impl Concatenator for FfmpegConcat {
    async fn concatenate(&self, list_file: &Path, output: &Path) -> RinkResult<()> {
        tracing::debug!("Concatenating with ffmpeg CLI...");
        self.command(list_file, output).run_checked().await?;
        Ok(())
    }
}

/// Writes the concat list, joins the segments and removes them afterwards.
pub struct Assembler<'a, C, S> {
    concatenator: &'a C,
    store: &'a S,
    workspace: &'a GameWorkspace,
}

impl<'a, C, S> Assembler<'a, C, S>
where
    C: Concatenator,
    S: SegmentStore,
{
    pub fn new(concatenator: &'a C, store: &'a S, workspace: &'a GameWorkspace) -> Self {
        Self {
            concatenator,
            store,
            workspace,
        }
    }

    /// Concatenate `list` into the workspace's raw output.
    ///
    /// Segment files are removed only once concatenation succeeded.
    pub async fn assemble(&self, list: &AssemblyList) -> RinkResult<PathBuf> {
        if list.is_empty() {
            return Err(RinkError::ManifestFormat(
                "Nothing to assemble, playlist had no segments".to_string(),
            ));
        }
        for segment_number in list.segments() {
            if !self.store.exists(StoreItem::Segment(*segment_number)).await {
                return Err(RinkError::MissingSegment(*segment_number));
            }
        }

        let list_file = self.workspace.concat_file();
        tokio::fs::write(&list_file, list.render()).await?;

        let output = self.workspace.raw_output();
        log::info!("Merging {} segment(s)...", list.len());
        if let Err(e) = self.concatenator.concatenate(&list_file, &output).await {
            tracing::error!(
                "Concatenation failed, segments kept in {} for manual recovery.",
                self.workspace.dir().display()
            );
            return Err(e);
        }

        for segment_number in list.segments() {
            self.store.remove(StoreItem::Segment(*segment_number)).await?;
        }
        log::info!(
            "All finished. Please checkout your files at {}",
            output.display()
        );
        Ok(output)
    }
}
