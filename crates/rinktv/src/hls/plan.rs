use std::{fmt::Write, sync::LazyLock};

use regex::Regex;

use crate::{
    error::{RinkError, RinkResult},
    store::StoreItem,
};

/// Segments kept by [SegmentPlan::shorten].
pub const DEBUG_SEGMENT_LIMIT: usize = 45;

static KEY_DIRECTIVE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)"([^"]*)",\s*IV=0x([0-9a-f]+)"#).expect("valid key directive regex")
});

/// One decryptable media unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentPlanEntry {
    /// Number of the `EXT-X-KEY` directive protecting this segment, 0 if none.
    pub key_number: u64,
    pub segment_number: u64,
    /// Hex IV without the `0x` prefix.
    pub iv: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadItem {
    pub source: String,
    pub target: StoreItem,
}

/// Source/destination pairs handed to the bulk fetcher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadManifest {
    pub items: Vec<DownloadItem>,
}

impl DownloadManifest {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn segment_count(&self) -> usize {
        self.items.iter().filter(|i| i.target.is_segment()).count()
    }

    /// aria2 input file: the url, then an indented `out=` option line.
    pub fn render(&self, extension: &str) -> String {
        let mut output = String::new();
        for item in &self.items {
            // writing into a String cannot fail
            let _ = writeln!(output, "{}", item.source);
            let _ = writeln!(output, " out={}", item.target.relative_path(extension));
        }
        output
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SegmentPlan {
    pub downloads: DownloadManifest,
    pub entries: Vec<SegmentPlanEntry>,
}

impl SegmentPlan {
    /// Number of distinct keys referenced by the plan.
    pub fn key_count(&self) -> usize {
        self.downloads
            .items
            .iter()
            .filter(|i| matches!(i.target, StoreItem::Key(_)))
            .count()
    }

    /// Cut the plan down to its first [DEBUG_SEGMENT_LIMIT] segments and the
    /// downloads those segments need. Never use this for a real archive.
    pub fn shorten(mut self) -> Self {
        tracing::warn!("Shortening plan to {DEBUG_SEGMENT_LIMIT} segments for testing.");
        self.entries.truncate(DEBUG_SEGMENT_LIMIT);
        let (last_key, last_segment) = self
            .entries
            .last()
            .map(|e| (e.key_number, e.segment_number))
            .unwrap_or_default();
        self.downloads.items.retain(|item| match item.target {
            StoreItem::Key(n) => n <= last_key,
            StoreItem::Segment(n) => n <= last_segment,
        });
        self
    }
}

/// What a single playlist line contributed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanLine {
    Key { key_number: u64, uri: String },
    Segment { entry: SegmentPlanEntry, uri: String },
    Other,
}

/// Parser state carried from one playlist line to the next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanState {
    pub key_number: u64,
    pub segment_number: u64,
    pub iv: String,
}

impl Default for PlanState {
    fn default() -> Self {
        Self {
            key_number: 0,
            segment_number: 0,
            iv: "0".to_string(),
        }
    }
}

impl PlanState {
    /// Next state after `line`, and what the line means.
    pub fn step(&self, line: &str, extension: &str) -> RinkResult<(Self, PlanLine)> {
        let line = line.trim();
        if line.contains("EXT-X-KEY") {
            let captures = KEY_DIRECTIVE.captures(line).ok_or_else(|| {
                RinkError::ManifestFormat(format!("IV or key url did not match in {line}"))
            })?;
            let key_number = self.key_number + 1;
            let next = Self {
                key_number,
                segment_number: self.segment_number,
                iv: captures[2].to_string(),
            };
            return Ok((
                next,
                PlanLine::Key {
                    key_number,
                    uri: captures[1].to_string(),
                },
            ));
        }

        if !line.starts_with('#') && is_segment_line(line, extension) {
            let segment_number = self.segment_number + 1;
            let entry = SegmentPlanEntry {
                key_number: self.key_number,
                segment_number,
                iv: self.iv.clone(),
            };
            let next = Self {
                segment_number,
                ..self.clone()
            };
            return Ok((
                next,
                PlanLine::Segment {
                    entry,
                    uri: line.to_string(),
                },
            ));
        }

        Ok((self.clone(), PlanLine::Other))
    }
}

fn is_segment_line(line: &str, extension: &str) -> bool {
    line.len() > extension.len()
        && line.ends_with(extension)
        && line[..line.len() - extension.len()].ends_with('.')
}

fn absolute(root: &str, uri: &str) -> String {
    if uri.contains("://") {
        uri.to_string()
    } else {
        format!("{root}{uri}")
    }
}

/// Fold a media playlist into its [SegmentPlan].
///
/// `playlist_root` is prefixed to relative key and segment uris.
pub fn build_plan(playlist: &str, playlist_root: &str, extension: &str) -> RinkResult<SegmentPlan> {
    let (_, plan) = playlist.lines().try_fold(
        (PlanState::default(), SegmentPlan::default()),
        |(state, mut plan), line| {
            let (next, parsed) = state.step(line, extension)?;
            match parsed {
                PlanLine::Key { key_number, uri } => {
                    plan.downloads.items.push(DownloadItem {
                        source: absolute(playlist_root, &uri),
                        target: StoreItem::Key(key_number),
                    });
                }
                PlanLine::Segment { entry, uri } => {
                    plan.downloads.items.push(DownloadItem {
                        source: absolute(playlist_root, &uri),
                        target: StoreItem::Segment(entry.segment_number),
                    });
                    plan.entries.push(entry);
                }
                PlanLine::Other => {}
            }
            Ok::<_, RinkError>((next, plan))
        },
    )?;

    tracing::info!(
        "Playlist has {} segment(s) under {} key(s).",
        plan.entries.len(),
        plan.key_count()
    );
    Ok(plan)
}
