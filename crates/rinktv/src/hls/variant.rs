use std::sync::LazyLock;

use regex::Regex;

use crate::{
    config::PipelineConfig,
    error::{RinkError, RinkResult},
    http::HttpClient,
    layout::GameWorkspace,
    StreamDescriptor,
};

static BITRATE_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d+)K").expect("valid bitrate regex"));

/// One variant line of the master manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QualityVariant<'a> {
    /// Bitrate label such as `5000K`, if the line carries one.
    pub label: Option<&'a str>,
    /// The line itself, relative to the manifest root.
    pub uri: &'a str,
}

impl<'a> QualityVariant<'a> {
    fn from_line(line: &'a str) -> Self {
        Self {
            label: BITRATE_LABEL.find(line).map(|m| m.as_str()),
            uri: line,
        }
    }

    pub fn kbps(&self) -> Option<u32> {
        self.label
            .and_then(|label| label.trim_end_matches('K').parse().ok())
    }
}

/// Everything in `stream_url` before the manifest file name.
pub fn manifest_root<'a>(stream_url: &'a str, manifest_name: &str) -> RinkResult<&'a str> {
    match stream_url.find(manifest_name) {
        Some(index) if !manifest_name.is_empty() => Ok(&stream_url[..index]),
        _ => Err(RinkError::ManifestFormat(format!(
            "Missing {manifest_name} in stream url {stream_url}"
        ))),
    }
}

/// Everything up to and including the last `/` of a playlist url.
pub fn playlist_root(playlist_url: &str) -> RinkResult<&str> {
    match playlist_url.rfind('/') {
        Some(index) => Ok(&playlist_url[..=index]),
        None => Err(RinkError::ManifestFormat(format!(
            "Quality url {playlist_url} has no path"
        ))),
    }
}

/// Variant lines of a master manifest, directives and blank lines skipped.
pub fn variants(manifest: &str) -> impl Iterator<Item = QualityVariant<'_>> {
    manifest
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(QualityVariant::from_line)
}

/// Pick the variant whose line contains `<quality>K`, or the last one.
pub fn select_variant(manifest: &str, quality: u32) -> RinkResult<QualityVariant<'_>> {
    let token = format!("{quality}K");
    let mut last = None;
    for variant in variants(manifest) {
        if variant.uri.contains(&token) {
            return Ok(variant);
        }
        last = Some(variant);
    }

    let fallback = last.ok_or_else(|| {
        RinkError::ManifestFormat("Master manifest lists no variants".to_string())
    })?;
    tracing::info!(
        "Quality {token} not offered, falling back to {}",
        fallback.label.unwrap_or(fallback.uri)
    );
    Ok(fallback)
}

/// Absolute url of the chosen variant playlist.
pub fn quality_url(
    stream_url: &str,
    manifest_name: &str,
    manifest: &str,
    quality: u32,
) -> RinkResult<String> {
    let root = manifest_root(stream_url, manifest_name)?;
    let variant = select_variant(manifest, quality)?;
    if variant.uri.contains("://") {
        return Ok(variant.uri.to_string());
    }
    Ok(format!("{root}{}", variant.uri))
}

/// Fetches the master manifest and the chosen variant playlist into the workspace.
pub struct ManifestResolver<'a> {
    client: &'a HttpClient,
    config: &'a PipelineConfig,
}

/// The downloaded quality playlist and where it came from.
pub struct ResolvedPlaylist {
    pub url: String,
    pub text: String,
}

impl<'a> ManifestResolver<'a> {
    pub fn new(client: &'a HttpClient, config: &'a PipelineConfig) -> Self {
        Self { client, config }
    }

    pub async fn resolve(
        &self,
        descriptor: &StreamDescriptor,
        workspace: &GameWorkspace,
    ) -> RinkResult<ResolvedPlaylist> {
        // fail before touching the network
        url::Url::parse(&descriptor.stream_url)?;
        manifest_root(&descriptor.stream_url, &self.config.manifest_name)?;

        tracing::info!("Fetching master manifest of game {}.", descriptor.game_id);
        let master = self
            .client
            .get_text(&descriptor.stream_url, self.config.manifest_retries)
            .await?;
        tokio::fs::write(workspace.master_manifest(), &master).await?;

        let url = quality_url(
            &descriptor.stream_url,
            &self.config.manifest_name,
            &master,
            self.config.quality,
        )?;
        tracing::info!("Fetching quality playlist {url}");
        let text = self
            .client
            .get_text(&url, self.config.manifest_retries)
            .await?;
        tokio::fs::write(workspace.quality_playlist(), &text).await?;

        Ok(ResolvedPlaylist { url, text })
    }
}
