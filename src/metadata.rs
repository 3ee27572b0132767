//! Normalized video metadata and the resolver that produces it.
//!
//! The structs here are what the API serializes; field names follow the
//! camelCase shape the web client already consumes.

use std::{collections::HashSet, sync::Arc};

use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tracing::{info, instrument};

use crate::error::{PipelineError, PipelineResult};
use crate::extractor::{MediaExtractor, RawFormat, RawMetadata};
use crate::platform::{Platform, VideoReference};

pub const UNKNOWN_TITLE: &str = "Unknown Title";
pub const UNKNOWN_AUTHOR: &str = "Unknown Author";

/// Container types offered to callers. Anything else the extractor reports
/// is dropped from the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Container {
    Mp4,
    Webm,
}

impl Container {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "webm" => Some(Self::Webm),
            _ => None,
        }
    }

    /// Permissive variant used on the download path.
    pub fn parse_or_default(value: &str) -> Self {
        Self::parse(value).unwrap_or(Self::Mp4)
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => "mp4",
            Self::Webm => "webm",
        }
    }
}

/// One selectable quality/extension combination.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FormatDescriptor {
    pub quality_label: String,
    pub extension: Container,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub estimated_size_bytes: Option<u64>,
    /// Human readable size (`"12.34 MB"`), or `"Unknown"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extractor_format_id: Option<String>,
}

impl FormatDescriptor {
    fn fallback(quality_label: &str) -> Self {
        Self {
            quality_label: quality_label.to_string(),
            extension: Container::Mp4,
            resolution: None,
            estimated_size_bytes: None,
            size: None,
            extractor_format_id: None,
        }
    }

    /// Key that must be unique within a catalog.
    pub fn key(&self) -> (&str, Container) {
        (&self.quality_label, self.extension)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub title: String,
    pub duration_seconds: u64,
    pub thumbnail_url: String,
    pub author: String,
    pub platform: Platform,
    pub formats: Vec<FormatDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub video_id: Option<String>,
}

/// Options substituted when nothing selectable survives filtering.
pub fn fallback_formats() -> Vec<FormatDescriptor> {
    ["Best", "720p", "480p"]
        .into_iter()
        .map(FormatDescriptor::fallback)
        .collect()
}

/// Formats a byte count the way the web client displays it.
pub fn format_megabytes(bytes: u64) -> String {
    format!("{:.2} MB", bytes as f64 / (1024.0 * 1024.0))
}

/// Builds the catalog: allow-listed containers only, first occurrence of each
/// `(quality, extension)` wins, never empty.
pub fn build_catalog(raw: &[RawFormat]) -> Vec<FormatDescriptor> {
    let mut seen: HashSet<(String, Container)> = HashSet::new();
    let mut catalog = Vec::new();
    for format in raw {
        let Some(descriptor) = describe_format(format) else {
            continue;
        };
        if seen.insert((descriptor.quality_label.clone(), descriptor.extension)) {
            catalog.push(descriptor);
        }
    }
    if catalog.is_empty() {
        catalog = fallback_formats();
    }
    catalog
}

fn describe_format(format: &RawFormat) -> Option<FormatDescriptor> {
    let extension = Container::parse(format.ext.as_deref()?)?;
    let quality_label = format
        .format_note
        .as_deref()
        .map(str::trim)
        .filter(|note| !note.is_empty())
        .map(str::to_string)
        .or_else(|| format.height.map(|height| format!("{height}p")))
        .unwrap_or_else(|| extension.extension().to_string());
    let resolution = format
        .width
        .zip(format.height)
        .map(|(width, height)| format!("{width}x{height}"));
    let estimated_size_bytes = format
        .filesize
        .or(format.filesize_approx)
        .filter(|size| size.is_finite() && *size > 0.0)
        .map(|size| size.round() as u64);
    let size = Some(
        estimated_size_bytes
            .map(format_megabytes)
            .unwrap_or_else(|| "Unknown".to_string()),
    );

    Some(FormatDescriptor {
        quality_label,
        extension,
        resolution,
        estimated_size_bytes,
        size,
        extractor_format_id: format.format_id.clone(),
    })
}

fn non_blank(value: Option<&String>) -> Option<String> {
    value
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

/// Maps the extractor's record onto [`MediaMetadata`]; never yields nulls.
pub fn normalize(platform: Platform, raw: &RawMetadata) -> MediaMetadata {
    let duration_seconds = raw
        .duration
        .filter(|duration| duration.is_finite() && *duration > 0.0)
        .map(|duration| duration.round() as u64)
        .unwrap_or(0);
    let author = non_blank(raw.uploader.as_ref())
        .or_else(|| non_blank(raw.creator.as_ref()))
        .or_else(|| non_blank(raw.channel.as_ref()))
        .unwrap_or_else(|| UNKNOWN_AUTHOR.to_string());

    MediaMetadata {
        title: non_blank(raw.title.as_ref()).unwrap_or_else(|| UNKNOWN_TITLE.to_string()),
        duration_seconds,
        thumbnail_url: non_blank(raw.thumbnail.as_ref()).unwrap_or_default(),
        author,
        platform,
        formats: build_catalog(raw.formats.as_deref().unwrap_or_default()),
        video_id: non_blank(raw.id.as_ref()),
    }
}

/// Drives detection and extraction for the "get metadata" operation.
#[derive(Clone)]
pub struct MetadataResolver {
    extractor: Arc<dyn MediaExtractor>,
    permits: Arc<Semaphore>,
}

impl MetadataResolver {
    pub fn new(extractor: Arc<dyn MediaExtractor>, concurrency: usize) -> Self {
        Self {
            extractor,
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
        }
    }

    #[instrument(skip(self))]
    pub async fn resolve(&self, url: &str) -> PipelineResult<MediaMetadata> {
        // Detection runs before a permit is taken so bad input never queues.
        let reference = VideoReference::parse(url)?;
        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| PipelineError::ExtractionFailure("resolver is shutting down".into()))?;

        let raw = self
            .extractor
            .fetch_metadata(&reference.url)
            .await
            .map_err(|err| err.into_extraction_failure())?;
        let metadata = normalize(reference.platform, &raw);
        info!(
            platform = %reference.platform,
            formats = metadata.formats.len(),
            "resolved metadata"
        );
        Ok(metadata)
    }
}
