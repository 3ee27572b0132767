//! URL classification. Pure string parsing, never any network I/O, so it can
//! run before anything expensive is spawned.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{PipelineError, PipelineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Instagram,
    Tiktok,
    Facebook,
    Twitter,
    Vimeo,
}

/// Host patterns in match order. First hit wins.
const HOST_PATTERNS: &[(&str, Platform)] = &[
    ("youtube.com", Platform::Youtube),
    ("youtu.be", Platform::Youtube),
    ("instagram.com", Platform::Instagram),
    ("tiktok.com", Platform::Tiktok),
    ("facebook.com", Platform::Facebook),
    ("fb.watch", Platform::Facebook),
    ("twitter.com", Platform::Twitter),
    ("x.com", Platform::Twitter),
    ("vimeo.com", Platform::Vimeo),
];

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Youtube => "youtube",
            Self::Instagram => "instagram",
            Self::Tiktok => "tiktok",
            Self::Facebook => "facebook",
            Self::Twitter => "twitter",
            Self::Vimeo => "vimeo",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A URL paired with the platform it was detected as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VideoReference {
    pub url: String,
    pub platform: Platform,
}

impl VideoReference {
    pub fn parse(raw: &str) -> PipelineResult<Self> {
        let platform = detect(raw)?;
        Ok(Self {
            url: raw.trim().to_string(),
            platform,
        })
    }
}

pub fn detect(raw: &str) -> PipelineResult<Platform> {
    let trimmed = raw.trim();
    let parsed = Url::parse(trimmed).map_err(|_| PipelineError::InvalidUrl(trimmed.into()))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(PipelineError::InvalidUrl(trimmed.into()));
    }
    let host = parsed
        .host_str()
        .filter(|host| !host.is_empty())
        .ok_or_else(|| PipelineError::InvalidUrl(trimmed.into()))?
        .to_ascii_lowercase();
    let host = host
        .strip_prefix("www.")
        .or_else(|| host.strip_prefix("m."))
        .unwrap_or(&host);

    HOST_PATTERNS
        .iter()
        .find(|(pattern, _)| host_matches(host, pattern))
        .map(|(_, platform)| *platform)
        .ok_or_else(|| PipelineError::UnsupportedPlatform(trimmed.into()))
}

fn host_matches(host: &str, pattern: &str) -> bool {
    host == pattern
        || host
            .strip_suffix(pattern)
            .is_some_and(|prefix| prefix.ends_with('.'))
}
