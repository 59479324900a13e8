//! Media-kind checks for fetched resources.
//!
//! Upstream metadata is unreliable, so an animated resource is accepted on
//! either of two signals: a declared content type that is animated, or a URL
//! that looks like animated content. The URL signal is a plain pattern match
//! and can be fooled by a static file served from an animated-looking path.

// lazy_regex! uses once_cell internally
#![allow(clippy::non_std_lazy_statics)]

use crate::gateway::upstream::UpstreamClient;
use lazy_regex::lazy_regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Animated file extensions at the end of the URL path
static RE_ANIMATED_EXT: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"(?i)\.(gif|gifv|webp|mp4|webm)(?:$|[?#])");

/// Hosts that only serve animated content
static RE_ANIMATED_HOST: lazy_regex::Lazy<regex::Regex> =
    lazy_regex!(r"(?i)^https?://(?:[a-z0-9-]+\.)*(?:giphy\.com|tenor\.com|gfycat\.com|redgifs\.com)(?:[:/?#]|$)");

/// Kind of media a category must deliver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// GIF or short video
    Animated,
    /// Still image
    Static,
    /// No requirement
    #[default]
    Any,
}

impl MediaKind {
    /// Whether resources of this kind need a format check
    #[must_use]
    pub const fn requires_check(self) -> bool {
        matches!(self, Self::Animated)
    }
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Animated => "animated",
            Self::Static => "static",
            Self::Any => "any",
        })
    }
}

/// Whether a content type denotes animated media
#[must_use]
pub fn is_animated_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    matches!(essence.as_str(), "image/gif" | "image/webp" | "image/apng")
        || essence.starts_with("video/")
}

/// Whether a URL matches known animated-content patterns
#[must_use]
pub fn is_animated_url(url: &str) -> bool {
    RE_ANIMATED_EXT.is_match(url) || RE_ANIMATED_HOST.is_match(url)
}

/// Dual-signal decision without any I/O
#[must_use]
pub fn matches_kind(content_type: Option<&str>, url: &str, expected: MediaKind) -> bool {
    match expected {
        MediaKind::Animated => {
            content_type.is_some_and(is_animated_content_type) || is_animated_url(url)
        }
        MediaKind::Static | MediaKind::Any => true,
    }
}

/// Checks fetched resources against the requested media kind
#[derive(Clone)]
pub struct ContentValidator {
    upstream: Arc<dyn UpstreamClient>,
}

impl ContentValidator {
    /// Probes go through `upstream`
    #[must_use]
    pub fn new(upstream: Arc<dyn UpstreamClient>) -> Self {
        Self { upstream }
    }

    /// Whether the resource at `url` has the expected kind.
    ///
    /// Only animated requests are checked. The URL signal is consulted first;
    /// a content-type probe runs only when it is inconclusive, and a failed
    /// probe simply contributes no signal.
    pub async fn validate(&self, url: &str, expected: MediaKind) -> bool {
        if !expected.requires_check() {
            return true;
        }
        if is_animated_url(url) {
            return true;
        }

        let content_type = match self.upstream.probe_content_type(url).await {
            Ok(content_type) => content_type,
            Err(e) => {
                debug!(url, error = %e, "Content-type probe failed");
                None
            }
        };
        let accepted = matches_kind(content_type.as_deref(), url, expected);
        debug!(url, content_type = ?content_type, accepted, "Format check");
        accepted
    }
}
