use std::fmt;

use serde::Serialize;

const YOUTUBE_PATTERNS: [&str; 2] = ["youtube.com", "youtu.be"];
const TIKTOK_PATTERNS: [&str; 1] = ["tiktok.com"];

/// Coarse site category that drives header and format-selector policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Youtube,
    Tiktok,
    Other,
}

impl Platform {
    /// Classifies a URL by substring match on known domains. Never fails and
    /// never touches the network.
    pub fn classify(url: &str) -> Self {
        let lower = url.to_ascii_lowercase();

        if YOUTUBE_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
            Platform::Youtube
        } else if TIKTOK_PATTERNS.iter().any(|pattern| lower.contains(pattern)) {
            Platform::Tiktok
        } else {
            Platform::Other
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Youtube => "youtube",
            Platform::Tiktok => "tiktok",
            Platform::Other => "other",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
