use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::platform::Platform;

pub const AUDIO_CONTAINER: &str = "mp3";
pub const VIDEO_CONTAINER: &str = "mp4";

const OUTPUT_EXT_PLACEHOLDER: &str = "%(ext)s";
const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36";
const TIKTOK_REFERER: &str = "https://www.tiktok.com/";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Video,
    Audio,
}

impl MediaKind {
    /// Unknown or missing values fall back to video.
    pub fn from_param(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("audio") => MediaKind::Audio,
            _ => MediaKind::Video,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            MediaKind::Video => VIDEO_CONTAINER,
            MediaKind::Audio => AUDIO_CONTAINER,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Quality {
    Best,
    High,
    Medium,
    Low,
}

impl Quality {
    pub const ALL: [Quality; 4] = [Quality::Best, Quality::High, Quality::Medium, Quality::Low];

    /// Unknown or missing values fall back to `best`.
    pub fn from_param(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("high") => Quality::High,
            Some("medium") => Quality::Medium,
            Some("low") => Quality::Low,
            _ => Quality::Best,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Quality::Best => "best",
            Quality::High => "high",
            Quality::Medium => "medium",
            Quality::Low => "low",
        }
    }

    /// Vertical resolution ceiling for video downloads. `None` means no ceiling.
    pub fn max_height(self) -> Option<u32> {
        match self {
            Quality::Best => None,
            Quality::High => Some(1080),
            Quality::Medium => Some(720),
            Quality::Low => Some(480),
        }
    }

    /// Value for yt-dlp's `--audio-quality` scale, where 0 is best and 10 is worst.
    pub fn audio_quality(self) -> &'static str {
        match self {
            Quality::Best => "0",
            Quality::High => "2",
            Quality::Medium => "5",
            Quality::Low => "9",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadRequest {
    pub url: String,
    pub media_kind: MediaKind,
    pub quality: Quality,
}

/// A fully parameterized invocation of the external tool for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadSpec {
    pub args: Vec<String>,
    /// Template handed to the tool with `-o`.
    pub output_template: String,
    /// Path the finished artifact is expected at.
    pub output_path: PathBuf,
    pub headers: Vec<(&'static str, &'static str)>,
}

/// Transport headers a platform needs on every request to its CDN.
pub fn transport_headers(platform: Platform) -> Vec<(&'static str, &'static str)> {
    match platform {
        Platform::Tiktok => vec![("User-Agent", BROWSER_USER_AGENT), ("Referer", TIKTOK_REFERER)],
        Platform::Youtube | Platform::Other => Vec::new(),
    }
}

pub fn header_args(headers: &[(&'static str, &'static str)]) -> Vec<String> {
    headers
        .iter()
        .flat_map(|(name, value)| ["--add-header".to_string(), format!("{name}:{value}")])
        .collect()
}

/// Format selector for a merged video+audio download within the mp4 container.
/// Falls back to the best single file under the ceiling, then the best mp4,
/// then whatever is best.
pub fn video_format_selector(quality: Quality) -> String {
    match quality.max_height() {
        Some(height) => format!(
            "bestvideo[height<={height}][ext=mp4]+bestaudio[ext=m4a]/best[height<={height}]/best[ext=mp4]/best"
        ),
        None => "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best".to_string(),
    }
}

/// Builds the tool invocation for a download. The same inputs always produce
/// the same argument list.
pub fn build_download_spec(
    request: &DownloadRequest,
    platform: Platform,
    output_path: &Path,
) -> DownloadSpec {
    let output_template = output_path
        .with_extension(OUTPUT_EXT_PLACEHOLDER)
        .to_string_lossy()
        .into_owned();
    let headers = transport_headers(platform);

    let mut args = vec![
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
        "--newline".to_string(),
        "--print".to_string(),
        "after_move:filepath".to_string(),
        "-o".to_string(),
        output_template.clone(),
    ];

    match (request.media_kind, platform) {
        (MediaKind::Audio, _) => {
            args.extend([
                "-f".to_string(),
                "bestaudio/best".to_string(),
                "-x".to_string(),
                "--audio-format".to_string(),
                AUDIO_CONTAINER.to_string(),
                "--audio-quality".to_string(),
                request.quality.audio_quality().to_string(),
            ]);
        }
        (MediaKind::Video, Platform::Tiktok) => {
            args.extend([
                "-f".to_string(),
                "best".to_string(),
                "--remux-video".to_string(),
                VIDEO_CONTAINER.to_string(),
            ]);
        }
        (MediaKind::Video, Platform::Youtube | Platform::Other) => {
            args.extend([
                "-f".to_string(),
                video_format_selector(request.quality),
                "--merge-output-format".to_string(),
                VIDEO_CONTAINER.to_string(),
            ]);
        }
    }

    args.extend(header_args(&headers));
    args.push(request.url.clone());

    DownloadSpec {
        args,
        output_template,
        output_path: output_path.to_path_buf(),
        headers,
    }
}
