use std::{sync::Arc, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    download_spec::{header_args, transport_headers},
    platform::Platform,
    runner::{CommandRunner, JobOutcome, RunnerError},
};

// Checked in this order; a height may light up more than one tier.
const BEST_TIER_HEIGHTS: [u32; 3] = [2160, 1440, 1080];
const HIGH_TIER_HEIGHT: u32 = 1080;
const MEDIUM_TIER_HEIGHT: u32 = 720;
const LOW_TIER_HEIGHTS: [u32; 2] = [480, 360];

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AvailableQualities {
    pub best: bool,
    pub high: bool,
    pub medium: bool,
    pub low: bool,
}

impl AvailableQualities {
    pub const ALL: AvailableQualities = AvailableQualities {
        best: true,
        high: true,
        medium: true,
        low: true,
    };
}

/// Normalized metadata returned by `/get_info`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoInfo {
    pub title: String,
    pub duration: f64,
    pub thumbnail: String,
    pub uploader: String,
    pub platform: Platform,
    pub available_qualities: AvailableQualities,
    pub max_resolution: Option<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("metadata probe exited with {exit_code:?}: {stderr_excerpt}")]
    Failed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },
    #[error("metadata probe exceeded {0:?}")]
    TimedOut(Duration),
    #[error("could not parse probe output: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Runner(#[from] RunnerError),
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    uploader: Option<String>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    height: Option<f64>,
    resolution: Option<String>,
}

impl YtDlpFormat {
    /// Largest vertical resolution the descriptor declares, from either its
    /// `height` or a `WIDTHxHEIGHT` resolution string.
    fn declared_height(&self) -> Option<u32> {
        let from_height = self
            .height
            .filter(|height| height.is_finite() && *height > 0.0)
            .map(|height| height.round() as u32);
        let from_resolution = self
            .resolution
            .as_deref()
            .and_then(|value| value.split_once('x'))
            .and_then(|(_, height)| height.trim().parse::<u32>().ok());

        from_height.max(from_resolution)
    }
}

/// Buckets descriptor heights into the four quality tiers. When no
/// descriptor carries a height every tier is reported available.
pub fn bucket_quality_tiers(heights: &[u32]) -> AvailableQualities {
    if heights.is_empty() {
        return AvailableQualities::ALL;
    }

    let mut tiers = AvailableQualities::default();
    for &height in heights {
        if BEST_TIER_HEIGHTS.iter().any(|threshold| height >= *threshold) {
            tiers.best = true;
        }

        if height >= HIGH_TIER_HEIGHT {
            tiers.high = true;
        } else if height >= MEDIUM_TIER_HEIGHT {
            tiers.medium = true;
        } else if LOW_TIER_HEIGHTS.iter().any(|threshold| height >= *threshold) {
            tiers.low = true;
        }
    }

    tiers
}

/// Parses the first JSON document the tool printed.
pub fn parse_video_info(stdout: &[u8], platform: Platform) -> Result<VideoInfo, serde_json::Error> {
    let mut documents = serde_json::Deserializer::from_slice(stdout).into_iter::<YtDlpVideoInfo>();
    let info = match documents.next() {
        Some(document) => document?,
        None => serde_json::from_slice::<YtDlpVideoInfo>(stdout)?,
    };

    let heights: Vec<u32> = info
        .formats
        .iter()
        .filter_map(YtDlpFormat::declared_height)
        .collect();

    Ok(VideoInfo {
        title: info
            .title
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Sin titulo".to_string()),
        duration: info.duration.unwrap_or_default(),
        thumbnail: info.thumbnail.unwrap_or_default(),
        uploader: info
            .uploader
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| "Desconocido".to_string()),
        platform,
        available_qualities: bucket_quality_tiers(&heights),
        max_resolution: heights.iter().copied().max(),
    })
}

pub fn probe_args(url: &str, platform: Platform) -> Vec<String> {
    let mut args = vec![
        "--dump-json".to_string(),
        "--no-playlist".to_string(),
        "--no-warnings".to_string(),
    ];
    args.extend(header_args(&transport_headers(platform)));
    args.push(url.to_string());
    args
}

/// Runs the tool in metadata-only mode. Never produces an artifact.
#[derive(Clone)]
pub struct InfoProbe {
    runner: Arc<dyn CommandRunner>,
    budget: Duration,
}

impl InfoProbe {
    pub fn new(runner: Arc<dyn CommandRunner>, budget: Duration) -> Self {
        Self { runner, budget }
    }

    pub async fn probe(&self, url: &str, platform: Platform) -> Result<VideoInfo, ProbeError> {
        let outcome = self
            .runner
            .run(&probe_args(url, platform), self.budget)
            .await?;

        match outcome {
            JobOutcome::Succeeded { stdout } => {
                let info = parse_video_info(&stdout, platform).inspect_err(|error| {
                    warn!("Salida JSON de yt-dlp invalida para {url:?}: {error}");
                })?;
                debug!(
                    "Metadatos obtenidos para {url:?}: max_resolution={:?}",
                    info.max_resolution
                );
                Ok(info)
            }
            JobOutcome::Failed {
                exit_code,
                stderr_excerpt,
            } => Err(ProbeError::Failed {
                exit_code,
                stderr_excerpt,
            }),
            JobOutcome::TimedOut { budget } => Err(ProbeError::TimedOut(budget)),
        }
    }
}
