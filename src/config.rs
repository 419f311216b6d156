use std::{path::PathBuf, time::Duration};

use url::Url;

use crate::rate_limit::RateLimitPolicy;

pub const DEFAULT_BIND_ADDR: &str = "127.0.0.1:5000";
pub const DEFAULT_DOWNLOAD_DIR: &str = "descargas";
pub const DEFAULT_YT_DLP_BIN: &str = "yt-dlp";
pub const DEFAULT_INFO_TIMEOUT_SECONDS: u64 = 30;
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 300;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Origen invalido en ALLOWED_ORIGINS: {0}. Usa valores tipo https://dominio.com")]
    InvalidOrigin(String),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub download_dir: PathBuf,
    pub yt_dlp_bin: PathBuf,
    pub info_timeout: Duration,
    pub download_timeout: Duration,
    pub trust_proxy_headers: bool,
    pub rate_limits: RateLimitPolicy,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let text = |name: &str| lookup(name).and_then(|value| non_empty(&value).map(ToString::to_string));
        let number = |name: &str| {
            text(name)
                .and_then(|value| value.parse::<u64>().ok())
                .filter(|value| *value > 0)
        };
        let ceiling = |name: &str, default: u32| {
            number(name)
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(default)
        };

        let defaults = RateLimitPolicy::default();
        let rate_limits = RateLimitPolicy {
            per_day: ceiling("RATE_LIMIT_PER_DAY", defaults.per_day),
            per_hour: ceiling("RATE_LIMIT_PER_HOUR", defaults.per_hour),
            info_per_minute: ceiling("INFO_LIMIT_PER_MINUTE", defaults.info_per_minute),
            download_per_minute: ceiling("DOWNLOAD_LIMIT_PER_MINUTE", defaults.download_per_minute),
        };

        let allowed_origins = text("ALLOWED_ORIGINS")
            .map(|value| {
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|origin| !origin.is_empty())
                    .map(|origin| {
                        normalize_origin(origin)
                            .ok_or_else(|| ConfigError::InvalidOrigin(origin.to_string()))
                    })
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?
            .unwrap_or_default();

        Ok(Self {
            bind_addr: resolve_bind_addr(text("APP_ADDR"), text("PORT")),
            download_dir: text("DOWNLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DOWNLOAD_DIR)),
            yt_dlp_bin: text("YT_DLP_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_YT_DLP_BIN)),
            info_timeout: Duration::from_secs(
                number("INFO_TIMEOUT_SECONDS").unwrap_or(DEFAULT_INFO_TIMEOUT_SECONDS),
            ),
            download_timeout: Duration::from_secs(
                number("DOWNLOAD_TIMEOUT_SECONDS").unwrap_or(DEFAULT_DOWNLOAD_TIMEOUT_SECONDS),
            ),
            trust_proxy_headers: text("TRUST_PROXY_HEADERS")
                .and_then(|value| parse_bool(&value))
                .unwrap_or(false),
            rate_limits,
            allowed_origins,
        })
    }
}

fn resolve_bind_addr(app_addr: Option<String>, port: Option<String>) -> String {
    if let Some(configured) = app_addr {
        return configured;
    }

    if let Some(port) = port.and_then(|value| value.parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// `scheme://host[:port]`, dropping default ports. Anything with a path,
/// query or fragment is not an origin.
pub fn normalize_origin(value: &str) -> Option<String> {
    let parsed = Url::parse(value).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    let scheme = parsed.scheme();
    let default_port = match scheme {
        "http" => 80,
        "https" => 443,
        _ => return None,
    };

    if parsed.path() != "/" || parsed.query().is_some() || parsed.fragment().is_some() {
        return None;
    }

    match parsed.port().filter(|port| *port != default_port) {
        Some(port) => Some(format!("{scheme}://{host}:{port}")),
        None => Some(format!("{scheme}://{host}")),
    }
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
