//! Per-identity request quotas over fixed windows.
//!
//! Every limited endpoint is checked against the global daily and hourly
//! ceilings plus its own per-minute ceiling, if it has one. The check and the
//! increment of all applicable windows happen under one lock, so concurrent
//! requests can never both take the last unit of a window.

use std::{collections::HashMap, net::SocketAddr, sync::Arc};

use axum::http::HeaderMap;
use chrono::{DateTime, TimeDelta, Utc};
use parking_lot::Mutex;
use tracing::debug;

pub const AUTHENTICATED_USER_HEADER: &str = "x-authenticated-user";
const MAX_TRACKED_WINDOWS: usize = 50_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Info,
    Download,
    FileTransfer,
    Cleanup,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitRule {
    pub scope: &'static str,
    pub ceiling: u32,
    pub window: TimeDelta,
}

impl LimitRule {
    pub fn new(scope: &'static str, ceiling: u32, window: TimeDelta) -> Self {
        Self {
            scope,
            ceiling,
            window,
        }
    }

    fn window_label(&self) -> String {
        match self.window.num_seconds() {
            86_400 => "por dia".to_string(),
            3_600 => "por hora".to_string(),
            60 => "por minuto".to_string(),
            seconds => format!("cada {seconds} segundos"),
        }
    }
}

/// Counter for one (identity, scope) pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaWindow {
    pub identity: String,
    pub window_start: DateTime<Utc>,
    pub window: TimeDelta,
    pub count: u32,
}

impl QuotaWindow {
    fn open(identity: &str, now: DateTime<Utc>, window: TimeDelta) -> Self {
        Self {
            identity: identity.to_string(),
            window_start: now,
            window,
            count: 0,
        }
    }

    fn resets_at(&self) -> DateTime<Utc> {
        self.window_start + self.window
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.resets_at()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub rule: LimitRule,
    pub retry_after_seconds: u64,
}

impl Rejection {
    pub fn message(&self) -> String {
        format!(
            "Has superado el limite de {} solicitudes {}. Intenta de nuevo en {} segundos.",
            self.rule.ceiling,
            self.rule.window_label(),
            self.retry_after_seconds
        )
    }
}

/// Counter backend. `try_acquire` must check every rule and, only if all of
/// them have room, increment every one of them, as a single atomic step.
pub trait QuotaStore: Send + Sync {
    fn try_acquire(
        &self,
        identity: &str,
        rules: &[LimitRule],
        now: DateTime<Utc>,
    ) -> Result<(), Rejection>;
}

#[derive(Debug, Default)]
pub struct MemoryQuotaStore {
    windows: Mutex<HashMap<(String, &'static str), QuotaWindow>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn window(&self, identity: &str, scope: &'static str) -> Option<QuotaWindow> {
        self.windows
            .lock()
            .get(&(identity.to_string(), scope))
            .cloned()
    }
}

impl QuotaStore for MemoryQuotaStore {
    fn try_acquire(
        &self,
        identity: &str,
        rules: &[LimitRule],
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        let mut windows = self.windows.lock();

        if windows.len() > MAX_TRACKED_WINDOWS {
            windows.retain(|_, window| !window.is_expired(now));
            debug!("Ventanas de limite activas tras limpieza: {}", windows.len());
        }

        let mut rejection: Option<Rejection> = None;
        for rule in rules {
            let Some(window) = windows
                .get(&(identity.to_string(), rule.scope))
                .filter(|window| !window.is_expired(now))
            else {
                continue;
            };

            if window.count >= rule.ceiling {
                let retry_after_seconds = (window.resets_at() - now).num_seconds().max(1) as u64;
                let is_longer = rejection
                    .as_ref()
                    .is_none_or(|current| retry_after_seconds > current.retry_after_seconds);
                if is_longer {
                    rejection = Some(Rejection {
                        rule: rule.clone(),
                        retry_after_seconds,
                    });
                }
            }
        }

        if let Some(rejection) = rejection {
            return Err(rejection);
        }

        for rule in rules {
            let window = windows
                .entry((identity.to_string(), rule.scope))
                .or_insert_with(|| QuotaWindow::open(identity, now, rule.window));
            if window.is_expired(now) {
                *window = QuotaWindow::open(identity, now, rule.window);
            }
            window.count += 1;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitPolicy {
    pub per_day: u32,
    pub per_hour: u32,
    pub info_per_minute: u32,
    pub download_per_minute: u32,
}

impl Default for RateLimitPolicy {
    fn default() -> Self {
        Self {
            per_day: 200,
            per_hour: 50,
            info_per_minute: 10,
            download_per_minute: 5,
        }
    }
}

impl RateLimitPolicy {
    pub fn rules_for(&self, endpoint: Endpoint) -> Vec<LimitRule> {
        let mut rules = vec![
            LimitRule::new("day", self.per_day, TimeDelta::days(1)),
            LimitRule::new("hour", self.per_hour, TimeDelta::hours(1)),
        ];

        match endpoint {
            Endpoint::Info => rules.push(LimitRule::new(
                "info:minute",
                self.info_per_minute,
                TimeDelta::minutes(1),
            )),
            Endpoint::Download => rules.push(LimitRule::new(
                "download:minute",
                self.download_per_minute,
                TimeDelta::minutes(1),
            )),
            Endpoint::FileTransfer | Endpoint::Cleanup => {}
        }

        rules
    }
}

#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn QuotaStore>,
    policy: RateLimitPolicy,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn QuotaStore>, policy: RateLimitPolicy) -> Self {
        Self { store, policy }
    }

    pub fn in_memory(policy: RateLimitPolicy) -> Self {
        Self::new(Arc::new(MemoryQuotaStore::new()), policy)
    }

    pub fn check(&self, identity: &str, endpoint: Endpoint) -> Result<(), Rejection> {
        self.check_at(identity, endpoint, Utc::now())
    }

    pub fn check_at(
        &self,
        identity: &str,
        endpoint: Endpoint,
        now: DateTime<Utc>,
    ) -> Result<(), Rejection> {
        self.store
            .try_acquire(identity, &self.policy.rules_for(endpoint), now)
    }
}

type IdentityExtractor = fn(&HeaderMap) -> Option<String>;

/// Proxy-supplied identities, most specific first.
const PROXY_IDENTITY_CHAIN: [IdentityExtractor; 2] = [authenticated_user, forwarded_client_ip];

/// Picks the quota identity for a request. Proxy headers are only honored
/// when the deployment says its upstream proxy sets them; otherwise any
/// client could spoof them.
pub fn resolve_identity(headers: &HeaderMap, peer: SocketAddr, trust_proxy_headers: bool) -> String {
    if trust_proxy_headers
        && let Some(identity) = PROXY_IDENTITY_CHAIN
            .iter()
            .find_map(|extract| extract(headers))
    {
        return identity;
    }

    format!("ip:{}", peer.ip())
}

fn header_value(headers: &HeaderMap, key: &str) -> Option<String> {
    headers
        .get(key)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
}

fn authenticated_user(headers: &HeaderMap) -> Option<String> {
    header_value(headers, AUTHENTICATED_USER_HEADER).map(|user| format!("user:{user}"))
}

fn forwarded_client_ip(headers: &HeaderMap) -> Option<String> {
    let forwarded = header_value(headers, "x-forwarded-for").and_then(|value| {
        value
            .split(',')
            .next()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToString::to_string)
    });

    forwarded
        .or_else(|| header_value(headers, "cf-connecting-ip"))
        .or_else(|| header_value(headers, "x-real-ip"))
        .map(|ip| format!("ip:{ip}"))
}
