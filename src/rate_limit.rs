use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::State,
    http::{HeaderMap, HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use tokio::time;
use tracing::debug;

use crate::error::AppError;

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u64,
}

/// Result of counting one request against its window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Seconds until the window resets.
    pub reset_after: u64,
}

/// key: rate-limiter -> fixed window per client and scope
pub struct RateLimiter {
    windows: DashMap<String, Window>,
    window: Duration,
    max: u64,
}

impl RateLimiter {
    pub fn new(window: Duration, max: u64) -> Self {
        Self {
            windows: DashMap::new(),
            window,
            max,
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    pub(crate) fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });
        if now.duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        let elapsed = now.duration_since(entry.started);
        let reset_after = self.window.saturating_sub(elapsed).as_secs().max(1);
        if entry.count >= self.max {
            return RateDecision {
                allowed: false,
                limit: self.max,
                remaining: 0,
                reset_after,
            };
        }
        entry.count += 1;
        RateDecision {
            allowed: true,
            limit: self.max,
            remaining: self.max - entry.count,
            reset_after,
        }
    }

    /// Drops windows that have fully elapsed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    pub(crate) fn purge_expired_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, window| now.duration_since(window.started) < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked(&self) -> usize {
        self.windows.len()
    }
}

/// key: rate-limiter-janitor -> background purge
pub fn spawn_janitor(limiter: Arc<RateLimiter>) {
    let every = limiter.window.max(Duration::from_secs(1));
    tokio::spawn(async move {
        let mut ticker = time::interval(every);
        loop {
            ticker.tick().await;
            let purged = limiter.purge_expired();
            if purged > 0 {
                debug!(purged, tracked = limiter.tracked(), "purged expired rate limit windows");
            }
        }
    });
}

/// Bearer token digest, else the forwarded client address.
pub(crate) fn client_key(headers: &HeaderMap) -> String {
    if let Some(token) = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
    {
        let digest = Sha256::digest(token.as_bytes());
        return format!("token-{}", &hex::encode(digest)[..16]);
    }
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return forwarded.to_string();
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        return real_ip.to_string();
    }
    "anonymous".to_string()
}

fn apply_headers(headers: &mut HeaderMap, decision: &RateDecision) {
    for (name, value) in [
        ("x-ratelimit-limit", decision.limit),
        ("x-ratelimit-remaining", decision.remaining),
        ("x-ratelimit-reset", decision.reset_after),
    ] {
        headers.insert(name, HeaderValue::from(value));
    }
}

/// key: rate-limit-middleware -> counts, annotates, rejects
pub async fn rate_limit<B>(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request<B>,
    next: Next<B>,
) -> Response {
    let key = format!("{}:{}", client_key(request.headers()), request.uri().path());
    let decision = limiter.check(&key);

    let mut response = if decision.allowed {
        next.run(request).await
    } else {
        debug!(%key, retry_after = decision.reset_after, "rate limit exceeded");
        AppError::TooManyRequests {
            message: "too many requests, try again later".to_string(),
            retry_after: Some(decision.reset_after),
        }
        .into_response()
    };
    apply_headers(response.headers_mut(), &decision);
    response
}
