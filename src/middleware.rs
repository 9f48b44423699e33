//! Request-gating middleware, applied in order ahead of the proxy routes:
//! host/method guard, path guard, per-IP rate limiter, body-size guard,
//! probe filter, and security response headers. Each rejects early with
//! the status the policy calls for; probe rejections are silent.

use crate::server::AppState;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use regex::{Regex, RegexSet};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;

/// Buckets idle longer than this are swept.
const BUCKET_TTL_SECS: f64 = 300.0;
/// Sweep only once the map has grown past this.
const SWEEP_THRESHOLD: usize = 4096;

pub fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({"error": message.into()}))).into_response()
}

/// Best-effort client identity: forwarded headers first, then the socket
/// peer address.
pub fn client_ip(req: &Request) -> String {
    if let Some(forwarded) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }
    if let Some(real_ip) = req.headers().get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.trim().to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

// ---------------------------------------------------------------------------
// Rate limiting
// ---------------------------------------------------------------------------

struct Bucket {
    tokens: f64,
    ts: Instant,
}

/// Per-IP token buckets. Accessed only behind one async mutex; atomicity is
/// per await point, which is all the single-scheduler model needs.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, Bucket>>,
    rate: f64,
    burst: f64,
}

impl RateLimiter {
    pub fn new(rate: f64, burst: f64) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            rate,
            burst,
        }
    }

    /// Refill and take one token. Unknown IPs start at `burst - 1` (their
    /// first request is the one being taken).
    pub async fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().await;

        if buckets.len() >= SWEEP_THRESHOLD {
            buckets.retain(|_, b| now.duration_since(b.ts).as_secs_f64() < BUCKET_TTL_SECS);
        }

        match buckets.get_mut(key) {
            Some(bucket) => {
                let elapsed = now.duration_since(bucket.ts).as_secs_f64();
                bucket.tokens = (bucket.tokens + elapsed * self.rate).min(self.burst);
                bucket.ts = now;
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    true
                } else {
                    false
                }
            }
            None => {
                buckets.insert(
                    key.to_string(),
                    Bucket {
                        tokens: self.burst - 1.0,
                        ts: now,
                    },
                );
                true
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Path guard
// ---------------------------------------------------------------------------

pub enum PathVerdict {
    Ok,
    MultipleSlashes,
    Blocked,
}

/// Regex block-list for scanner paths plus structural checks, compiled once
/// at startup.
pub struct PathGuard {
    suspicious: RegexSet,
    port_tail: Regex,
}

impl PathGuard {
    pub fn new(patterns: &[String]) -> Self {
        let suspicious = RegexSet::new(
            patterns
                .iter()
                .filter(|p| Regex::new(p).is_ok())
                .map(String::as_str),
        )
        .unwrap_or_else(|_| RegexSet::empty());

        Self {
            suspicious,
            port_tail: Regex::new(r":\d{2,5}/?$").expect("valid regex"),
        }
    }

    pub fn check(&self, path: &str) -> PathVerdict {
        if path.contains("//") {
            return PathVerdict::MultipleSlashes;
        }
        if self.port_tail.is_match(path) {
            return PathVerdict::Blocked;
        }
        if self.suspicious.is_match(path) {
            return PathVerdict::Blocked;
        }
        PathVerdict::Ok
    }
}

// ---------------------------------------------------------------------------
// Middleware functions, in chain order
// ---------------------------------------------------------------------------

/// 1. Host allow-list (optional), method allow-list, JSON content type on
/// POST.
pub async fn host_method_guard(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let security = &state.config.security;

    if security.enforce_host && !security.allowed_hosts.is_empty() {
        let host = req
            .headers()
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        let bare_host = host.split(':').next().unwrap_or("");
        let allowed = security
            .allowed_hosts
            .iter()
            .any(|h| h == host || h == bare_host);
        if !allowed {
            return json_error(StatusCode::FORBIDDEN, "Host not allowed");
        }
    }

    if !security
        .allowed_methods
        .iter()
        .any(|m| m.eq_ignore_ascii_case(req.method().as_str()))
    {
        return json_error(StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
    }

    if security.enforce_json && req.method() == Method::POST {
        let content_type = req
            .headers()
            .get(axum::http::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if !content_type.contains("application/json") {
            return json_error(
                StatusCode::UNSUPPORTED_MEDIA_TYPE,
                "Content-Type must be application/json",
            );
        }
    }

    next.run(req).await
}

/// 2. Scanner-path rejection.
pub async fn path_guard(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    match state.path_guard.check(req.uri().path()) {
        PathVerdict::Ok => next.run(req).await,
        PathVerdict::MultipleSlashes => json_error(
            StatusCode::BAD_REQUEST,
            "Invalid path: repeated slashes (check the proxied URL for a doubled '/')",
        ),
        PathVerdict::Blocked => json_error(StatusCode::NOT_FOUND, "Not Found"),
    }
}

/// 3. Per-IP token bucket.
pub async fn rate_limit(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let ip = client_ip(&req);
    if !state.rate_limiter.allow(&ip).await {
        state
            .logger
            .warn("ratelimit", format!("Rate limit exceeded for {ip}"));
        return json_error(StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded");
    }
    next.run(req).await
}

/// 4. Declared body size.
pub async fn body_size_guard(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let declared = req
        .headers()
        .get(axum::http::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    if let Some(length) = declared {
        if length > state.config.security.max_body_size {
            return json_error(StatusCode::PAYLOAD_TOO_LARGE, "Request body too large");
        }
    }

    next.run(req).await
}

/// 5. Probe rejection: known scanner paths, user agents, methods, and IPs
/// get a silent 404 (no log line).
pub async fn probe_filter(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Response {
    let probe = &state.config.probe_request;
    let path = req.uri().path();
    let user_agent = req
        .headers()
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let is_probe = probe.path_blocklist.iter().any(|p| p == path)
        || probe
            .path_prefix_blocklist
            .iter()
            .any(|p| path.starts_with(p.as_str()))
        || probe
            .user_agent_substrings
            .iter()
            .any(|ua| user_agent.contains(ua.as_str()))
        || !probe
            .allowed_methods
            .iter()
            .any(|m| m.eq_ignore_ascii_case(req.method().as_str()))
        || probe.ip_blocklist.contains(&client_ip(&req));

    if is_probe {
        return json_error(StatusCode::NOT_FOUND, "Not Found");
    }

    next.run(req).await
}

/// 6. Hardening headers on every outbound response; the `Server` header is
/// blanked.
pub async fn security_headers(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;

    let headers = response.headers_mut();
    headers.insert(
        "X-Content-Type-Options",
        HeaderValue::from_static("nosniff"),
    );
    headers.insert("X-Frame-Options", HeaderValue::from_static("DENY"));
    headers.insert("Referrer-Policy", HeaderValue::from_static("no-referrer"));
    headers.insert(
        "Content-Security-Policy",
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert("Server", HeaderValue::from_static(""));

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProxyConfig;

    #[tokio::test]
    async fn test_unknown_ip_starts_with_burst_minus_one() {
        let limiter = RateLimiter::new(1.0, 2.0);

        // burst=2: two immediate requests pass, the third is denied
        assert!(limiter.allow("1.2.3.4").await);
        assert!(limiter.allow("1.2.3.4").await);
        assert!(!limiter.allow("1.2.3.4").await);
    }

    #[tokio::test]
    async fn test_buckets_are_per_ip() {
        let limiter = RateLimiter::new(1.0, 1.0);
        assert!(limiter.allow("1.1.1.1").await);
        assert!(!limiter.allow("1.1.1.1").await);
        assert!(limiter.allow("2.2.2.2").await);
    }

    #[tokio::test]
    async fn test_tokens_refill_over_time() {
        let limiter = RateLimiter::new(50.0, 1.0);
        assert!(limiter.allow("ip").await);
        assert!(!limiter.allow("ip").await);

        tokio::time::sleep(std::time::Duration::from_millis(40)).await;
        assert!(limiter.allow("ip").await);
    }

    #[test]
    fn test_path_guard_verdicts() {
        let config = ProxyConfig::default();
        let guard = PathGuard::new(&config.security.suspicious_patterns);

        assert!(matches!(
            guard.check("/api.openai.com/v1/chat/completions"),
            PathVerdict::Ok
        ));
        assert!(matches!(
            guard.check("/api.openai.com//v1/chat/completions"),
            PathVerdict::MultipleSlashes
        ));
        assert!(matches!(guard.check("/.env"), PathVerdict::Blocked));
        assert!(matches!(guard.check("/wp-admin/setup.php"), PathVerdict::Blocked));
        assert!(matches!(guard.check("/example.com:443"), PathVerdict::Blocked));
        // host:port in the middle of a proxied path is a legitimate
        // allow-listed internal upstream
        assert!(matches!(
            guard.check("/10.0.0.7:9081/v1/chat/completions"),
            PathVerdict::Ok
        ));
    }
}
