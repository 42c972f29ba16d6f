use crate::{config::RateLimit, error::AppError};
use axum::{
    body::{Body, to_bytes},
    extract::{ConnectInfo, Request, State},
    http::{
        self, HeaderName, Method,
        header::{self, HeaderValue},
        request::Parts,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::{collections::HashMap, net::SocketAddr, sync::Arc, time::Instant};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing::{debug, warn};

const CHROME_EXTENSION_SCHEME: &str = "chrome-extension://";

/// Token-bucket limiter for one policy, keyed by client address.
pub struct RateLimiter {
    name: &'static str,
    message: &'static str,
    rate_per_sec: f64,
    capacity: f64,
    buckets: Mutex<HashMap<String, BucketState>>,
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(name: &'static str, limit: RateLimit, message: &'static str) -> Self {
        let capacity = f64::from(limit.max_requests.max(1));
        let window = limit.window.as_secs_f64().max(1.0);
        Self {
            name,
            message,
            rate_per_sec: capacity / window,
            capacity,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub fn auth(limit: RateLimit) -> Self {
        Self::new(
            "auth",
            limit,
            "Too many authentication attempts, please try again later",
        )
    }

    pub fn api(limit: RateLimit) -> Self {
        Self::new("api", limit, "Too many requests, please try again later")
    }

    pub fn password(limit: RateLimit) -> Self {
        Self::new(
            "password",
            limit,
            "Too many attempts. Please try again in 15 minutes.",
        )
    }

    pub async fn consume(&self, key: &str) -> Result<RatePermit, RateExceeded> {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let state = guard.entry(key.to_string()).or_insert_with(|| BucketState {
            tokens: self.capacity,
            last_refill: now,
        });

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.rate_per_sec).min(self.capacity);
            state.last_refill = now;
        }

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            Ok(RatePermit {
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        } else {
            let deficit = 1.0 - state.tokens;
            Err(RateExceeded {
                retry_after: (deficit / self.rate_per_sec).max(0.0),
                capacity: self.capacity,
                tokens: state.tokens,
                rate: self.rate_per_sec,
            })
        }
    }

    /// Drops buckets that have refilled completely.
    pub async fn prune(&self) -> usize {
        let mut guard = self.buckets.lock().await;
        let now = Instant::now();
        let before = guard.len();
        guard.retain(|_, state| {
            let elapsed = now.duration_since(state.last_refill).as_secs_f64();
            state.tokens + elapsed * self.rate_per_sec < self.capacity
        });
        before - guard.len()
    }
}

#[derive(Debug, Clone)]
pub struct RatePermit {
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RatePermit {
    pub fn remaining(&self) -> u64 {
        self.tokens.max(0.0).floor() as u64
    }

    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        insert_number(headers, "x-ratelimit-limit", self.capacity as u64);
        insert_number(headers, "x-ratelimit-remaining", self.remaining());
        insert_number(headers, "x-ratelimit-reset", reset);
    }
}

#[derive(Debug, Clone)]
pub struct RateExceeded {
    retry_after: f64,
    capacity: f64,
    tokens: f64,
    rate: f64,
}

impl RateExceeded {
    pub fn retry_after_secs(&self) -> u64 {
        self.retry_after.ceil().max(1.0) as u64
    }

    fn apply_headers(&self, headers: &mut http::HeaderMap) {
        let reset = ((self.capacity - self.tokens) / self.rate).ceil().max(0.0) as u64;
        headers.insert(
            header::RETRY_AFTER,
            HeaderValue::from(self.retry_after_secs()),
        );
        insert_number(headers, "x-ratelimit-limit", self.capacity as u64);
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        insert_number(headers, "x-ratelimit-reset", reset);
    }
}

fn insert_number(headers: &mut http::HeaderMap, name: &'static str, value: u64) {
    headers.insert(HeaderName::from_static(name), HeaderValue::from(value));
}

/// Client address: first `X-Forwarded-For` hop, then the peer socket.
pub fn client_key(request: &Request) -> String {
    if let Some(forwarded) = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty())
    {
        return forwarded.to_string();
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub async fn rate_limit(
    State(limiter): State<Arc<RateLimiter>>,
    request: Request,
    next: Next,
) -> Response {
    let key = client_key(&request);
    match limiter.consume(&key).await {
        Ok(permit) => {
            let mut response = next.run(request).await;
            permit.apply_headers(response.headers_mut());
            response
        }
        Err(exceeded) => {
            warn!(
                target = "syncsellr.api",
                policy = limiter.name,
                client = %key,
                retry_after = exceeded.retry_after_secs(),
                "rate limit exceeded"
            );
            let mut response = AppError::TooManyRequests(limiter.message.to_string()).into_response();
            exceeded.apply_headers(response.headers_mut());
            response
        }
    }
}

/// Origins allowed to make cookie-less state-changing calls and CORS requests.
#[derive(Debug, Clone)]
pub struct AllowedOrigins(Arc<Vec<String>>);

impl AllowedOrigins {
    pub fn new(origins: &[String]) -> Self {
        Self(Arc::new(origins.to_vec()))
    }

    pub fn allows(&self, origin: &str) -> bool {
        origin.starts_with(CHROME_EXTENSION_SCHEME) || self.0.iter().any(|o| o == origin)
    }

    fn allows_configured(&self, origin: &str) -> bool {
        self.0.iter().any(|o| o == origin)
    }
}

/// Bearer-authenticated requests are exempt; browsers cannot forge that header cross-site.
pub async fn csrf_guard(
    State(origins): State<AllowedOrigins>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if matches!(*request.method(), Method::GET | Method::HEAD | Method::OPTIONS) {
        return Ok(next.run(request).await);
    }
    let headers = request.headers();
    let has_bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("Bearer "));
    let origin = headers
        .get(header::ORIGIN)
        .map(|v| v.to_str().unwrap_or_default().to_string());
    let referer = headers
        .get(header::REFERER)
        .map(|v| v.to_str().unwrap_or_default().to_string());

    if has_bearer {
        return Ok(next.run(request).await);
    }

    if let Some(origin) = origin {
        if origins.allows(&origin) {
            return Ok(next.run(request).await);
        }
        debug!(target = "syncsellr.api", origin = %origin, "rejected origin");
        return Err(AppError::forbidden("Forbidden: Invalid origin"));
    }

    if let Some(referer) = referer {
        let allowed = url::Url::parse(&referer)
            .map(|parsed| parsed.origin().ascii_serialization())
            .is_ok_and(|origin| origins.allows_configured(&origin));
        if allowed {
            return Ok(next.run(request).await);
        }
        return Err(AppError::forbidden("Forbidden: Invalid referer"));
    }

    Err(AppError::forbidden("Forbidden: Missing origin header"))
}

static EVENT_HANDLER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)on\w+\s*=").unwrap_or_else(|err| panic!("event handler pattern: {err}"))
});
static JAVASCRIPT_SCHEME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)javascript:").unwrap_or_else(|err| panic!("javascript pattern: {err}"))
});
static HTML_DATA_URI: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)data:\s*text/html").unwrap_or_else(|err| panic!("data uri pattern: {err}"))
});

/// Encodes angle brackets and strips script-bearing patterns.
pub fn sanitize_text(raw: &str) -> String {
    let encoded = raw.replace('<', "&lt;").replace('>', "&gt;");
    let stripped = JAVASCRIPT_SCHEME.replace_all(&encoded, "");
    let stripped = EVENT_HANDLER.replace_all(&stripped, "");
    HTML_DATA_URI.replace_all(&stripped, "").into_owned()
}

/// Page snapshots sent for selector checks are parsed, never rendered, and must
/// keep their markup.
const RAW_HTML_KEY: &str = "html";

pub fn sanitize_value(value: Value) -> Value {
    match value {
        Value::String(text) => Value::String(sanitize_text(&text)),
        Value::Array(items) => Value::Array(items.into_iter().map(sanitize_value).collect()),
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| {
                    if key == RAW_HTML_KEY {
                        (key, value)
                    } else {
                        (key, sanitize_value(value))
                    }
                })
                .collect(),
        ),
        other => other,
    }
}

/// Paths whose JSON bodies carry a page snapshot and may be larger.
const SNAPSHOT_PATH_SUFFIXES: [&str; 2] = ["/fill-plan", "/selectors/health"];

/// Buffering caps for [`sanitize_json_body`].
#[derive(Debug, Clone, Copy)]
pub struct BodyLimits {
    pub json: usize,
    pub snapshot: usize,
}

impl BodyLimits {
    fn for_path(&self, path: &str) -> usize {
        if SNAPSHOT_PATH_SUFFIXES.iter().any(|suffix| path.ends_with(suffix)) {
            self.snapshot.max(self.json)
        } else {
            self.json
        }
    }
}

/// Rewrites JSON request bodies through [`sanitize_value`]. Other bodies pass untouched.
pub async fn sanitize_json_body(
    State(limits): State<BodyLimits>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return Ok(next.run(request).await);
    }

    let limit = limits.for_path(request.uri().path());
    let (mut parts, body) = request.into_parts();
    let bytes = to_bytes(body, limit)
        .await
        .map_err(|_| AppError::PayloadTooLarge)?;
    let rewritten = match serde_json::from_slice::<Value>(&bytes) {
        Ok(value) => {
            let cleaned = serde_json::to_vec(&sanitize_value(value))
                .map_err(|err| AppError::internal(format!("re-encode body: {err}")))?;
            parts.headers.remove(header::CONTENT_LENGTH);
            Body::from(cleaned)
        }
        // Left for the extractor to reject with a proper message.
        Err(_) => Body::from(bytes),
    };
    Ok(next.run(Request::from_parts(parts, rewritten)).await)
}

pub async fn security_headers(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("camera=(), microphone=(), geolocation=(), interest-cohort=()"),
    );
    response
}

pub fn cors_layer(origins: AllowedOrigins) -> CorsLayer {
    CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(
            move |origin: &HeaderValue, _parts: &Parts| {
                origin.to_str().is_ok_and(|o| origins.allows(o))
            },
        ))
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::AUTHORIZATION,
            header::CONTENT_TYPE,
            HeaderName::from_static("idempotency-key"),
        ])
}

/// Constant-time comparison for operator keys presented in headers.
pub fn keys_match(presented: &str, expected: &str) -> bool {
    presented.len() == expected.len() && bool::from(presented.as_bytes().ct_eq(expected.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{Router, body::to_bytes, http::StatusCode, middleware, routing::post};
    use std::time::Duration;
    use tower::ServiceExt;

    fn limit(max: u32, secs: u64) -> RateLimit {
        RateLimit {
            max_requests: max,
            window: Duration::from_secs(secs),
        }
    }

    #[tokio::test]
    async fn bucket_exhausts_then_reports_retry() {
        let limiter = RateLimiter::api(limit(2, 60));
        assert!(limiter.consume("1.2.3.4").await.is_ok());
        let permit = limiter.consume("1.2.3.4").await.expect("second");
        assert_eq!(permit.remaining(), 0);
        let exceeded = limiter.consume("1.2.3.4").await.expect_err("third");
        assert!(exceeded.retry_after_secs() >= 1);
        assert!(limiter.consume("5.6.7.8").await.is_ok());
    }

    #[tokio::test]
    async fn limited_route_returns_429_with_headers() {
        let limiter = Arc::new(RateLimiter::password(limit(1, 900)));
        let app = Router::new()
            .route("/login", post(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(limiter, rate_limit));

        let request = || {
            http::Request::builder()
                .method("POST")
                .uri("/login")
                .header("x-forwarded-for", "9.9.9.9, 10.0.0.1")
                .body(Body::empty())
                .expect("request")
        };
        let first = app.clone().oneshot(request()).await.expect("first");
        assert_eq!(first.status(), StatusCode::OK);
        assert_eq!(first.headers()["x-ratelimit-limit"], "1");

        let second = app.oneshot(request()).await.expect("second");
        assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(second.headers().contains_key(header::RETRY_AFTER));
        let body = to_bytes(second.into_body(), usize::MAX).await.expect("body");
        let json: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["error"], "Too many attempts. Please try again in 15 minutes.");
    }

    fn csrf_app() -> Router {
        let origins = AllowedOrigins::new(&["https://app.syncsellr.com".to_string()]);
        Router::new()
            .route("/x", post(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(origins, csrf_guard))
    }

    async fn csrf_status(builder: http::request::Builder) -> (StatusCode, Value) {
        let request = builder
            .method("POST")
            .uri("/x")
            .body(Body::empty())
            .expect("request");
        let response = csrf_app().oneshot(request).await.expect("response");
        let status = response.status();
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    #[tokio::test]
    async fn csrf_accepts_bearer_and_known_origins() {
        let (status, _) =
            csrf_status(http::Request::builder().header("authorization", "Bearer abc")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) =
            csrf_status(http::Request::builder().header("origin", "https://app.syncsellr.com")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) =
            csrf_status(http::Request::builder().header("origin", "chrome-extension://abcdef")).await;
        assert_eq!(status, StatusCode::OK);
        let (status, _) = csrf_status(
            http::Request::builder().header("referer", "https://app.syncsellr.com/listings/new"),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn csrf_rejects_foreign_or_missing_origin() {
        let (status, body) =
            csrf_status(http::Request::builder().header("origin", "https://evil.example")).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Forbidden: Invalid origin");

        let (_, body) =
            csrf_status(http::Request::builder().header("referer", "https://evil.example/x")).await;
        assert_eq!(body["error"], "Forbidden: Invalid referer");

        let (status, body) = csrf_status(http::Request::builder()).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert_eq!(body["error"], "Forbidden: Missing origin header");
    }

    #[test]
    fn sanitizer_neutralizes_markup() {
        assert_eq!(sanitize_text("<b>Oak</b>"), "&lt;b&gt;Oak&lt;/b&gt;");
        assert_eq!(sanitize_text("JavaScript:alert(1)"), "alert(1)");
        assert_eq!(sanitize_text("img onerror = x"), "img  x");
        assert_eq!(sanitize_text("data: text/html,hi"), ",hi");
        let nested = sanitize_value(serde_json::json!({"a": ["<x>", 3], "b": {"c": "ok"}}));
        assert_eq!(nested["a"][0], "&lt;x&gt;");
        assert_eq!(nested["a"][1], 3);
        assert_eq!(nested["b"]["c"], "ok");

        let snapshot = sanitize_value(serde_json::json!({"platform": "<v>", "html": "<input name=\"title\">"}));
        assert_eq!(snapshot["platform"], "&lt;v&gt;");
        assert_eq!(snapshot["html"], "<input name=\"title\">");
    }

    #[tokio::test]
    async fn json_bodies_are_sanitized_in_flight() {
        let app = Router::new()
            .route(
                "/echo",
                post(|axum::Json(v): axum::Json<Value>| async move { axum::Json(v) }),
            )
            .layer(middleware::from_fn_with_state(
                BodyLimits { json: 1024, snapshot: 4096 },
                sanitize_json_body,
            ));
        let request = http::Request::builder()
            .method("POST")
            .uri("/echo")
            .header("content-type", "application/json")
            .body(Body::from(r#"{"title":"<script>x</script>"}"#))
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        let body = to_bytes(response.into_body(), usize::MAX).await.expect("body");
        let json: Value = serde_json::from_slice(&body).expect("json");
        assert_eq!(json["title"], "&lt;script&gt;x&lt;/script&gt;");
    }

    #[test]
    fn snapshot_routes_get_the_larger_body_cap() {
        let limits = BodyLimits { json: 1024, snapshot: 4096 };
        assert_eq!(limits.for_path("/listings/abc/fill-plan"), 4096);
        assert_eq!(limits.for_path("/config/selectors/health"), 4096);
        assert_eq!(limits.for_path("/listings"), 1024);
        assert_eq!(BodyLimits { json: 8192, snapshot: 4096 }.for_path("/listings/a/fill-plan"), 8192);
    }

    #[tokio::test]
    async fn security_headers_are_attached() {
        let app = Router::new()
            .route("/x", post(|| async { "ok" }))
            .layer(middleware::from_fn(security_headers));
        let request = http::Request::builder()
            .method("POST")
            .uri("/x")
            .body(Body::empty())
            .expect("request");
        let response = app.oneshot(request).await.expect("response");
        assert_eq!(response.headers()["x-frame-options"], "DENY");
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert!(response.headers().contains_key("permissions-policy"));
    }

    #[test]
    fn key_comparison() {
        assert!(keys_match("abc123", "abc123"));
        assert!(!keys_match("abc124", "abc123"));
        assert!(!keys_match("abc", "abc123"));
    }

    #[tokio::test]
    async fn prune_drops_full_buckets() {
        let limiter = RateLimiter::api(limit(100, 1));
        limiter.consume("a").await.ok();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.prune().await, 1);
    }
}
