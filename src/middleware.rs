//! Middlewares for routes.

use std::fmt;

use axum::Json;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

use crate::ratelimiter::{Decision, RateLimitConfig, RateLimiter};

pub const UNKNOWN_CLIENT: &str = "unknown";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_REAL_IP: &str = "x-real-ip";
const CF_CONNECTING_IP: &str = "cf-connecting-ip";

const CONTENT_SECURITY_POLICY: &str = "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; style-src 'self' 'unsafe-inline'; img-src 'self' data: https:; font-src 'self' data:; connect-src 'self' https:; frame-ancestors 'none';";
const PERMISSIONS_POLICY: &str = "camera=(), microphone=(), geolocation=(), payment=(), usb=(), magnetometer=(), gyroscope=(), accelerometer=()";
const STRICT_TRANSPORT_SECURITY: &str = "max-age=31536000; includeSubDomains; preload";

/// Classes of endpoints sharing the same limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Waitlist,
    Confirm,
    Unsubscribe,
}

impl Endpoint {
    pub fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Waitlist => "waitlist",
            Endpoint::Confirm => "confirm",
            Endpoint::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Get the apparent client address from proxy headers.
///
/// Trusts, in order, the first `X-Forwarded-For` entry, `X-Real-IP` then
/// `CF-Connecting-IP`. Empty headers are skipped. Falls back to
/// [`UNKNOWN_CLIENT`].
pub fn client_identifier(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
    };

    if let Some(forwarded) = header(X_FORWARDED_FOR) {
        return forwarded.split(',').next().unwrap_or_default().trim().to_owned();
    }

    header(X_REAL_IP)
        .or_else(|| header(CF_CONNECTING_IP))
        .unwrap_or(UNKNOWN_CLIENT)
        .to_owned()
}

/// Headers set on every response.
///
/// `Strict-Transport-Security` is only sent in production.
pub fn security_headers(production: bool) -> Vec<(HeaderName, HeaderValue)> {
    let mut headers = vec![
        (header::CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY),
        (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
        (header::X_FRAME_OPTIONS, "DENY"),
        (header::X_XSS_PROTECTION, "1; mode=block"),
        (header::REFERRER_POLICY, "strict-origin-when-cross-origin"),
        (HeaderName::from_static("permissions-policy"), PERMISSIONS_POLICY),
        (header::CACHE_CONTROL, "no-store, no-cache, must-revalidate, proxy-revalidate"),
        (header::PRAGMA, "no-cache"),
        (header::EXPIRES, "0"),
    ];
    if production {
        headers.push((header::STRICT_TRANSPORT_SECURITY, STRICT_TRANSPORT_SECURITY));
    }

    headers
        .into_iter()
        .map(|(name, value)| (name, HeaderValue::from_static(value)))
        .collect()
}

/// State of the [`throttle`] middleware for one endpoint class.
#[derive(Debug, Clone)]
pub struct Throttle {
    limiter: RateLimiter,
    endpoint: Endpoint,
    config: RateLimitConfig,
}

impl Throttle {
    /// Create a new [`Throttle`].
    pub fn new(limiter: RateLimiter, endpoint: Endpoint, config: RateLimitConfig) -> Self {
        Self {
            limiter,
            endpoint,
            config,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TooManyRequests {
    success: bool,
    error: &'static str,
    reset_time: u64,
}

fn too_many_requests(decision: &Decision, now: u64) -> Response {
    let body = TooManyRequests {
        success: false,
        error: "Too many requests. Please try again later.",
        reset_time: decision.reset_time,
    };

    (
        StatusCode::TOO_MANY_REQUESTS,
        [(header::RETRY_AFTER, HeaderValue::from(decision.retry_after(now)))],
        Json(body),
    )
        .into_response()
}

/// Middleware to limit requests per client before any work is done.
pub async fn throttle(State(throttle): State<Throttle>, req: Request, next: Next) -> Response {
    let client = client_identifier(req.headers());
    // Endpoint classes never share counters.
    let key = format!("{}:{client}", throttle.endpoint);

    let decision = throttle.limiter.check(&key, &throttle.config);
    if decision.allowed {
        return next.run(req).await;
    }

    tracing::info!(
        %client,
        endpoint = %throttle.endpoint,
        reset_time = decision.reset_time,
        "rate limit exceeded"
    );
    metrics::counter!("rate_limit_rejections_total", "endpoint" => throttle.endpoint.as_str())
        .increment(1);

    too_many_requests(&decision, throttle.limiter.now())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&'static str, &'static str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(*name, HeaderValue::from_static(*value));
        }
        headers
    }

    #[test]
    fn test_forwarded_for_first_entry() {
        let headers = headers(&[
            ("x-forwarded-for", " 203.0.113.7 , 10.0.0.1"),
            ("x-real-ip", "10.0.0.2"),
            ("cf-connecting-ip", "10.0.0.3"),
        ]);
        assert_eq!(client_identifier(&headers), "203.0.113.7");
    }

    #[test]
    fn test_header_precedence() {
        let both = headers(&[("x-real-ip", "10.0.0.2"), ("cf-connecting-ip", "10.0.0.3")]);
        assert_eq!(client_identifier(&both), "10.0.0.2");

        let cloudflare = headers(&[("cf-connecting-ip", "10.0.0.3")]);
        assert_eq!(client_identifier(&cloudflare), "10.0.0.3");

        assert_eq!(client_identifier(&HeaderMap::new()), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_non_ascii_header_is_ignored() {
        let mut headers = headers(&[("x-real-ip", "10.0.0.2")]);
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_bytes("\u{e9}".as_bytes()).unwrap(),
        );
        assert_eq!(client_identifier(&headers), "10.0.0.2");
    }

    #[test]
    fn test_security_headers() {
        let development = security_headers(false);
        assert!(development.iter().all(|(name, _)| *name != header::STRICT_TRANSPORT_SECURITY));
        assert!(development.iter().any(|(name, value)| *name == "permissions-policy"
            && value.to_str().unwrap().contains("camera=()")));

        let production = security_headers(true);
        assert_eq!(production.len(), development.len() + 1);
    }

    #[test]
    fn test_empty_headers_fall_through() {
        let forwarded = headers(&[("x-forwarded-for", ""), ("x-real-ip", "10.0.0.2")]);
        assert_eq!(client_identifier(&forwarded), "10.0.0.2");

        let real_ip = headers(&[("x-real-ip", ""), ("cf-connecting-ip", "10.0.0.3")]);
        assert_eq!(client_identifier(&real_ip), "10.0.0.3");

        let all_empty = headers(&[
            ("x-forwarded-for", ""),
            ("x-real-ip", ""),
            ("cf-connecting-ip", ""),
        ]);
        assert_eq!(client_identifier(&all_empty), UNKNOWN_CLIENT);
    }

    #[test]
    fn test_empty_forwarded_entry_is_kept() {
        let headers = headers(&[("x-forwarded-for", " , 10.0.0.1"), ("x-real-ip", "10.0.0.2")]);
        assert_eq!(client_identifier(&headers), "");
    }
}
