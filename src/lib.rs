//! Waitlist backend with per-client fixed-window rate limiting.
#![forbid(unsafe_code)]
#![deny(unused_mut)]

pub mod config;
pub mod database;
pub mod entry;
pub mod error;
pub mod mail;
pub mod middleware;
pub mod ratelimiter;
pub mod router;
pub mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode, header};
use axum::routing::{MethodRouter, get, post};
use axum::{Router, middleware as AxumMiddleware};
use tower::ServiceBuilder;
use tower_http::LatencyUnit;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::sensitive_headers::SetSensitiveHeadersLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{
    DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer,
};

use entry::{PostgresRepository, WaitlistRepository};
use middleware::{Endpoint, Throttle};
use ratelimiter::{RateLimitConfig, RateLimiter, SystemClock};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CORS_MAX_AGE: Duration = Duration::from_secs(86400);

/// MUST NEVER be used in production.
#[cfg(test)]
pub async fn make_request(
    app: Router,
    method: Method,
    path: &str,
    client: &str,
    body: &str,
) -> axum::http::Response<axum::body::Body> {
    use axum::extract::Request;
    use tower::util::ServiceExt;

    let mut request = Request::builder()
        .method(method)
        .uri(path)
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded");
    if !client.is_empty() {
        request = request.header("x-forwarded-for", client);
    }

    app.oneshot(request.body(axum::body::Body::from(body.to_owned())).unwrap())
        .await
        .unwrap()
}

/// State sharing between routes.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<config::Configuration>,
    pub store: Arc<dyn WaitlistRepository>,
    pub mail: mail::MailManager,
    pub limiter: RateLimiter,
}

fn throttled<S>(
    route: MethodRouter<S>,
    limiter: &RateLimiter,
    endpoint: Endpoint,
    config: RateLimitConfig,
) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    route.route_layer(AxumMiddleware::from_fn_with_state(
        Throttle::new(limiter.clone(), endpoint, config),
        middleware::throttle,
    ))
}

fn cors(origins: &[String]) -> CorsLayer {
    let origins = origins
        .iter()
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect::<Vec<_>>();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            HeaderName::from_static("x-requested-with"),
        ])
        .max_age(CORS_MAX_AGE)
}

/// Create router.
pub fn app(state: AppState) -> Router {
    let middleware = ServiceBuilder::new()
        // Add high level tracing/logging to all requests.
        .layer(
            TraceLayer::new_for_http()
                .on_body_chunk(|chunk: &Bytes, latency: Duration, _span: &tracing::Span| {
                    tracing::trace!(size_bytes = chunk.len(), latency = ?latency, "sending body chunk")
                })
                .make_span_with(DefaultMakeSpan::new().include_headers(true).level(tracing::Level::INFO))
                .on_request(DefaultOnRequest::new())
                .on_response(DefaultOnResponse::new().include_headers(true).latency_unit(LatencyUnit::Micros)),
        )
        .layer(TimeoutLayer::with_status_code(StatusCode::REQUEST_TIMEOUT, REQUEST_TIMEOUT))
        // Remove sensitive headers from trace.
        .layer(SetSensitiveHeadersLayer::new([header::AUTHORIZATION, header::COOKIE]))
        .layer(cors(&state.config.allowed_origins));

    let limits = &state.config.rate_limits;
    let api = Router::new()
        // `POST /api/waitlist` goes to `waitlist`.
        .route(
            "/waitlist",
            throttled(
                post(router::waitlist::handler),
                &state.limiter,
                Endpoint::Waitlist,
                limits.waitlist,
            ),
        )
        // `GET /api/confirm` goes to `confirm`.
        .route(
            "/confirm",
            throttled(
                get(router::confirm::handler),
                &state.limiter,
                Endpoint::Confirm,
                limits.confirm,
            ),
        )
        .route(
            "/unsubscribe",
            throttled(
                get(router::unsubscribe::query).post(router::unsubscribe::form),
                &state.limiter,
                Endpoint::Unsubscribe,
                limits.unsubscribe,
            ),
        );

    let router = Router::new()
        // `GET /status.json` goes to `status`.
        .route("/status.json", get(router::status::status))
        .nest("/api", api)
        .with_state(state.clone())
        .route_layer(AxumMiddleware::from_fn(telemetry::track))
        .layer(middleware);

    middleware::security_headers(state.config.production)
        .into_iter()
        .fold(router, |router, (name, value)| {
            router.layer(SetResponseHeaderLayer::overriding(name, value))
        })
}

/// Initialize the application state.
pub async fn initialize_state() -> Result<AppState, Box<dyn std::error::Error>> {
    // `CONFIG_PATH` overrides the default `config.yaml`.
    let path = std::env::var("CONFIG_PATH").map(PathBuf::from).unwrap_or_default();
    let config = config::Configuration::default().path(path).read()?;

    let Some(postgres) = &config.postgres else {
        return Err("missing `postgres` entry on `config.yaml` file".into());
    };
    let pool = database::connect(postgres).await?;

    let mail = match &config.mail {
        Some(cfg) => mail::MailManager::new(cfg).await?,
        None => {
            tracing::warn!("missing `mail` entry on `config.yaml` file, confirmation emails disabled");
            mail::MailManager::default()
        },
    };

    let limiter = RateLimiter::new(
        Arc::new(SystemClock),
        config.rate_limits.sweep_probability,
    );

    Ok(AppState {
        config,
        store: Arc::new(PostgresRepository::new(pool)),
        mail,
        limiter,
    })
}
