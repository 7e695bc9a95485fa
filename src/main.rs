use std::error::Error;
use std::future::ready;
use std::net::SocketAddr;

use axum::routing::get;
use tokio::net::TcpListener;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use waitlist::{app, initialize_state, telemetry};

#[cfg(feature = "dhat-heap")]
#[global_allocator]
static ALLOC: dhat::Alloc = dhat::Alloc;

const DEFAULT_PORT: u16 = 8888;
const OTLP_ENDPOINT: &str = "OTEL_EXPORTER_OTLP_ENDPOINT";

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    #[cfg(feature = "dhat-heap")]
    let _profiler = dhat::Profiler::new_heap();

    let otlp_endpoint = std::env::var(OTLP_ENDPOINT).ok();

    // OTLP export is only enabled with an endpoint.
    let logs = otlp_endpoint
        .as_deref()
        .map(telemetry::setup_logging)
        .transpose()
        .map_err(|err| err as Box<dyn Error>)?;
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .with(logs)
        .init();

    if let Some(endpoint) = &otlp_endpoint {
        let provider =
            telemetry::setup_tracer(endpoint).map_err(|err| err as Box<dyn Error>)?;
        opentelemetry::global::set_tracer_provider(provider);
        tracing::info!(%endpoint, "opentelemetry export enabled");
    }

    let recorder = telemetry::setup_metrics_recorder()?;
    let state = initialize_state().await?;

    let port = std::env::var("PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    tracing::info!(%addr, version = env!("CARGO_PKG_VERSION"), "server started");

    let app = app(state).route("/metrics", get(move || ready(recorder.render())));
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::error!(%err, "failed to listen for ctrl+c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(err) => {
                tracing::error!(%err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("ctrl+c received, shutting down"),
        _ = terminate => tracing::info!("SIGTERM received, shutting down"),
    }
}
