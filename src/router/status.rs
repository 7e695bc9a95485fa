//! Public status page for front-end identification.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use serde::Serialize;

use crate::config::Configuration;

/// Public server status.
#[derive(Debug, Serialize)]
pub struct Status {
    name: String,
    url: String,
    version: String,
}

/// Expose instance name, site URL and version.
pub async fn status(State(config): State<Arc<Configuration>>) -> Json<Status> {
    Json(Status {
        name: config.name.clone(),
        url: config.url.clone(),
        version: config.version.clone(),
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;

    use crate::entry::MemoryRepository;
    use crate::*;

    #[tokio::test]
    async fn test_status() {
        let state = router::state(Arc::new(MemoryRepository::default()));
        let response = make_request(app(state), Method::GET, "/status.json", "", "").await;

        assert_eq!(response.status(), StatusCode::OK);
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(body["name"], "PyMCU Alpha");
        assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
        assert!(body.get("postgres").is_none());
    }
}
