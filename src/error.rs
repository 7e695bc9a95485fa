//! Error handler for the waitlist.

use axum::extract::rejection::{FormRejection, QueryRejection};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use sqlx::Error as SQLxError;
use thiserror::Error;
use validator::ValidationErrors;

pub type Result<T> = std::result::Result<T, ServerError>;

const UNAVAILABLE: &str = "Service temporarily unavailable.";

/// Enum representing server-side errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("validation error occurred")]
    Validation(#[from] ValidationErrors),

    #[error(transparent)]
    Form(#[from] FormRejection),

    #[error(transparent)]
    Query(#[from] QueryRejection),

    #[error("{0}")]
    NotFound(&'static str),

    #[error("{0}")]
    Gone(&'static str),

    #[error("email is already registered")]
    Duplicate,

    #[error("{0}")]
    Unavailable(&'static str),

    #[error("SQL request failed: {0}")]
    Sql(#[from] SQLxError),

    #[error("AMQP request failed: {0}")]
    Amqp(#[from] lapin::Error),

    #[error("URL is invalid: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid AMQP scheme")]
    InvalidScheme,

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

/// Structure for detailed error responses.
#[derive(Debug, Serialize)]
pub struct ResponseError {
    success: bool,
    error: String,
    #[serde(skip)]
    status: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    errors: Option<Vec<FieldError>>,
}

impl ResponseError {
    /// Update error status code.
    pub fn status(mut self, code: StatusCode) -> Self {
        self.status = code.as_u16();
        self
    }

    /// Update `error` field.
    pub fn error(mut self, description: &str) -> Self {
        self.error = description.into();
        self
    }

    /// Automatically add errors field.
    pub fn errors(mut self, errors: &ValidationErrors) -> Self {
        let errors = parse_validation_errors(errors);
        self.error = errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join(" ");
        self.errors = Some(errors);
        self
    }

    /// Transform [`ResponseError`] into axum [`Response`].
    pub fn into_response(self) -> std::result::Result<Response, axum::http::Error> {
        if let Ok(body) = serde_json::to_string(&self) {
            Response::builder()
                .status(self.status)
                .header(header::CONTENT_TYPE, "application/json")
                .body(body.into())
        } else {
            Ok(internal_server_error())
        }
    }
}

impl Default for ResponseError {
    fn default() -> Self {
        Self {
            success: false,
            error: UNAVAILABLE.to_owned(),
            status: StatusCode::INTERNAL_SERVER_ERROR.as_u16(),
            errors: None,
        }
    }
}

#[derive(Debug, Serialize)]
struct FieldError {
    field: String,
    message: String,
}

fn parse_validation_errors(errors: &ValidationErrors) -> Vec<FieldError> {
    let mut errors: Vec<FieldError> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, issues)| {
            issues.iter().map(move |issue| FieldError {
                field: field.to_string(),
                message: issue.to_string(),
            })
        })
        .collect();
    errors.sort_by(|a, b| a.field.cmp(&b.field));
    errors
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let response = ResponseError::default().status(StatusCode::BAD_REQUEST);

        let response = match &self {
            ServerError::Validation(validation_errors) => response.errors(validation_errors),

            ServerError::Form(err) => response.error(&err.body_text()),

            ServerError::Query(err) => response.error(&err.body_text()),

            ServerError::NotFound(message) => {
                response.error(message).status(StatusCode::NOT_FOUND)
            },

            ServerError::Gone(message) => response.error(message).status(StatusCode::GONE),

            ServerError::Unavailable(message) => {
                tracing::error!(%message, "server returned 500 status");

                ResponseError::default().error(message)
            },

            err => {
                tracing::error!(%err, "server returned 500 status");

                ResponseError::default()
            },
        };

        response
            .into_response()
            .unwrap_or_else(|_| internal_server_error())
    }
}

fn internal_server_error() -> Response {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .header(header::CONTENT_TYPE, "application/json")
        .body(
            serde_json::json!({
                "success": false,
                "error": UNAVAILABLE,
            })
            .to_string()
            .into(),
        )
        .unwrap_or_else(|_| Response::new(UNAVAILABLE.into()))
}
