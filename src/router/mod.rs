//! HTTP API.
pub mod confirm;
pub mod status;
pub mod unsubscribe;
pub mod waitlist;

use std::str::FromStr;
use std::sync::LazyLock;

use axum::extract::{Form, FromRequest, FromRequestParts, Query, Request};
use axum::http::request::Parts;
use regex_lite::Regex;
use serde::Serialize;
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationError};

use crate::entry::{Experience, Role};
use crate::error::ServerError;

static EMAIL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[^\s@]+@[^\s@]+\.[^\s@]+$").expect("email pattern is valid")
});

/// Body of every successful answer.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: T) -> Self {
        self.data = Some(data);
        self
    }
}

/// Form extractor running [`Validate`] on the decoded value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidForm<T>(pub T);

impl<T, S> FromRequest<S> for ValidForm<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Form(value) = Form::<T>::from_request(req, state).await?;
        value.validate()?;
        Ok(ValidForm(value))
    }
}

/// Query extractor running [`Validate`] on the decoded value.
#[derive(Debug, Clone, Copy, Default)]
pub struct ValidQuery<T>(pub T);

impl<T, S> FromRequestParts<S> for ValidQuery<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ServerError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Query(value) = Query::<T>::from_request_parts(parts, state).await?;
        value.validate()?;
        Ok(ValidQuery(value))
    }
}

/// Check email presence and shape.
pub fn validate_email(email: &str) -> Result<(), ValidationError> {
    if email.is_empty() {
        Err(ValidationError::new("required").with_message("Email is required.".into()))
    } else if !EMAIL.is_match(email) {
        Err(ValidationError::new("email")
            .with_message("Please enter a valid email address.".into()))
    } else {
        Ok(())
    }
}

/// Blank values are accepted and treated as absent.
pub fn validate_role(role: &str) -> Result<(), ValidationError> {
    if role.trim().is_empty() || Role::from_str(role).is_ok() {
        Ok(())
    } else {
        Err(ValidationError::new("role").with_message("Invalid role selection.".into()))
    }
}

/// Blank values are accepted and treated as absent.
pub fn validate_experience(experience: &str) -> Result<(), ValidationError> {
    if experience.trim().is_empty() || Experience::from_str(experience).is_ok() {
        Ok(())
    } else {
        Err(ValidationError::new("experience")
            .with_message("Invalid experience level.".into()))
    }
}

/// Build a state over an in-memory store.
#[cfg(test)]
pub fn state(store: std::sync::Arc<crate::entry::MemoryRepository>) -> crate::AppState {
    use std::sync::Arc;

    crate::AppState {
        config: Arc::new(crate::config::Configuration::default()),
        store,
        mail: crate::mail::MailManager::default(),
        limiter: crate::ratelimiter::RateLimiter::new(
            Arc::new(crate::ratelimiter::SystemClock),
            0.0,
        ),
    }
}
