//! Join the waitlist.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::entry::{NewEntry, Status, normalize_email};
use crate::error::{Result, ServerError};
use crate::mail;
use crate::router::{ApiResponse, ValidForm};

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct Body {
    #[serde(default)]
    #[validate(custom(function = "crate::router::validate_email"))]
    pub email: String,
    #[validate(custom(function = "crate::router::validate_role"))]
    pub role: Option<String>,
    #[validate(custom(function = "crate::router::validate_experience"))]
    pub experience: Option<String>,
    pub updates: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Registered {
    id: String,
    email: String,
    status: Status,
    created_at: DateTime<Utc>,
}

/// Handler to register an email.
pub async fn handler(
    State(state): State<AppState>,
    ValidForm(body): ValidForm<Body>,
) -> Result<(StatusCode, Json<ApiResponse<Registered>>)> {
    let entry = NewEntry::new(&body.email)
        .with_role(body.role.as_deref().and_then(|r| r.parse().ok()))
        .with_experience(body.experience.as_deref().and_then(|e| e.parse().ok()))
        .with_updates(body.updates.as_deref() == Some("true"));

    let created = match state.store.insert(&entry).await {
        Ok(created) => created,
        Err(ServerError::Duplicate) => {
            return already_registered(&state, &entry.email).await;
        },
        Err(err) => return Err(err),
    };

    let (confirmation_url, unsubscribe_url) =
        mail::links(&state.config.url, &created.email, &entry.confirmation_token)?;
    // Registration stands even if the email is lost.
    if let Err(err) = state
        .mail
        .send_confirmation(&created.email, &confirmation_url, &unsubscribe_url)
        .await
    {
        tracing::error!(entry_id = created.id, %err, "confirmation email not sent");
    }

    tracing::info!(entry_id = created.id, "waitlist entry created");

    Ok((
        StatusCode::CREATED,
        Json(
            ApiResponse::new(format!(
                "Almost there! We've sent a confirmation email to your inbox. Please click the link to complete your registration for the {} waitlist!",
                state.config.name
            ))
            .with_data(Registered {
                id: created.id,
                email: created.email,
                status: created.status,
                created_at: created.created_at,
            }),
        ),
    ))
}

async fn already_registered(
    state: &AppState,
    email: &str,
) -> Result<(StatusCode, Json<ApiResponse<Registered>>)> {
    let existing = state.store.find_by_email(&normalize_email(email)).await?;

    let message = match existing.map(|e| e.status) {
        Some(Status::Confirmed) => format!(
            "Great news! This email is already confirmed on the waitlist. You're all set for the {} release!",
            state.config.name
        ),
        Some(Status::Pending) => "We've already sent a confirmation email to this address. Please check your inbox and spam folder!".to_owned(),
        status => {
            tracing::error!(?status, "duplicate email cannot be registered again");
            return Err(ServerError::Unavailable(
                "Database error occurred. Please try again.",
            ));
        },
    };

    Ok((StatusCode::OK, Json(ApiResponse::new(message))))
}
