//! Confirm an email using the link sent at registration.

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::entry::Status;
use crate::error::{Result, ServerError};
use crate::router::{ApiResponse, ValidQuery};

#[derive(Debug, Deserialize, Validate)]
pub struct Query {
    #[serde(default)]
    #[validate(length(min = 1, message = "Confirmation token is required."))]
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct Confirmed {
    email: String,
    status: Status,
    #[serde(skip_serializing_if = "Option::is_none")]
    confirmed_at: Option<DateTime<Utc>>,
}

/// Handler to consume a confirmation token.
pub async fn handler(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<Query>,
) -> Result<Json<ApiResponse<Confirmed>>> {
    let Some(entry) = state.store.find_by_token(&query.token).await? else {
        return Err(ServerError::NotFound("Invalid or expired confirmation token."));
    };

    match entry.status {
        Status::Confirmed => Ok(Json(
            ApiResponse::new("This email is already confirmed on the waitlist!").with_data(
                Confirmed {
                    email: entry.email,
                    status: entry.status,
                    confirmed_at: None,
                },
            ),
        )),
        Status::Unsubscribed => Err(ServerError::Gone(
            "This email has been unsubscribed from the waitlist.",
        )),
        Status::Pending => {
            let entry = state.store.confirm(&entry.id).await?;
            tracing::info!(entry_id = entry.id, "waitlist entry confirmed");

            Ok(Json(
                ApiResponse::new(format!(
                    "Email confirmed successfully! Welcome to the {} waitlist!",
                    state.config.name
                ))
                .with_data(Confirmed {
                    email: entry.email,
                    status: entry.status,
                    confirmed_at: entry.confirmed_at,
                }),
            ))
        },
    }
}
