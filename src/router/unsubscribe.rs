//! Leave the waitlist, from the email link or from a form.

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::AppState;
use crate::entry::normalize_email;
use crate::error::{Result, ServerError};
use crate::router::{ApiResponse, ValidForm, ValidQuery};

#[derive(Debug, Deserialize, Validate)]
pub struct Query {
    #[serde(default)]
    #[validate(length(min = 1, message = "Email parameter is required."))]
    pub email: String,
}

#[derive(Debug, Deserialize, Validate)]
pub struct Body {
    #[serde(default)]
    #[validate(length(min = 1, message = "Email is required."))]
    pub email: String,
}

#[derive(Debug, Serialize)]
pub struct Removed {
    email: String,
    removed_at: DateTime<Utc>,
}

/// Handler for `GET /unsubscribe?email=`.
pub async fn query(
    State(state): State<AppState>,
    ValidQuery(query): ValidQuery<Query>,
) -> Result<Json<ApiResponse<Removed>>> {
    remove(&state, &query.email).await
}

/// Handler for `POST /unsubscribe`.
pub async fn form(
    State(state): State<AppState>,
    ValidForm(body): ValidForm<Body>,
) -> Result<Json<ApiResponse<Removed>>> {
    remove(&state, &body.email).await
}

async fn remove(state: &AppState, email: &str) -> Result<Json<ApiResponse<Removed>>> {
    let email = normalize_email(email);

    let Some(entry) = state.store.find_by_email(&email).await? else {
        return Err(ServerError::NotFound("Email not found in waitlist."));
    };

    if !state.store.delete(&entry.id).await? {
        return Err(ServerError::NotFound("User not found or could not be deleted."));
    }

    tracing::info!(entry_id = entry.id, "waitlist entry removed");

    Ok(Json(
        ApiResponse::new(
            "You have been successfully removed from the waitlist. All your data has been permanently deleted.",
        )
        .with_data(Removed {
            email: entry.email,
            removed_at: Utc::now(),
        }),
    ))
}
