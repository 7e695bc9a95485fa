//! Handle database requests.

use async_trait::async_trait;
use sqlx::{Pool, Postgres};

use crate::entry::{Entry, NewEntry, Status};
use crate::error::{Result, ServerError};

const COLUMNS: &str = "id, email, role, experience, updates, status, confirmation_token, created_at, confirmed_at";

/// Persistence operations on waitlist entries.
#[async_trait]
pub trait WaitlistRepository: Send + Sync {
    /// Insert a pending entry.
    ///
    /// Fails with [`ServerError::Duplicate`] if the email is already known.
    async fn insert(&self, entry: &NewEntry) -> Result<Entry>;

    /// Find an entry using its normalized email.
    async fn find_by_email(&self, email: &str) -> Result<Option<Entry>>;

    /// Find an entry using its confirmation token.
    async fn find_by_token(&self, token: &str) -> Result<Option<Entry>>;

    /// Mark an entry as confirmed and clear its token.
    async fn confirm(&self, id: &str) -> Result<Entry>;

    /// Delete an entry. Returns whether a row was removed.
    async fn delete(&self, id: &str) -> Result<bool>;
}

/// PostgreSQL-backed [`WaitlistRepository`].
#[derive(Clone)]
pub struct PostgresRepository {
    pool: Pool<Postgres>,
}

impl PostgresRepository {
    /// Create a new [`PostgresRepository`].
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WaitlistRepository for PostgresRepository {
    async fn insert(&self, entry: &NewEntry) -> Result<Entry> {
        let query = format!(
            r#"INSERT INTO waitlist (id, email, role, experience, updates, status, confirmation_token)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING {COLUMNS}"#
        );

        sqlx::query_as::<_, Entry>(&query)
            .bind(&entry.id)
            .bind(&entry.email)
            .bind(entry.role.map(|r| r.as_str()))
            .bind(entry.experience.map(|e| e.as_str()))
            .bind(entry.updates)
            .bind(Status::Pending.as_str())
            .bind(&entry.confirmation_token)
            .fetch_one(&self.pool)
            .await
            .map_err(|err| {
                if err
                    .as_database_error()
                    .is_some_and(|db| db.is_unique_violation())
                {
                    ServerError::Duplicate
                } else {
                    err.into()
                }
            })
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Entry>> {
        let query = format!("SELECT {COLUMNS} FROM waitlist WHERE email = $1");

        Ok(sqlx::query_as::<_, Entry>(&query)
            .bind(email)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Entry>> {
        let query = format!("SELECT {COLUMNS} FROM waitlist WHERE confirmation_token = $1");

        Ok(sqlx::query_as::<_, Entry>(&query)
            .bind(token)
            .fetch_optional(&self.pool)
            .await?)
    }

    async fn confirm(&self, id: &str) -> Result<Entry> {
        let query = format!(
            r#"UPDATE waitlist
                SET status = $2, confirmed_at = NOW(), confirmation_token = NULL
                WHERE id = $1
                RETURNING {COLUMNS}"#
        );

        Ok(sqlx::query_as::<_, Entry>(&query)
            .bind(id)
            .bind(Status::Confirmed.as_str())
            .fetch_one(&self.pool)
            .await?)
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let result = sqlx::query(r#"DELETE FROM waitlist WHERE id = $1"#)
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
