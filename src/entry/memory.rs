//! In-memory repository used by router tests.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::Utc;

use crate::entry::{Entry, NewEntry, Status, WaitlistRepository};
use crate::error::{Result, ServerError};

#[derive(Debug, Default)]
pub struct MemoryRepository {
    entries: Mutex<Vec<Entry>>,
}

impl MemoryRepository {
    /// Store an entry as-is.
    pub fn seed(&self, entry: Entry) {
        self.entries.lock().unwrap().push(entry);
    }

    pub fn all(&self) -> Vec<Entry> {
        self.entries.lock().unwrap().clone()
    }
}

#[async_trait]
impl WaitlistRepository for MemoryRepository {
    async fn insert(&self, entry: &NewEntry) -> Result<Entry> {
        let mut entries = self.entries.lock().unwrap();
        if entries.iter().any(|e| e.email == entry.email) {
            return Err(ServerError::Duplicate);
        }

        let entry = Entry {
            id: entry.id.clone(),
            email: entry.email.clone(),
            role: entry.role.map(|r| r.as_str().to_owned()),
            experience: entry.experience.map(|e| e.as_str().to_owned()),
            updates: entry.updates,
            status: Status::Pending,
            confirmation_token: Some(entry.confirmation_token.clone()),
            created_at: Utc::now(),
            confirmed_at: None,
        };
        entries.push(entry.clone());

        Ok(entry)
    }

    async fn find_by_email(&self, email: &str) -> Result<Option<Entry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries.iter().find(|e| e.email == email).cloned())
    }

    async fn find_by_token(&self, token: &str) -> Result<Option<Entry>> {
        let entries = self.entries.lock().unwrap();
        Ok(entries
            .iter()
            .find(|e| e.confirmation_token.as_deref() == Some(token))
            .cloned())
    }

    async fn confirm(&self, id: &str) -> Result<Entry> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or(ServerError::Sql(sqlx::Error::RowNotFound))?;

        entry.status = Status::Confirmed;
        entry.confirmed_at = Some(Utc::now());
        entry.confirmation_token = None;

        Ok(entry.clone())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|e| e.id != id);

        Ok(entries.len() != before)
    }
}
