mod repository;
#[cfg(test)]
mod memory;

pub use repository::*;
#[cfg(test)]
pub use memory::MemoryRepository;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use rand::RngCore;
use rand::distributions::{Alphanumeric, DistString};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

const ID_LENGTH: usize = 20;
const TOKEN_BYTES: usize = 32;

/// Waitlist entry as saved on database.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Entry {
    pub id: String,
    pub email: String,
    pub role: Option<String>,
    pub experience: Option<String>,
    pub updates: bool,
    #[sqlx(try_from = "String")]
    pub status: Status,
    #[serde(skip)]
    pub confirmation_token: Option<String>,
    pub created_at: DateTime<Utc>,
    pub confirmed_at: Option<DateTime<Utc>>,
}

/// Sanitized registration, ready to be inserted.
#[derive(Clone, Debug, PartialEq)]
pub struct NewEntry {
    pub id: String,
    pub email: String,
    pub role: Option<Role>,
    pub experience: Option<Experience>,
    pub updates: bool,
    pub confirmation_token: String,
}

impl NewEntry {
    /// Create a pending registration with a fresh id and confirmation token.
    pub fn new(email: &str) -> Self {
        let mut token = [0u8; TOKEN_BYTES];
        OsRng.fill_bytes(&mut token);

        Self {
            id: Alphanumeric.sample_string(&mut OsRng, ID_LENGTH),
            email: normalize_email(email),
            role: None,
            experience: None,
            updates: false,
            confirmation_token: hex::encode(token),
        }
    }

    /// Update `role` of [`NewEntry`].
    pub fn with_role(mut self, role: Option<Role>) -> Self {
        self.role = role;
        self
    }

    /// Update `experience` of [`NewEntry`].
    pub fn with_experience(mut self, experience: Option<Experience>) -> Self {
        self.experience = experience;
        self
    }

    /// Update `updates` of [`NewEntry`].
    pub fn with_updates(mut self, updates: bool) -> Self {
        self.updates = updates;
        self
    }
}

/// Emails are stored trimmed and lowercased.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Registration lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Pending,
    Confirmed,
    Unsubscribed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::Confirmed => "confirmed",
            Status::Unsubscribed => "unsubscribed",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown value `{0}`")]
pub struct UnknownVariant(String);

impl TryFrom<String> for Status {
    type Error = UnknownVariant;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "pending" => Ok(Status::Pending),
            "confirmed" => Ok(Status::Confirmed),
            "unsubscribed" => Ok(Status::Unsubscribed),
            _ => Err(UnknownVariant(value)),
        }
    }
}

/// What best describes a registrant.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    Developer,
    Student,
    Maker,
    Researcher,
    Educator,
    Hobbyist,
    Other,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Developer => "developer",
            Role::Student => "student",
            Role::Maker => "maker",
            Role::Researcher => "researcher",
            Role::Educator => "educator",
            Role::Hobbyist => "hobbyist",
            Role::Other => "other",
        }
    }
}

impl FromStr for Role {
    type Err = UnknownVariant;

    /// Case-insensitive, surrounding whitespace ignored.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "developer" => Ok(Role::Developer),
            "student" => Ok(Role::Student),
            "maker" => Ok(Role::Maker),
            "researcher" => Ok(Role::Researcher),
            "educator" => Ok(Role::Educator),
            "hobbyist" => Ok(Role::Hobbyist),
            "other" => Ok(Role::Other),
            _ => Err(UnknownVariant(s.to_owned())),
        }
    }
}

/// Self-assessed experience level.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Experience {
    Beginner,
    Intermediate,
    Advanced,
}

impl Experience {
    pub fn as_str(&self) -> &'static str {
        match self {
            Experience::Beginner => "beginner",
            Experience::Intermediate => "intermediate",
            Experience::Advanced => "advanced",
        }
    }
}

impl FromStr for Experience {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "beginner" => Ok(Experience::Beginner),
            "intermediate" => Ok(Experience::Intermediate),
            "advanced" => Ok(Experience::Advanced),
            _ => Err(UnknownVariant(s.to_owned())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_entry() {
        let entry = NewEntry::new("  Jane@Example.COM ");

        assert_eq!(entry.email, "jane@example.com");
        assert_eq!(entry.id.len(), ID_LENGTH);
        assert_eq!(entry.confirmation_token.len(), TOKEN_BYTES * 2);
        assert!(entry.confirmation_token.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(entry.confirmation_token, NewEntry::new("a@b.co").confirmation_token);
    }

    #[test]
    fn test_parse_choices() {
        assert_eq!(" Developer ".parse::<Role>().unwrap(), Role::Developer);
        assert_eq!("HOBBYIST".parse::<Role>().unwrap(), Role::Hobbyist);
        assert!("wizard".parse::<Role>().is_err());

        assert_eq!("Advanced".parse::<Experience>().unwrap(), Experience::Advanced);
        assert!("expert".parse::<Experience>().is_err());
    }

    #[test]
    fn test_status_from_database() {
        assert_eq!(Status::try_from("confirmed".to_owned()).unwrap(), Status::Confirmed);
        assert!(Status::try_from("deleted".to_owned()).is_err());
        assert_eq!(Status::Unsubscribed.as_str(), "unsubscribed");
    }
}
