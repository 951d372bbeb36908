//! The user account entity.

use chrono::{DateTime, Utc};
use common::EntityId;

use crate::entity::{Entity, EventQueue};
use crate::error::DomainError;
use crate::events::{DomainEvent, UserDeleted, UserRegistered};

/// A registered shop account.
#[derive(Debug, Clone, PartialEq)]
pub struct User {
    id: EntityId,
    username: String,
    email: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    deleted_at: Option<DateTime<Utc>>,
    events: EventQueue,
}

impl User {
    /// Registers a new user and raises `UserRegistered`.
    ///
    /// Username uniqueness is not checked here; it needs a repository and is
    /// enforced by the command handler and the store.
    pub fn register(
        username: impl Into<String>,
        email: impl Into<String>,
    ) -> Result<Self, DomainError> {
        let username = username.into().trim().to_string();
        let email = email.into().trim().to_string();

        if username.is_empty() {
            return Err(DomainError::EmptyField { field: "username" });
        }
        if !email.contains('@') {
            return Err(DomainError::InvalidEmail(email));
        }

        let now = Utc::now();
        let mut user = Self {
            id: EntityId::new(),
            username,
            email,
            created_at: now,
            updated_at: now,
            deleted_at: None,
            events: EventQueue::new(),
        };
        user.events.raise(DomainEvent::UserRegistered(UserRegistered {
            user_id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            occurred_at: now,
        }));
        Ok(user)
    }

    /// Rebuilds a user from storage. No events are raised.
    pub fn restore(
        id: EntityId,
        username: String,
        email: String,
        created_at: DateTime<Utc>,
        updated_at: DateTime<Utc>,
        deleted_at: Option<DateTime<Utc>>,
    ) -> Self {
        Self {
            id,
            username,
            email,
            created_at,
            updated_at,
            deleted_at,
            events: EventQueue::new(),
        }
    }

    /// Soft-deletes the account and raises `UserDeleted`.
    pub fn delete(&mut self) -> Result<(), DomainError> {
        if self.deleted_at.is_some() {
            return Err(DomainError::Deleted {
                entity: Self::KIND,
                id: self.id,
            });
        }
        let now = Utc::now();
        self.deleted_at = Some(now);
        self.updated_at = now;
        self.events.raise(DomainEvent::UserDeleted(UserDeleted {
            user_id: self.id,
            occurred_at: now,
        }));
        Ok(())
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn deleted_at(&self) -> Option<DateTime<Utc>> {
        self.deleted_at
    }
}

impl Entity for User {
    const KIND: &'static str = "user";

    fn id(&self) -> EntityId {
        self.id
    }

    fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    fn events(&self) -> &EventQueue {
        &self.events
    }

    fn events_mut(&mut self) -> &mut EventQueue {
        &mut self.events
    }
}
