use std::sync::Arc;

use async_trait::async_trait;
use common::EntityId;
use domain::DomainEvent;

use crate::Result;
use crate::dispatcher::EventHandler;

/// Sends messages to users.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn welcome(&self, user_id: EntityId, username: &str, email: &str) -> Result<()>;
}

/// Notifier that only writes a log line.
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn welcome(&self, user_id: EntityId, username: &str, email: &str) -> Result<()> {
        tracing::info!(%user_id, username, email, "welcome message sent");
        Ok(())
    }
}

/// Greets newly registered users.
pub struct WelcomeUserHandler {
    notifier: Arc<dyn Notifier>,
}

impl WelcomeUserHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl EventHandler for WelcomeUserHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        if let DomainEvent::UserRegistered(registered) = event {
            self.notifier
                .welcome(registered.user_id, &registered.username, &registered.email)
                .await?;
        }
        Ok(())
    }
}

/// Writes committed catalog and account changes to the audit log.
#[derive(Debug, Default, Clone)]
pub struct AuditLogHandler;

#[async_trait]
impl EventHandler for AuditLogHandler {
    async fn handle(&self, event: &DomainEvent) -> Result<()> {
        tracing::info!(
            target: "audit",
            event_kind = %event.kind(),
            entity_id = %event.entity_id(),
            occurred_at = %event.occurred_at(),
            "domain event committed"
        );
        Ok(())
    }
}
