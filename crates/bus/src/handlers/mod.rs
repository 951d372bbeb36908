//! The shop's command and event handlers.

mod commands;
mod events;

use std::sync::Arc;

use domain::{
    ChangeProductPrice, CreateCategory, CreateProduct, DeleteProduct, DeleteUser, EventKind,
    RegisterUser,
};
use store::Database;

use crate::Result;
use crate::message_bus::MessageBusBuilder;

pub use commands::{
    ChangeProductPriceHandler, CreateCategoryHandler, CreateProductHandler, DeleteProductHandler,
    DeleteUserHandler, OutboxPolicy, RegisterUserHandler,
};
pub use events::{AuditLogHandler, LogNotifier, Notifier, WelcomeUserHandler};

/// Registers every command handler plus the welcome and audit event handlers.
pub fn register_all<D: Database>(
    builder: MessageBusBuilder<D>,
    notifier: Arc<dyn Notifier>,
    policy: OutboxPolicy,
) -> Result<MessageBusBuilder<D>> {
    builder
        .add_handler::<RegisterUser, _>(RegisterUserHandler)?
        .add_handler::<DeleteUser, _>(DeleteUserHandler)?
        .add_handler::<CreateCategory, _>(CreateCategoryHandler)?
        .add_handler::<CreateProduct, _>(CreateProductHandler { policy })?
        .add_handler::<ChangeProductPrice, _>(ChangeProductPriceHandler { policy })?
        .add_handler::<DeleteProduct, _>(DeleteProductHandler { policy })?
        .add_event_handler(EventKind::UserRegistered, WelcomeUserHandler::new(notifier))?
        .add_event_handler(EventKind::UserDeleted, AuditLogHandler)?
        .add_event_handler(EventKind::CategoryCreated, AuditLogHandler)?
        .add_event_handler(EventKind::ProductCreated, AuditLogHandler)?
        .add_event_handler(EventKind::ProductPriceChanged, AuditLogHandler)?
        .add_event_handler(EventKind::ProductDeleted, AuditLogHandler)
}
