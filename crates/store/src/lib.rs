//! Persistence for the write pipeline.
//!
//! - [`Session`] binds one transaction and hands the same handle to every
//!   repository that asks for it
//! - [`Database`] opens, commits and rolls back transactions and builds
//!   repositories bound to a session
//! - [`OutboxStore`] runs the conditional status transitions the outbox
//!   processor relies on
//!
//! Two backends are provided: [`InMemoryDatabase`] and [`PgDatabase`].

pub mod database;
pub mod error;
pub mod memory;
pub mod outbox;
pub mod postgres;
pub mod repository;
pub mod session;

pub use common::EntityId;
pub use database::Database;
pub use error::{Result, StoreError};
pub use memory::{InMemoryDatabase, MemoryTx};
pub use outbox::{
    ClaimToken, DEFAULT_MAX_RETRIES, NewOutboxRecord, OutboxId, OutboxRecord, OutboxStats,
    OutboxStatus, OutboxStore,
};
pub use postgres::{PgDatabase, PgTx};
pub use repository::{CategoryRepository, OutboxRepository, ProductRepository, UserRepository};
pub use session::Session;
