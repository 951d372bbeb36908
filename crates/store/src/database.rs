//! The backend abstraction the unit of work drives.

use async_trait::async_trait;

use crate::Result;
use crate::repository::{CategoryRepository, OutboxRepository, ProductRepository, UserRepository};
use crate::session::Session;

/// A database backend: transactions plus repositories bound to a session.
///
/// Implementations are cheap to clone and share their connection pool (or
/// in-memory tables) between clones.
#[async_trait]
pub trait Database: Clone + Send + Sync + 'static {
    /// An open transaction.
    type Tx: Send + 'static;

    async fn begin(&self) -> Result<Self::Tx>;

    /// Makes every write of `tx` durable, or none of them.
    async fn commit(&self, tx: Self::Tx) -> Result<()>;

    async fn rollback(&self, tx: Self::Tx) -> Result<()>;

    fn users(&self, session: Session<Self::Tx>) -> Box<dyn UserRepository>;

    fn categories(&self, session: Session<Self::Tx>) -> Box<dyn CategoryRepository>;

    fn products(&self, session: Session<Self::Tx>) -> Box<dyn ProductRepository>;

    fn outbox(&self, session: Session<Self::Tx>) -> Box<dyn OutboxRepository>;
}
