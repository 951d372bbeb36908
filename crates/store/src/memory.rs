//! In-memory backend for tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EntityId;
use domain::{Category, Entity, Product, User};
use tokio::sync::RwLock;

use crate::database::Database;
use crate::outbox::{
    ClaimToken, NewOutboxRecord, OutboxId, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore,
    cutoff,
};
use crate::repository::{CategoryRepository, OutboxRepository, ProductRepository, UserRepository};
use crate::session::Session;
use crate::{Result, StoreError};

#[derive(Debug, Clone, Default)]
struct Tables {
    users: HashMap<EntityId, User>,
    categories: HashMap<EntityId, Category>,
    products: HashMap<EntityId, Product>,
    outbox: BTreeMap<OutboxId, OutboxRecord>,
}

/// A single row write, replayed on the live tables at commit.
#[derive(Debug, Clone)]
enum Op {
    PutUser(User),
    PutCategory(Category),
    PutProduct(Product),
    InsertOutbox(OutboxRecord),
}

impl Tables {
    fn apply(&mut self, op: Op) -> Result<()> {
        match op {
            Op::PutUser(user) => {
                let taken = self
                    .users
                    .values()
                    .any(|u| u.id() != user.id() && u.username() == user.username());
                if taken {
                    return Err(StoreError::UniqueViolation {
                        constraint: "users_username_key".to_string(),
                    });
                }
                self.users.insert(user.id(), user);
            }
            Op::PutCategory(category) => {
                let taken = self
                    .categories
                    .values()
                    .any(|c| c.id() != category.id() && c.name() == category.name());
                if taken {
                    return Err(StoreError::UniqueViolation {
                        constraint: "categories_name_key".to_string(),
                    });
                }
                self.categories.insert(category.id(), category);
            }
            Op::PutProduct(product) => {
                self.products.insert(product.id(), product);
            }
            Op::InsertOutbox(record) => {
                self.outbox.insert(record.id, record);
            }
        }
        Ok(())
    }
}

/// Stored copies never carry pending events.
fn stored<E: Entity + Clone>(entity: &E) -> E {
    let mut copy = entity.clone();
    copy.events_mut().drain();
    copy
}

/// An open in-memory transaction.
///
/// Holds a private copy of the tables taken at `begin` plus the writes made
/// since. Reads through the session see the copy; nothing reaches the shared
/// tables until commit.
#[derive(Debug)]
pub struct MemoryTx {
    staged: Tables,
    ops: Vec<Op>,
}

impl MemoryTx {
    /// Number of writes waiting for commit.
    pub fn pending_writes(&self) -> usize {
        self.ops.len()
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: RwLock<Tables>,
    next_outbox_id: AtomicU64,
    fail_next_commit: AtomicBool,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// In-memory database with the same transactional behaviour as the
/// PostgreSQL backend.
#[derive(Debug, Clone, Default)]
pub struct InMemoryDatabase {
    inner: Arc<Shared>,
}

impl InMemoryDatabase {
    /// Creates a new empty database.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next commit fail. The transaction is discarded.
    pub fn fail_next_commit(&self) {
        self.inner.fail_next_commit.store(true, Ordering::SeqCst);
    }

    pub fn commit_count(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    pub fn rollback_count(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }

    /// Every committed outbox record, in id order.
    pub async fn outbox_records(&self) -> Vec<OutboxRecord> {
        self.inner.tables.read().await.outbox.values().cloned().collect()
    }

    /// Clears all tables.
    pub async fn clear(&self) {
        *self.inner.tables.write().await = Tables::default();
    }

    fn repository(&self, session: Session<MemoryTx>) -> MemoryRepository {
        MemoryRepository {
            db: self.clone(),
            session,
        }
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    type Tx = MemoryTx;

    async fn begin(&self) -> Result<MemoryTx> {
        let staged = self.inner.tables.read().await.clone();
        Ok(MemoryTx {
            staged,
            ops: Vec::new(),
        })
    }

    async fn commit(&self, tx: MemoryTx) -> Result<()> {
        if self.inner.fail_next_commit.swap(false, Ordering::SeqCst) {
            self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
            return Err(StoreError::CommitFailed(
                "injected commit failure".to_string(),
            ));
        }

        let mut live = self.inner.tables.write().await;
        let mut next = live.clone();
        let writes = tx.ops.len();
        for op in tx.ops {
            next.apply(op)?;
        }
        *live = next;

        self.inner.commits.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(writes, "in-memory transaction committed");
        Ok(())
    }

    async fn rollback(&self, tx: MemoryTx) -> Result<()> {
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        tracing::debug!(discarded = tx.ops.len(), "in-memory transaction rolled back");
        Ok(())
    }

    fn users(&self, session: Session<MemoryTx>) -> Box<dyn UserRepository> {
        Box::new(self.repository(session))
    }

    fn categories(&self, session: Session<MemoryTx>) -> Box<dyn CategoryRepository> {
        Box::new(self.repository(session))
    }

    fn products(&self, session: Session<MemoryTx>) -> Box<dyn ProductRepository> {
        Box::new(self.repository(session))
    }

    fn outbox(&self, session: Session<MemoryTx>) -> Box<dyn OutboxRepository> {
        Box::new(self.repository(session))
    }
}

/// Repository over the in-memory tables, bound to one session.
struct MemoryRepository {
    db: InMemoryDatabase,
    session: Session<MemoryTx>,
}

impl MemoryRepository {
    async fn read<R, F>(&self, f: F) -> R
    where
        F: FnOnce(&Tables) -> R + Send,
        R: Send,
    {
        let slot = self.session.lock().await;
        match slot.as_ref() {
            Some(tx) => f(&tx.staged),
            None => f(&*self.db.inner.tables.read().await),
        }
    }

    async fn write(&self, op: Op) -> Result<()> {
        let mut slot = self.session.lock().await;
        match slot.as_mut() {
            Some(tx) => {
                tx.staged.apply(op.clone())?;
                tx.ops.push(op);
                Ok(())
            }
            None => self.db.inner.tables.write().await.apply(op),
        }
    }
}

#[async_trait]
impl UserRepository for MemoryRepository {
    async fn get(&self, id: EntityId) -> Result<Option<User>> {
        Ok(self.read(|t| t.users.get(&id).cloned()).await)
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        Ok(self
            .read(|t| t.users.values().find(|u| u.username() == username).cloned())
            .await)
    }

    async fn save(&self, user: &User) -> Result<()> {
        self.write(Op::PutUser(stored(user))).await
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.read(|t| t.users.len() as u64).await)
    }
}

#[async_trait]
impl CategoryRepository for MemoryRepository {
    async fn get(&self, id: EntityId) -> Result<Option<Category>> {
        Ok(self.read(|t| t.categories.get(&id).cloned()).await)
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Category>> {
        Ok(self
            .read(|t| t.categories.values().find(|c| c.name() == name).cloned())
            .await)
    }

    async fn save(&self, category: &Category) -> Result<()> {
        self.write(Op::PutCategory(stored(category))).await
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.read(|t| t.categories.len() as u64).await)
    }
}

#[async_trait]
impl ProductRepository for MemoryRepository {
    async fn get(&self, id: EntityId) -> Result<Option<Product>> {
        Ok(self.read(|t| t.products.get(&id).cloned()).await)
    }

    async fn save(&self, product: &Product) -> Result<()> {
        self.write(Op::PutProduct(stored(product))).await
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.read(|t| t.products.len() as u64).await)
    }
}

#[async_trait]
impl OutboxRepository for MemoryRepository {
    async fn add(&self, record: NewOutboxRecord) -> Result<OutboxId> {
        // Ids come from a sequence and are not reused after a rollback.
        let id = OutboxId::new(self.db.inner.next_outbox_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.write(Op::InsertOutbox(OutboxRecord::pending(id, record, Utc::now())))
            .await?;
        Ok(id)
    }

    async fn count(&self) -> Result<u64> {
        Ok(self.read(|t| t.outbox.len() as u64).await)
    }
}

#[async_trait]
impl OutboxStore for InMemoryDatabase {
    async fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        let now = Utc::now();
        let mut tables = self.inner.tables.write().await;

        let mut due: Vec<&mut OutboxRecord> = tables
            .outbox
            .values_mut()
            .filter(|r| r.status == OutboxStatus::Pending && r.is_due(now))
            .collect();
        due.sort_by_key(|r| (r.created_at, r.id));

        let token = ClaimToken::new();
        Ok(due
            .into_iter()
            .take(limit)
            .map(|record| {
                record.status = OutboxStatus::Processing;
                record.claim_token = Some(token);
                record.updated_at = now;
                record.clone()
            })
            .collect())
    }

    async fn claim(&self, id: OutboxId) -> Result<Option<ClaimToken>> {
        let mut tables = self.inner.tables.write().await;
        match tables.outbox.get_mut(&id) {
            Some(record) if record.status == OutboxStatus::Pending => {
                let token = ClaimToken::new();
                record.status = OutboxStatus::Processing;
                record.claim_token = Some(token);
                record.updated_at = Utc::now();
                Ok(Some(token))
            }
            _ => Ok(None),
        }
    }

    async fn complete(&self, id: OutboxId, token: ClaimToken) -> Result<bool> {
        let mut tables = self.inner.tables.write().await;
        match tables.outbox.get_mut(&id) {
            Some(record) if record.is_held_by(token) => {
                let now = Utc::now();
                record.status = OutboxStatus::Completed;
                record.claim_token = None;
                record.processed_at = Some(now);
                record.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_failure(
        &self,
        id: OutboxId,
        token: ClaimToken,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<OutboxStatus>> {
        let mut tables = self.inner.tables.write().await;
        let Some(record) = tables.outbox.get_mut(&id) else {
            return Ok(None);
        };
        if !record.is_held_by(token) {
            return Ok(None);
        }

        record.retry_count += 1;
        record.claim_token = None;
        record.error_message = Some(error.to_string());
        record.updated_at = Utc::now();
        if record.retry_count >= record.max_retries {
            record.status = OutboxStatus::Failed;
            record.next_attempt_at = None;
        } else {
            record.status = OutboxStatus::Pending;
            record.next_attempt_at = Some(retry_at);
        }
        Ok(Some(record.status))
    }

    async fn recover_stale(&self, lease: Duration) -> Result<u64> {
        let cutoff = cutoff(lease);
        let mut tables = self.inner.tables.write().await;
        let mut recovered = 0;
        for record in tables.outbox.values_mut() {
            if record.status == OutboxStatus::Processing && record.updated_at <= cutoff {
                record.status = OutboxStatus::Pending;
                record.claim_token = None;
                record.updated_at = Utc::now();
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let tables = self.inner.tables.read().await;
        let mut stats = OutboxStats::default();
        for record in tables.outbox.values() {
            match record.status {
                OutboxStatus::Pending => {
                    stats.pending += 1;
                    stats.oldest_pending_at = Some(match stats.oldest_pending_at {
                        Some(oldest) => oldest.min(record.created_at),
                        None => record.created_at,
                    });
                }
                OutboxStatus::Processing => stats.processing += 1,
                OutboxStatus::Completed => stats.completed += 1,
                OutboxStatus::Failed => stats.failed += 1,
            }
        }
        Ok(stats)
    }

    async fn purge_completed(&self, older_than: Duration) -> Result<u64> {
        let cutoff = cutoff(older_than);
        let mut tables = self.inner.tables.write().await;
        let before = tables.outbox.len();
        tables.outbox.retain(|_, r| {
            !(r.status == OutboxStatus::Completed && r.processed_at.is_some_and(|at| at <= cutoff))
        });
        Ok((before - tables.outbox.len()) as u64)
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>> {
        Ok(self.inner.tables.read().await.outbox.get(&id).cloned())
    }
}
