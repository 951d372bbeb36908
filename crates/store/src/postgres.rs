//! PostgreSQL backend.

use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::EntityId;
use domain::{Category, Entity, Product, User};
use sqlx::pool::PoolConnection;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgConnection, PgPool, Postgres, Row};
use tokio::sync::{MappedMutexGuard, MutexGuard};
use uuid::Uuid;

use crate::database::Database;
use crate::outbox::{
    ClaimToken, NewOutboxRecord, OutboxId, OutboxRecord, OutboxStats, OutboxStatus, OutboxStore,
    cutoff,
};
use crate::repository::{CategoryRepository, OutboxRepository, ProductRepository, UserRepository};
use crate::session::Session;
use crate::{Result, StoreError};

/// An open PostgreSQL transaction.
pub type PgTx = sqlx::Transaction<'static, Postgres>;

const OUTBOX_COLUMNS: &str = "id, event_type, aggregate_type, aggregate_id, payload, status, \
     retry_count, max_retries, error_message, processed_at, next_attempt_at, claim_token, \
     created_at, updated_at";

/// PostgreSQL-backed database.
#[derive(Clone)]
pub struct PgDatabase {
    pool: PgPool,
}

impl PgDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connects a pool of at most `max_connections` to `url`.
    pub async fn connect(url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await?;
        Ok(Self::new(pool))
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> Result<()> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    fn repository(&self, session: Session<PgTx>) -> PgRepository {
        PgRepository {
            pool: self.pool.clone(),
            session,
        }
    }
}

#[async_trait]
impl Database for PgDatabase {
    type Tx = PgTx;

    async fn begin(&self) -> Result<PgTx> {
        Ok(self.pool.begin().await?)
    }

    async fn commit(&self, tx: PgTx) -> Result<()> {
        tx.commit()
            .await
            .map_err(|e| StoreError::CommitFailed(e.to_string()))
    }

    async fn rollback(&self, tx: PgTx) -> Result<()> {
        tx.rollback().await?;
        Ok(())
    }

    fn users(&self, session: Session<PgTx>) -> Box<dyn UserRepository> {
        Box::new(self.repository(session))
    }

    fn categories(&self, session: Session<PgTx>) -> Box<dyn CategoryRepository> {
        Box::new(self.repository(session))
    }

    fn products(&self, session: Session<PgTx>) -> Box<dyn ProductRepository> {
        Box::new(self.repository(session))
    }

    fn outbox(&self, session: Session<PgTx>) -> Box<dyn OutboxRepository> {
        Box::new(self.repository(session))
    }
}

/// The connection one statement runs on.
enum PgConn<'a> {
    Tx(MappedMutexGuard<'a, PgTx>),
    Pooled(PoolConnection<Postgres>),
}

impl Deref for PgConn<'_> {
    type Target = PgConnection;

    fn deref(&self) -> &PgConnection {
        match self {
            PgConn::Tx(tx) => &***tx,
            PgConn::Pooled(conn) => &**conn,
        }
    }
}

impl DerefMut for PgConn<'_> {
    fn deref_mut(&mut self) -> &mut PgConnection {
        match self {
            PgConn::Tx(tx) => &mut ***tx,
            PgConn::Pooled(conn) => &mut **conn,
        }
    }
}

struct PgRepository {
    pool: PgPool,
    session: Session<PgTx>,
}

impl PgRepository {
    /// The bound transaction, or a pooled connection when nothing is bound.
    async fn conn(&self) -> Result<PgConn<'_>> {
        let slot = self.session.lock().await;
        let slot = match MutexGuard::try_map(slot, Option::as_mut) {
            Ok(tx) => return Ok(PgConn::Tx(tx)),
            Err(slot) => slot,
        };
        drop(slot);
        Ok(PgConn::Pooled(self.pool.acquire().await?))
    }

    async fn count_rows(&self, table: &str) -> Result<u64> {
        let mut conn = self.conn().await?;
        let count: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&mut *conn)
            .await?;
        Ok(count as u64)
    }
}

fn write_error(err: sqlx::Error) -> StoreError {
    if let sqlx::Error::Database(ref db_err) = err
        && db_err.is_unique_violation()
    {
        return StoreError::UniqueViolation {
            constraint: db_err.constraint().unwrap_or("unknown").to_string(),
        };
    }
    StoreError::Database(err)
}

fn row_to_user(row: &PgRow) -> Result<User> {
    Ok(User::restore(
        EntityId::from_uuid(row.try_get::<Uuid, _>("id")?),
        row.try_get("username")?,
        row.try_get("email")?,
        row.try_get("created_at")?,
        row.try_get("updated_at")?,
        row.try_get("deleted_at")?,
    ))
}

fn row_to_category(row: &PgRow) -> Result<Category> {
    Ok(Category::restore(
        EntityId::from_uuid(row.try_get::<Uuid, _>("id")?),
        row.try_get("name")?,
        row.try_get("created_at")?,
        row.try_get("updated_at")?,
    ))
}

fn row_to_product(row: &PgRow) -> Result<Product> {
    Ok(Product::restore(
        EntityId::from_uuid(row.try_get::<Uuid, _>("id")?),
        row.try_get("name")?,
        row.try_get("description")?,
        row.try_get("price_cents")?,
        EntityId::from_uuid(row.try_get::<Uuid, _>("category_id")?),
        row.try_get("created_at")?,
        row.try_get("updated_at")?,
        row.try_get("deleted_at")?,
    ))
}

fn row_to_outbox(row: &PgRow) -> Result<OutboxRecord> {
    let status: String = row.try_get("status")?;
    Ok(OutboxRecord {
        id: OutboxId::from(row.try_get::<i64, _>("id")?),
        event_type: row.try_get("event_type")?,
        aggregate_type: row.try_get("aggregate_type")?,
        aggregate_id: row.try_get("aggregate_id")?,
        payload: row.try_get("payload")?,
        status: status.parse()?,
        retry_count: row.try_get("retry_count")?,
        max_retries: row.try_get("max_retries")?,
        error_message: row.try_get("error_message")?,
        processed_at: row.try_get("processed_at")?,
        next_attempt_at: row.try_get("next_attempt_at")?,
        claim_token: row
            .try_get::<Option<Uuid>, _>("claim_token")?
            .map(ClaimToken::from),
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

#[async_trait]
impl UserRepository for PgRepository {
    async fn get(&self, id: EntityId) -> Result<Option<User>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            "SELECT id, username, email, created_at, updated_at, deleted_at FROM users WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn find_by_username(&self, username: &str) -> Result<Option<User>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            "SELECT id, username, email, created_at, updated_at, deleted_at FROM users WHERE username = $1",
        )
        .bind(username)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(row_to_user).transpose()
    }

    async fn save(&self, user: &User) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO users (id, username, email, created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO UPDATE SET
                username = EXCLUDED.username,
                email = EXCLUDED.email,
                updated_at = EXCLUDED.updated_at,
                deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(user.id().as_uuid())
        .bind(user.username())
        .bind(user.email())
        .bind(user.created_at())
        .bind(user.updated_at())
        .bind(user.deleted_at())
        .execute(&mut *conn)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        self.count_rows("users").await
    }
}

#[async_trait]
impl CategoryRepository for PgRepository {
    async fn get(&self, id: EntityId) -> Result<Option<Category>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query("SELECT id, name, created_at, updated_at FROM categories WHERE id = $1")
            .bind(id.as_uuid())
            .fetch_optional(&mut *conn)
            .await?;
        row.as_ref().map(row_to_category).transpose()
    }

    async fn find_by_name(&self, name: &str) -> Result<Option<Category>> {
        let mut conn = self.conn().await?;
        let row =
            sqlx::query("SELECT id, name, created_at, updated_at FROM categories WHERE name = $1")
                .bind(name)
                .fetch_optional(&mut *conn)
                .await?;
        row.as_ref().map(row_to_category).transpose()
    }

    async fn save(&self, category: &Category) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO categories (id, name, created_at, updated_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(category.id().as_uuid())
        .bind(category.name())
        .bind(category.created_at())
        .bind(category.updated_at())
        .execute(&mut *conn)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        self.count_rows("categories").await
    }
}

#[async_trait]
impl ProductRepository for PgRepository {
    async fn get(&self, id: EntityId) -> Result<Option<Product>> {
        let mut conn = self.conn().await?;
        let row = sqlx::query(
            r#"
            SELECT id, name, description, price_cents, category_id, created_at, updated_at, deleted_at
            FROM products
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(row_to_product).transpose()
    }

    async fn save(&self, product: &Product) -> Result<()> {
        let mut conn = self.conn().await?;
        sqlx::query(
            r#"
            INSERT INTO products (id, name, description, price_cents, category_id, created_at, updated_at, deleted_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                name = EXCLUDED.name,
                description = EXCLUDED.description,
                price_cents = EXCLUDED.price_cents,
                category_id = EXCLUDED.category_id,
                updated_at = EXCLUDED.updated_at,
                deleted_at = EXCLUDED.deleted_at
            "#,
        )
        .bind(product.id().as_uuid())
        .bind(product.name())
        .bind(product.description())
        .bind(product.price_cents())
        .bind(product.category_id().as_uuid())
        .bind(product.created_at())
        .bind(product.updated_at())
        .bind(product.deleted_at())
        .execute(&mut *conn)
        .await
        .map_err(write_error)?;
        Ok(())
    }

    async fn count(&self) -> Result<u64> {
        self.count_rows("products").await
    }
}

#[async_trait]
impl OutboxRepository for PgRepository {
    async fn add(&self, record: NewOutboxRecord) -> Result<OutboxId> {
        let mut conn = self.conn().await?;
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox (event_type, aggregate_type, aggregate_id, payload, max_retries)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(&record.event_type)
        .bind(&record.aggregate_type)
        .bind(&record.aggregate_id)
        .bind(&record.payload)
        .bind(record.max_retries)
        .fetch_one(&mut *conn)
        .await?;
        Ok(OutboxId::from(id))
    }

    async fn count(&self) -> Result<u64> {
        self.count_rows("outbox").await
    }
}

#[async_trait]
impl OutboxStore for PgDatabase {
    #[tracing::instrument(skip(self))]
    async fn claim_pending(&self, limit: usize) -> Result<Vec<OutboxRecord>> {
        // SKIP LOCKED lets concurrent processors take disjoint batches.
        let sql = format!(
            r#"
            UPDATE outbox
            SET status = 'processing', claim_token = $2, updated_at = now()
            WHERE id IN (
                SELECT id FROM outbox
                WHERE status = 'pending'
                  AND (next_attempt_at IS NULL OR next_attempt_at <= now())
                ORDER BY created_at, id
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING {OUTBOX_COLUMNS}
            "#
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .bind(ClaimToken::new().as_uuid())
            .fetch_all(&self.pool)
            .await?;

        let mut records = rows.iter().map(row_to_outbox).collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order.
        records.sort_by_key(|r| (r.created_at, r.id));
        Ok(records)
    }

    async fn claim(&self, id: OutboxId) -> Result<Option<ClaimToken>> {
        let token = ClaimToken::new();
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'processing', claim_token = $2, updated_at = now()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id.as_i64())
        .bind(token.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok((result.rows_affected() == 1).then_some(token))
    }

    async fn complete(&self, id: OutboxId, token: ClaimToken) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'completed', claim_token = NULL, processed_at = now(), updated_at = now()
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(id.as_i64())
        .bind(token.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    #[tracing::instrument(skip(self, error))]
    async fn record_failure(
        &self,
        id: OutboxId,
        token: ClaimToken,
        error: &str,
        retry_at: DateTime<Utc>,
    ) -> Result<Option<OutboxStatus>> {
        let status: Option<String> = sqlx::query_scalar(
            r#"
            UPDATE outbox
            SET retry_count = retry_count + 1,
                error_message = $2,
                claim_token = NULL,
                updated_at = now(),
                status = CASE WHEN retry_count + 1 >= max_retries THEN 'failed' ELSE 'pending' END,
                next_attempt_at = CASE WHEN retry_count + 1 >= max_retries THEN NULL ELSE $3 END
            WHERE id = $1 AND status = 'processing' AND claim_token = $4
            RETURNING status
            "#,
        )
        .bind(id.as_i64())
        .bind(error)
        .bind(retry_at)
        .bind(token.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        status.map(|s| s.parse()).transpose()
    }

    async fn recover_stale(&self, lease: Duration) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE outbox
            SET status = 'pending', claim_token = NULL, updated_at = now()
            WHERE status = 'processing' AND updated_at <= $1
            "#,
        )
        .bind(cutoff(lease))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn stats(&self) -> Result<OutboxStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n, MIN(created_at) AS oldest FROM outbox GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut stats = OutboxStats::default();
        for row in rows {
            let status: String = row.try_get("status")?;
            let n = row.try_get::<i64, _>("n")? as u64;
            match status.parse()? {
                OutboxStatus::Pending => {
                    stats.pending = n;
                    stats.oldest_pending_at = row.try_get("oldest")?;
                }
                OutboxStatus::Processing => stats.processing = n,
                OutboxStatus::Completed => stats.completed = n,
                OutboxStatus::Failed => stats.failed = n,
            }
        }
        Ok(stats)
    }

    async fn purge_completed(&self, older_than: Duration) -> Result<u64> {
        let result =
            sqlx::query("DELETE FROM outbox WHERE status = 'completed' AND processed_at <= $1")
                .bind(cutoff(older_than))
                .execute(&self.pool)
                .await?;
        Ok(result.rows_affected())
    }

    async fn get(&self, id: OutboxId) -> Result<Option<OutboxRecord>> {
        let sql = format!("SELECT {OUTBOX_COLUMNS} FROM outbox WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_outbox).transpose()
    }
}
