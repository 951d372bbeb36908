//! The unit of work: one transaction, its repositories and their seen lists.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use domain::DomainEvent;
use futures_util::FutureExt;
use futures_util::future::{BoxFuture, join_all};
use store::{Database, OutboxRepository, Session, StoreError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;

use crate::tracked::{SeenTracked, Tracked, TrackedCategories, TrackedProducts, TrackedUsers};
use crate::{AppError, Result};

/// Groups the writes of one command into a single transaction.
///
/// Repositories are created on first use, bound to this unit of work's
/// session and kept for its whole life. Entity repositories are seen-tracked:
/// whatever they save is remembered until the transaction ends. A commit
/// moves the seen entities' events into a buffer that
/// [`UnitOfWork::collect_new_events`] drains, so several committed runs on
/// one unit of work all reach the dispatcher.
///
/// ```ignore
/// let id = uow
///     .run(|uow| Box::pin(async move {
///         let mut category = Category::create("Books")?;
///         uow.categories().save(&mut category).await?;
///         Ok(category.id())
///     }))
///     .await?;
/// ```
pub struct UnitOfWork<D: Database> {
    db: D,
    session: Session<D::Tx>,
    statement_timeout: Duration,
    users: OnceLock<Arc<TrackedUsers>>,
    categories: OnceLock<Arc<TrackedCategories>>,
    products: OnceLock<Arc<TrackedProducts>>,
    outbox: OnceLock<Box<dyn OutboxRepository>>,
    tracked: Mutex<Vec<Arc<dyn SeenTracked>>>,
    committed_events: Mutex<Vec<DomainEvent>>,
    committed: bool,
}

impl<D: Database> UnitOfWork<D> {
    pub fn new(db: D, statement_timeout: Duration) -> Self {
        Self {
            db,
            session: Session::detached(),
            statement_timeout,
            users: OnceLock::new(),
            categories: OnceLock::new(),
            products: OnceLock::new(),
            outbox: OnceLock::new(),
            tracked: Mutex::new(Vec::new()),
            committed_events: Mutex::new(Vec::new()),
            committed: false,
        }
    }

    pub fn users(&self) -> &TrackedUsers {
        self.users
            .get_or_init(|| self.track(Tracked::new(self.db.users(self.session.clone()))))
    }

    pub fn categories(&self) -> &TrackedCategories {
        self.categories
            .get_or_init(|| self.track(Tracked::new(self.db.categories(self.session.clone()))))
    }

    pub fn products(&self) -> &TrackedProducts {
        self.products
            .get_or_init(|| self.track(Tracked::new(self.db.products(self.session.clone()))))
    }

    /// The outbox repository. Outbox records raise no domain events, so it is
    /// not seen-tracked.
    pub fn outbox(&self) -> &dyn OutboxRepository {
        self.outbox
            .get_or_init(|| self.db.outbox(self.session.clone()))
            .as_ref()
    }

    fn track<R>(&self, repo: Tracked<R>) -> Arc<Tracked<R>>
    where
        R: ?Sized + Send + Sync + 'static,
    {
        let repo = Arc::new(repo);
        self.registry().push(repo.clone());
        repo
    }

    fn registry(&self) -> MutexGuard<'_, Vec<Arc<dyn SeenTracked>>> {
        self.tracked.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Whether the last [`UnitOfWork::run`] committed.
    pub fn committed(&self) -> bool {
        self.committed
    }

    fn committed_events(&self) -> MutexGuard<'_, Vec<DomainEvent>> {
        self.committed_events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Entities recorded by every tracked repository in the current
    /// transaction.
    pub fn seen_count(&self) -> usize {
        self.registry().iter().map(|repo| repo.seen_count()).sum()
    }

    /// Committed events waiting for [`UnitOfWork::collect_new_events`].
    pub fn pending_event_count(&self) -> usize {
        self.committed_events().len()
    }

    /// Runs `f` inside a fresh transaction.
    ///
    /// Commits when `f` returns `Ok` and rolls back otherwise, returning the
    /// error from `f` unchanged. A commit error is returned as is; nothing was
    /// persisted. If `f` panics the transaction is rolled back and the panic
    /// resumed. If the returned future is dropped mid-flight the transaction
    /// is dropped with it and never committed.
    ///
    /// Events raised in a run that commits are kept until collected, even
    /// across later runs. Events of a run that rolls back are discarded.
    #[tracing::instrument(skip_all)]
    pub async fn run<T, F>(&mut self, f: F) -> Result<T>
    where
        T: Send,
        F: for<'a> FnOnce(&'a UnitOfWork<D>) -> BoxFuture<'a, Result<T>> + Send,
    {
        self.committed = false;
        self.discard_seen();

        let tx = self.db.begin().await?;
        if let Some(stale) = self.session.bind(tx).await {
            self.rollback(stale).await;
        }
        let _release = ReleaseOnDrop {
            session: self.session.clone(),
        };

        let outcome = AssertUnwindSafe(tokio::time::timeout(self.statement_timeout, f(self)))
            .catch_unwind()
            .await;

        let Some(tx) = self.session.take().await else {
            return Err(StoreError::CommitFailed("transaction was released early".to_string()).into());
        };

        match outcome {
            Ok(Ok(Ok(value))) => {
                if let Err(err) = self.db.commit(tx).await {
                    self.discard_seen();
                    return Err(err.into());
                }
                self.committed = true;
                let events = self.drain_seen().await;
                tracing::debug!(events = events.len(), "unit of work committed");
                self.committed_events().extend(events);
                Ok(value)
            }
            Ok(Ok(Err(err))) => {
                tracing::debug!(error = %err, "unit of work failed, rolling back");
                self.rollback(tx).await;
                Err(err)
            }
            Ok(Err(_elapsed)) => {
                tracing::warn!(
                    timeout_ms = self.statement_timeout.as_millis() as u64,
                    "unit of work timed out, rolling back"
                );
                self.rollback(tx).await;
                Err(AppError::Timeout)
            }
            Err(panic) => {
                tracing::error!("unit of work panicked, rolling back");
                self.rollback(tx).await;
                std::panic::resume_unwind(panic)
            }
        }
    }

    async fn rollback(&self, tx: D::Tx) {
        self.discard_seen();
        if let Err(err) = self.db.rollback(tx).await {
            tracing::warn!(error = %err, "rollback failed");
        }
    }

    fn discard_seen(&self) {
        for repo in self.registry().iter() {
            repo.reset();
        }
    }

    /// Drains every tracked repository concurrently.
    async fn drain_seen(&self) -> Vec<DomainEvent> {
        let repos: Vec<Arc<dyn SeenTracked>> = self.registry().clone();
        join_all(repos.iter().map(|repo| repo.drain_events()))
            .await
            .into_iter()
            .flatten()
            .collect()
    }

    /// Forwards every committed event not yet collected to `sender`.
    ///
    /// Fails with [`AppError::EventsNotCommitted`] when nothing committed
    /// since the last collection. The buffer is empty once this returns.
    ///
    /// Never waits on the channel. An event that finds it full is dropped,
    /// logged and counted in `bus_events_dropped_total`. Returns how many
    /// events were forwarded.
    #[tracing::instrument(skip_all)]
    pub async fn collect_new_events(&self, sender: &mpsc::Sender<DomainEvent>) -> Result<usize> {
        let events = std::mem::take(&mut *self.committed_events());
        if events.is_empty() && !self.committed {
            return Err(AppError::EventsNotCommitted);
        }

        let mut forwarded = 0;
        for event in events {
            let kind = event.kind();
            match sender.try_send(event) {
                Ok(()) => forwarded += 1,
                Err(TrySendError::Full(_)) => {
                    tracing::warn!(event_kind = %kind, "event channel full, dropping event");
                    metrics::counter!("bus_events_dropped_total", "reason" => "channel_full")
                        .increment(1);
                }
                Err(TrySendError::Closed(_)) => {
                    tracing::warn!(event_kind = %kind, "event channel closed, dropping events");
                    metrics::counter!("bus_events_dropped_total", "reason" => "channel_closed")
                        .increment(1);
                    break;
                }
            }
        }
        Ok(forwarded)
    }
}

/// Drops whatever transaction is still bound when `run` is cancelled.
/// Dropping an uncommitted transaction rolls it back.
struct ReleaseOnDrop<T> {
    session: Session<T>,
}

impl<T> Drop for ReleaseOnDrop<T> {
    fn drop(&mut self) {
        if self.session.try_take().is_some() {
            tracing::warn!("unit of work cancelled, transaction dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use domain::{Category, Entity, User};
    use store::{InMemoryDatabase, NewOutboxRecord};

    fn uow(db: &InMemoryDatabase) -> UnitOfWork<InMemoryDatabase> {
        UnitOfWork::new(db.clone(), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn repositories_are_memoized() {
        let db = InMemoryDatabase::new();
        let uow = uow(&db);

        assert!(std::ptr::eq(uow.users(), uow.users()));
        assert!(std::ptr::eq(uow.products(), uow.products()));
        uow.categories();
        uow.outbox();
        // Three entity repositories, the outbox is not tracked.
        assert_eq!(uow.registry().len(), 3);
    }

    #[tokio::test]
    async fn commit_then_collect_forwards_events_once() {
        let db = InMemoryDatabase::new();
        let mut uow = uow(&db);
        let (tx, mut rx) = mpsc::channel(8);

        uow.run(|uow| {
            Box::pin(async move {
                let mut user = User::register("alice", "alice@example.com")?;
                uow.users().save(&mut user).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

        assert_eq!(uow.collect_new_events(&tx).await.unwrap(), 1);
        assert_eq!(uow.collect_new_events(&tx).await.unwrap(), 0);
        assert!(matches!(rx.recv().await, Some(DomainEvent::UserRegistered(_))));
    }

    #[tokio::test]
    async fn collect_before_commit_is_rejected() {
        let db = InMemoryDatabase::new();
        let uow = uow(&db);
        let (tx, _rx) = mpsc::channel(8);

        assert!(matches!(
            uow.collect_new_events(&tx).await,
            Err(AppError::EventsNotCommitted)
        ));
    }

    #[tokio::test]
    async fn failed_run_rolls_back_and_keeps_error() {
        let db = InMemoryDatabase::new();
        let mut uow = uow(&db);

        let result: Result<()> = uow
            .run(|uow| {
                Box::pin(async move {
                    let mut category = Category::create("Books")?;
                    uow.categories().save(&mut category).await?;
                    uow.outbox()
                        .add(NewOutboxRecord::new(
                            "category.created",
                            "category",
                            category.id(),
                            serde_json::json!({}),
                        ))
                        .await?;
                    Err(AppError::Handler("boom".to_string()))
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::Handler(msg)) if msg == "boom"));
        assert!(!uow.committed());
        assert_eq!(db.categories(Session::detached()).count().await.unwrap(), 0);
        assert!(db.outbox_records().await.is_empty());
        assert_eq!(db.rollback_count(), 1);
    }

    async fn register(uow: &mut UnitOfWork<InMemoryDatabase>, name: &'static str) {
        uow.run(move |uow| {
            Box::pin(async move {
                let mut user = User::register(name, format!("{name}@example.com"))?;
                uow.users().save(&mut user).await?;
                Ok(())
            })
        })
        .await
        .unwrap();
    }

    fn registered_name(event: Option<DomainEvent>) -> String {
        match event {
            Some(DomainEvent::UserRegistered(e)) => e.username,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn collected_events_are_not_collected_again_by_a_later_run() {
        let db = InMemoryDatabase::new();
        let mut uow = uow(&db);
        let (tx, mut rx) = mpsc::channel(8);

        register(&mut uow, "first").await;
        assert_eq!(uow.seen_count(), 0);
        assert_eq!(uow.pending_event_count(), 1);
        assert_eq!(uow.collect_new_events(&tx).await.unwrap(), 1);

        register(&mut uow, "second").await;
        assert_eq!(uow.collect_new_events(&tx).await.unwrap(), 1);

        assert_eq!(registered_name(rx.recv().await), "first");
        assert_eq!(registered_name(rx.recv().await), "second");
    }

    #[tokio::test]
    async fn every_committed_run_is_collected() {
        let db = InMemoryDatabase::new();
        let mut uow = uow(&db);
        let (tx, mut rx) = mpsc::channel(8);

        register(&mut uow, "first").await;
        register(&mut uow, "second").await;

        assert_eq!(uow.collect_new_events(&tx).await.unwrap(), 2);
        let mut names = vec![registered_name(rx.recv().await), registered_name(rx.recv().await)];
        names.sort();
        assert_eq!(names, ["first", "second"]);
    }

    #[tokio::test]
    async fn rolled_back_run_keeps_earlier_committed_events() {
        let db = InMemoryDatabase::new();
        let mut uow = uow(&db);
        let (tx, mut rx) = mpsc::channel(8);

        register(&mut uow, "kept").await;
        let result: Result<()> = uow
            .run(|uow| {
                Box::pin(async move {
                    let mut user = User::register("dropped", "dropped@example.com")?;
                    uow.users().save(&mut user).await?;
                    Err(AppError::Handler("boom".to_string()))
                })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(uow.seen_count(), 0);

        assert_eq!(uow.collect_new_events(&tx).await.unwrap(), 1);
        assert_eq!(registered_name(rx.recv().await), "kept");
    }

    #[tokio::test]
    async fn full_channel_drops_events_instead_of_waiting() {
        let db = InMemoryDatabase::new();
        let mut uow = uow(&db);
        let (tx, mut rx) = mpsc::channel(1);

        register(&mut uow, "first").await;
        register(&mut uow, "second").await;

        let forwarded = tokio::time::timeout(Duration::from_secs(1), uow.collect_new_events(&tx))
            .await
            .expect("collection never waits on the channel")
            .unwrap();
        assert_eq!(forwarded, 1);
        assert_eq!(uow.pending_event_count(), 0);
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn commit_failure_surfaces_and_blocks_collection() {
        let db = InMemoryDatabase::new();
        let mut uow = uow(&db);
        db.fail_next_commit();

        let result = uow
            .run(|uow| {
                Box::pin(async move {
                    let mut user = User::register("carol", "carol@example.com")?;
                    uow.users().save(&mut user).await?;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::Store(StoreError::CommitFailed(_)))));
        assert_eq!(db.users(Session::detached()).count().await.unwrap(), 0);

        let (tx, _rx) = mpsc::channel(8);
        assert!(matches!(
            uow.collect_new_events(&tx).await,
            Err(AppError::EventsNotCommitted)
        ));
    }

    #[tokio::test]
    async fn deadline_rolls_back() {
        let db = InMemoryDatabase::new();
        let mut uow = UnitOfWork::new(db.clone(), Duration::from_millis(20));

        let result: Result<()> = uow
            .run(|uow| {
                Box::pin(async move {
                    let mut user = User::register("slow", "slow@example.com")?;
                    uow.users().save(&mut user).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            })
            .await;

        assert!(matches!(result, Err(AppError::Timeout)));
        assert_eq!(db.users(Session::detached()).count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn cancelled_run_leaves_nothing_behind() {
        let db = InMemoryDatabase::new();
        let mut uow = uow(&db);

        let cancelled = tokio::time::timeout(
            Duration::from_millis(20),
            uow.run(|uow| {
                Box::pin(async move {
                    let mut user = User::register("gone", "gone@example.com")?;
                    uow.users().save(&mut user).await?;
                    tokio::time::sleep(Duration::from_secs(5)).await;
                    Ok(())
                })
            }),
        )
        .await;

        assert!(cancelled.is_err());
        assert!(!uow.session.is_bound().await);
        assert_eq!(db.users(Session::detached()).count().await.unwrap(), 0);
        assert_eq!(db.commit_count(), 0);
    }
}
