//! The session provider.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

/// Shared slot holding the transaction bound to a unit of work.
///
/// Every repository created for a unit of work holds a clone of the same
/// session. On each call a repository locks the session and uses the bound
/// transaction if there is one, or the backend's base connection otherwise.
/// Repositories therefore keep working outside a transaction (each statement
/// auto-commits) while writes inside one stay isolated until commit.
pub struct Session<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Clone for Session<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Session<T> {
    fn default() -> Self {
        Self::detached()
    }
}

impl<T> Session<T> {
    /// A session with no transaction bound; every statement uses the base connection.
    pub fn detached() -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Binds `tx`, returning any transaction that was bound before.
    pub async fn bind(&self, tx: T) -> Option<T> {
        self.slot.lock().await.replace(tx)
    }

    /// Unbinds and returns the current transaction.
    pub async fn take(&self) -> Option<T> {
        self.slot.lock().await.take()
    }

    /// Like [`Session::take`] but never waits. Returns `None` when the slot is
    /// empty or currently locked.
    pub fn try_take(&self) -> Option<T> {
        self.slot.try_lock().ok().and_then(|mut slot| slot.take())
    }

    pub async fn is_bound(&self) -> bool {
        self.slot.lock().await.is_some()
    }

    /// Locks the slot for the duration of one statement.
    pub async fn lock(&self) -> MutexGuard<'_, Option<T>> {
        self.slot.lock().await
    }
}
