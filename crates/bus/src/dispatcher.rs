//! Asynchronous event dispatch.
//!
//! Committed events arrive on a channel. The dispatcher runs each one's
//! handler as its own task, so a slow, failing or panicking handler never
//! holds up the command that raised the event or any other handler.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use domain::{DomainEvent, EventKind};
use futures_util::FutureExt;
use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::{JoinError, JoinHandle, JoinSet};

use crate::config::BusConfig;
use crate::{AppError, Result};

/// Reacts to one kind of committed domain event.
///
/// Handlers are best effort: errors are logged and the event is not retried.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &DomainEvent) -> Result<()>;
}

/// Consumes the bus's event channel. Start it with [`EventDispatcher::spawn`].
pub struct EventDispatcher {
    receiver: mpsc::Receiver<DomainEvent>,
    handlers: Arc<HashMap<EventKind, Arc<dyn EventHandler>>>,
    max_concurrent_handlers: usize,
    shutdown_grace: Duration,
}

impl EventDispatcher {
    pub(crate) fn new(
        receiver: mpsc::Receiver<DomainEvent>,
        handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
        config: &BusConfig,
    ) -> Self {
        Self {
            receiver,
            handlers: Arc::new(handlers),
            max_concurrent_handlers: config.max_concurrent_handlers.max(1),
            shutdown_grace: config.shutdown_grace,
        }
    }

    /// Starts the dispatch loop on the current runtime.
    pub fn spawn(self) -> DispatcherHandle {
        let (stop, stopped) = watch::channel(false);
        let join = tokio::spawn(self.run(stopped));
        DispatcherHandle { stop, join }
    }

    async fn run(mut self, mut stopped: watch::Receiver<bool>) {
        let permits = Arc::new(Semaphore::new(self.max_concurrent_handlers));
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                Ok(()) = stopped.changed() => break,
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => log_join(joined),
                received = self.receiver.recv() => match received {
                    Some(event) => self.dispatch(event, &permits, &mut tasks),
                    None => break,
                },
            }
        }

        let drained = tokio::time::timeout(self.shutdown_grace, async {
            while let Some(joined) = tasks.join_next().await {
                log_join(joined);
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!(
                in_flight = tasks.len(),
                "shutdown grace elapsed, aborting event handlers"
            );
            tasks.shutdown().await;
        }
        tracing::info!("event dispatcher stopped");
    }

    /// The handler registered for `kind`.
    fn route(&self, kind: EventKind) -> Result<Arc<dyn EventHandler>> {
        self.handlers
            .get(&kind)
            .cloned()
            .ok_or_else(|| AppError::NoHandler(kind.to_string()))
    }

    /// Spawns the handler for `event`. The task waits for a permit itself,
    /// so a saturated pool never stops the loop from receiving or stopping.
    fn dispatch(&self, event: DomainEvent, permits: &Arc<Semaphore>, tasks: &mut JoinSet<()>) {
        let kind = event.kind();
        let handler = match self.route(kind) {
            Ok(handler) => handler,
            Err(err) => {
                tracing::warn!(event_kind = %kind, error = %err, "dropping event");
                metrics::counter!("bus_events_dispatched_total", "outcome" => "no_handler")
                    .increment(1);
                return;
            }
        };
        let permits = Arc::clone(permits);

        tasks.spawn(async move {
            let Ok(_permit) = permits.acquire_owned().await else {
                return;
            };
            let outcome = AssertUnwindSafe(handler.handle(&event)).catch_unwind().await;
            let label = match outcome {
                Ok(Ok(())) => "ok",
                Ok(Err(err)) => {
                    tracing::warn!(event_kind = %kind, error = %err, "event handler failed");
                    "error"
                }
                Err(_) => {
                    tracing::error!(event_kind = %kind, "event handler panicked");
                    "panic"
                }
            };
            metrics::counter!("bus_events_dispatched_total", "outcome" => label).increment(1);
        });
    }
}

fn log_join(joined: std::result::Result<(), JoinError>) {
    if let Err(err) = joined
        && !err.is_cancelled()
    {
        tracing::error!(error = %err, "event handler task failed");
    }
}

/// Controls a running dispatcher.
pub struct DispatcherHandle {
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
}

impl DispatcherHandle {
    /// Stops taking new events, waits for in-flight handlers up to the
    /// shutdown grace and aborts whatever is still running.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "event dispatcher task failed");
        }
    }

    /// Waits for the loop to end on its own, which happens once every bus
    /// handle is dropped.
    pub async fn join(self) {
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "event dispatcher task failed");
        }
    }
}
