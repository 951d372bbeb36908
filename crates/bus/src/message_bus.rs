//! Command routing.

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use domain::{Command, CommandKind, DomainEvent, EventKind};
use store::Database;
use tokio::sync::mpsc;

use crate::config::BusConfig;
use crate::dispatcher::{EventDispatcher, EventHandler};
use crate::unit_of_work::UnitOfWork;
use crate::{AppError, Result};

/// Handles one command type.
///
/// The handler receives a fresh unit of work and is expected to do its
/// writes inside [`UnitOfWork::run`].
#[async_trait]
pub trait CommandHandler<C: Command, D: Database>: Send + Sync {
    async fn handle(&self, uow: &mut UnitOfWork<D>, cmd: C) -> Result<C::Output>;
}

/// Type-erased `Arc<dyn CommandHandler<C, D>>`, keyed by `C::KIND`.
type ErasedHandler = Box<dyn Any + Send + Sync>;

/// Builds a [`MessageBus`] and its [`EventDispatcher`].
pub struct MessageBusBuilder<D: Database> {
    db: D,
    config: BusConfig,
    handlers: HashMap<CommandKind, ErasedHandler>,
    event_handlers: HashMap<EventKind, Arc<dyn EventHandler>>,
}

impl<D: Database> MessageBusBuilder<D> {
    pub fn new(db: D) -> Self {
        Self {
            db,
            config: BusConfig::default(),
            handlers: HashMap::new(),
            event_handlers: HashMap::new(),
        }
    }

    pub fn with_config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Registers the handler for command type `C`.
    ///
    /// Fails with [`AppError::DuplicateHandler`] if `C::KIND` already has one.
    pub fn add_handler<C, H>(mut self, handler: H) -> Result<Self>
    where
        C: Command,
        H: CommandHandler<C, D> + 'static,
    {
        if self.handlers.contains_key(&C::KIND) {
            return Err(AppError::DuplicateHandler(C::KIND.to_string()));
        }
        let handler: Arc<dyn CommandHandler<C, D>> = Arc::new(handler);
        self.handlers.insert(C::KIND, Box::new(handler));
        Ok(self)
    }

    /// Registers the handler for events of `kind`.
    pub fn add_event_handler<H>(mut self, kind: EventKind, handler: H) -> Result<Self>
    where
        H: EventHandler + 'static,
    {
        if self.event_handlers.contains_key(&kind) {
            return Err(AppError::DuplicateHandler(kind.to_string()));
        }
        self.event_handlers.insert(kind, Arc::new(handler));
        Ok(self)
    }

    pub fn build(self) -> (MessageBus<D>, EventDispatcher) {
        let (sender, receiver) = mpsc::channel(self.config.event_channel_capacity.max(1));
        let dispatcher = EventDispatcher::new(receiver, self.event_handlers, &self.config);
        let bus = MessageBus {
            db: self.db,
            handlers: Arc::new(self.handlers),
            events: sender,
            config: self.config,
        };
        (bus, dispatcher)
    }
}

/// Routes each command to its handler inside a fresh unit of work and
/// forwards the committed events to the dispatcher.
pub struct MessageBus<D: Database> {
    db: D,
    handlers: Arc<HashMap<CommandKind, ErasedHandler>>,
    events: mpsc::Sender<DomainEvent>,
    config: BusConfig,
}

impl<D: Database> Clone for MessageBus<D> {
    fn clone(&self) -> Self {
        Self {
            db: self.db.clone(),
            handlers: Arc::clone(&self.handlers),
            events: self.events.clone(),
            config: self.config.clone(),
        }
    }
}

impl<D: Database> MessageBus<D> {
    pub fn builder(db: D) -> MessageBusBuilder<D> {
        MessageBusBuilder::new(db)
    }

    pub fn database(&self) -> &D {
        &self.db
    }

    fn handler<C: Command>(&self) -> Result<Arc<dyn CommandHandler<C, D>>> {
        let erased = self
            .handlers
            .get(&C::KIND)
            .ok_or_else(|| AppError::NoHandler(C::KIND.to_string()))?;
        erased
            .downcast_ref::<Arc<dyn CommandHandler<C, D>>>()
            .cloned()
            .ok_or_else(|| AppError::HandlerTypeMismatch(C::KIND.to_string()))
    }

    /// Handles `cmd` and returns the handler's output.
    ///
    /// Handler errors come back unchanged and no events are forwarded. On
    /// success every event raised by entities the handler saved is on the
    /// dispatcher's channel before this returns, unless the channel was full.
    /// Forwarding never waits for the dispatcher.
    #[tracing::instrument(skip(self, cmd), fields(command = %C::KIND))]
    pub async fn handle<C: Command>(&self, cmd: C) -> Result<C::Output> {
        let started = Instant::now();
        let result = self.dispatch(cmd).await;

        let outcome = if result.is_ok() { "ok" } else { "error" };
        metrics::counter!("bus_commands_total", "command" => C::KIND.as_str(), "outcome" => outcome)
            .increment(1);
        metrics::histogram!("bus_command_duration_seconds", "command" => C::KIND.as_str())
            .record(started.elapsed().as_secs_f64());

        if let Err(err) = &result {
            tracing::info!(error = %err, "command rejected");
        }
        result
    }

    async fn dispatch<C: Command>(&self, cmd: C) -> Result<C::Output> {
        let handler = self.handler::<C>()?;
        let mut uow = UnitOfWork::new(self.db.clone(), self.config.statement_timeout);

        let output = handler.handle(&mut uow, cmd).await?;

        if uow.pending_event_count() > 0 {
            let forwarded = uow.collect_new_events(&self.events).await?;
            tracing::debug!(events = forwarded, "events forwarded");
        }
        Ok(output)
    }
}
