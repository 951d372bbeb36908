//! Wires the write pipeline and its background tasks together.

use std::sync::Arc;

use bus::handlers::{LogNotifier, register_all};
use bus::{DispatcherHandle, MessageBus};
use outbox::{Broker, OutboxConsumer, OutboxProcessor, SearchIndex};
use store::{Database, OutboxStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::Result;

/// A running pipeline: the message bus plus the event dispatcher, outbox
/// workers and search consumer it feeds.
pub struct Pipeline<D: Database> {
    bus: MessageBus<D>,
    dispatcher: DispatcherHandle,
    workers: Vec<JoinHandle<()>>,
    consumer: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl<D> Pipeline<D>
where
    D: Database + OutboxStore,
{
    /// Registers every handler and starts the background tasks.
    ///
    /// Fails before starting anything if the relay settings do not validate.
    pub async fn start(
        config: &Config,
        db: D,
        broker: Arc<dyn Broker>,
        index: Arc<dyn SearchIndex>,
    ) -> Result<Self> {
        let processor =
            OutboxProcessor::new(Arc::new(db.clone()), broker.clone(), config.processor_config())?;
        let product_topic = processor.config().topic_for("product");
        let subscription = broker.subscribe(&product_topic).await?;

        let (bus, dispatcher) = register_all(
            MessageBus::builder(db.clone()).with_config(config.bus_config()),
            Arc::new(LogNotifier),
            config.outbox_policy(),
        )?
        .build();
        let dispatcher = dispatcher.spawn();

        let (stop, shutdown) = watch::channel(false);
        let consumer =
            tokio::spawn(OutboxConsumer::new(db, index).run(subscription, shutdown.clone()));
        let workers = processor.spawn(shutdown);

        tracing::info!(
            workers = workers.len(),
            topic = %product_topic,
            "write pipeline started"
        );
        Ok(Self {
            bus,
            dispatcher,
            workers,
            consumer,
            stop,
        })
    }

    /// The bus commands are sent through.
    pub fn bus(&self) -> &MessageBus<D> {
        &self.bus
    }

    /// Stops the outbox workers and the consumer after their current work,
    /// then drains the event dispatcher.
    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "outbox worker task failed");
            }
        }
        if let Err(e) = self.consumer.await {
            tracing::error!(error = %e, "outbox consumer task failed");
        }
        drop(self.bus);
        self.dispatcher.shutdown().await;
        tracing::info!("write pipeline stopped");
    }
}
