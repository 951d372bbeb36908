use std::time::Duration;

/// Tuning for the message bus and its event dispatcher.
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Upper bound on the work inside one `UnitOfWork::run` call. Commit is
    /// not included.
    pub statement_timeout: Duration,
    /// Capacity of the channel between the bus and the dispatcher. Events
    /// that find it full are dropped and counted.
    pub event_channel_capacity: usize,
    /// Event handlers allowed to run at the same time.
    pub max_concurrent_handlers: usize,
    /// How long shutdown waits for in-flight event handlers.
    pub shutdown_grace: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            statement_timeout: Duration::from_secs(30),
            event_channel_capacity: 1024,
            max_concurrent_handlers: 32,
            shutdown_grace: Duration::from_secs(5),
        }
    }
}
