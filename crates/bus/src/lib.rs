//! Command side of the write pipeline.
//!
//! - [`UnitOfWork`] wraps one transaction and the repositories used in it
//! - [`MessageBus`] routes a command to its handler and forwards the events
//!   of committed work to the [`EventDispatcher`]
//! - [`handlers`] holds the shop's command and event handlers

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod handlers;
pub mod message_bus;
pub mod tracked;
pub mod unit_of_work;

pub use config::BusConfig;
pub use dispatcher::{DispatcherHandle, EventDispatcher, EventHandler};
pub use error::{AppError, Result};
pub use message_bus::{CommandHandler, MessageBus, MessageBusBuilder};
pub use tracked::{SeenEntity, SeenList, SeenTracked, Tracked};
pub use unit_of_work::UnitOfWork;
