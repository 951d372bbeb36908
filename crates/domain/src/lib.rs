//! Domain layer for the shop write pipeline.
//!
//! This crate provides:
//! - the [`Entity`] capability and its owned [`EventQueue`]
//! - [`DomainEvent`] raised by entities while business rules run
//! - [`Command`] values routed by the message bus
//! - the `User`, `Category` and `Product` entities

pub mod catalog;
pub mod command;
pub mod entity;
pub mod error;
pub mod events;
pub mod user;

pub use catalog::{Category, Product};
pub use command::{
    ChangeProductPrice, Command, CommandKind, CreateCategory, CreateProduct, DeleteProduct,
    DeleteUser, RegisterUser,
};
pub use common::EntityId;
pub use entity::{Entity, EventQueue};
pub use error::DomainError;
pub use events::{
    CategoryCreated, DomainEvent, EventKind, ProductCreated, ProductDeleted, ProductPriceChanged,
    UserDeleted, UserRegistered,
};
pub use user::User;
