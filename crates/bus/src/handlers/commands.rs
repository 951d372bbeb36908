//! Command handlers for users, categories and products.
//!
//! Product handlers also write an outbox record in the same transaction, so
//! the search index hears about a change if and only if it was committed.

use async_trait::async_trait;
use common::EntityId;
use domain::{
    Category, ChangeProductPrice, CreateCategory, CreateProduct, DeleteProduct, DeleteUser,
    Entity, Product, RegisterUser, User,
};
use serde_json::json;
use store::{DEFAULT_MAX_RETRIES, Database, NewOutboxRecord};

use crate::message_bus::CommandHandler;
use crate::unit_of_work::UnitOfWork;
use crate::{AppError, Result};

const PRODUCT_AGGREGATE: &str = "product";

pub struct RegisterUserHandler;

#[async_trait]
impl<D: Database> CommandHandler<RegisterUser, D> for RegisterUserHandler {
    async fn handle(&self, uow: &mut UnitOfWork<D>, cmd: RegisterUser) -> Result<EntityId> {
        uow.run(move |uow| {
            Box::pin(async move {
                let username = cmd.username.trim().to_string();
                if uow.users().find_by_username(&username).await?.is_some() {
                    return Err(AppError::Conflict(format!(
                        "username '{username}' is already taken"
                    )));
                }
                let mut user = User::register(username, cmd.email)?;
                uow.users().save(&mut user).await?;
                Ok(user.id())
            })
        })
        .await
    }
}

pub struct DeleteUserHandler;

#[async_trait]
impl<D: Database> CommandHandler<DeleteUser, D> for DeleteUserHandler {
    async fn handle(&self, uow: &mut UnitOfWork<D>, cmd: DeleteUser) -> Result<()> {
        uow.run(move |uow| {
            Box::pin(async move {
                let mut user = uow
                    .users()
                    .get(cmd.user_id)
                    .await?
                    .filter(|u| !u.is_deleted())
                    .ok_or(AppError::NotFound {
                        entity: User::KIND,
                        id: cmd.user_id,
                    })?;
                user.delete()?;
                uow.users().save(&mut user).await?;
                Ok(())
            })
        })
        .await
    }
}

pub struct CreateCategoryHandler;

#[async_trait]
impl<D: Database> CommandHandler<CreateCategory, D> for CreateCategoryHandler {
    async fn handle(&self, uow: &mut UnitOfWork<D>, cmd: CreateCategory) -> Result<EntityId> {
        uow.run(move |uow| {
            Box::pin(async move {
                let name = cmd.name.trim().to_string();
                if uow.categories().find_by_name(&name).await?.is_some() {
                    return Err(AppError::Conflict(format!(
                        "category '{name}' already exists"
                    )));
                }
                let mut category = Category::create(name)?;
                uow.categories().save(&mut category).await?;
                Ok(category.id())
            })
        })
        .await
    }
}

/// Shared by the product handlers: the retry budget for their outbox records.
#[derive(Debug, Clone, Copy)]
pub struct OutboxPolicy {
    pub max_retries: i32,
}

impl Default for OutboxPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }
}

impl OutboxPolicy {
    fn record(&self, event_type: &str, product: &Product) -> NewOutboxRecord {
        NewOutboxRecord::new(
            event_type,
            PRODUCT_AGGREGATE,
            product.id(),
            json!({
                "product_id": product.id(),
                "name": product.name(),
                "price_cents": product.price_cents(),
                "category_id": product.category_id(),
            }),
        )
        .with_max_retries(self.max_retries)
    }
}

async fn live_product<D: Database>(uow: &UnitOfWork<D>, id: EntityId) -> Result<Product> {
    uow.products()
        .get(id)
        .await?
        .filter(|p| !p.is_deleted())
        .ok_or(AppError::NotFound {
            entity: Product::KIND,
            id,
        })
}

#[derive(Default)]
pub struct CreateProductHandler {
    pub policy: OutboxPolicy,
}

#[async_trait]
impl<D: Database> CommandHandler<CreateProduct, D> for CreateProductHandler {
    async fn handle(&self, uow: &mut UnitOfWork<D>, cmd: CreateProduct) -> Result<EntityId> {
        let policy = self.policy;
        uow.run(move |uow| {
            Box::pin(async move {
                let category = uow.categories().get(cmd.category_id).await?.ok_or(
                    AppError::NotFound {
                        entity: Category::KIND,
                        id: cmd.category_id,
                    },
                )?;
                let mut product =
                    Product::create(cmd.name, cmd.description, cmd.price_cents, &category)?;
                uow.products().save(&mut product).await?;
                uow.outbox()
                    .add(policy.record("product.created", &product))
                    .await?;
                Ok(product.id())
            })
        })
        .await
    }
}

#[derive(Default)]
pub struct ChangeProductPriceHandler {
    pub policy: OutboxPolicy,
}

#[async_trait]
impl<D: Database> CommandHandler<ChangeProductPrice, D> for ChangeProductPriceHandler {
    async fn handle(&self, uow: &mut UnitOfWork<D>, cmd: ChangeProductPrice) -> Result<()> {
        let policy = self.policy;
        uow.run(move |uow| {
            Box::pin(async move {
                let mut product = live_product(uow, cmd.product_id).await?;
                if product.price_cents() == cmd.price_cents {
                    return Ok(());
                }
                product.change_price(cmd.price_cents)?;
                uow.products().save(&mut product).await?;
                uow.outbox()
                    .add(policy.record("product.updated", &product))
                    .await?;
                Ok(())
            })
        })
        .await
    }
}

#[derive(Default)]
pub struct DeleteProductHandler {
    pub policy: OutboxPolicy,
}

#[async_trait]
impl<D: Database> CommandHandler<DeleteProduct, D> for DeleteProductHandler {
    async fn handle(&self, uow: &mut UnitOfWork<D>, cmd: DeleteProduct) -> Result<()> {
        let policy = self.policy;
        uow.run(move |uow| {
            Box::pin(async move {
                let mut product = live_product(uow, cmd.product_id).await?;
                product.delete()?;
                uow.products().save(&mut product).await?;
                uow.outbox()
                    .add(policy.record("product.deleted", &product))
                    .await?;
                Ok(())
            })
        })
        .await
    }
}
