//! Commands routed by the message bus.

use common::EntityId;

/// Stable tag identifying a command type.
///
/// The bus keeps exactly one handler per kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    RegisterUser,
    DeleteUser,
    CreateCategory,
    CreateProduct,
    ChangeProductPrice,
    DeleteProduct,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::RegisterUser => "register_user",
            CommandKind::DeleteUser => "delete_user",
            CommandKind::CreateCategory => "create_category",
            CommandKind::CreateProduct => "create_product",
            CommandKind::ChangeProductPrice => "change_product_price",
            CommandKind::DeleteProduct => "delete_product",
        }
    }
}

impl std::fmt::Display for CommandKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An intended state change.
///
/// Commands are plain data. The associated [`Command::KIND`] selects the
/// handler and [`Command::Output`] is what that handler returns on success.
pub trait Command: std::fmt::Debug + Send + Sync + 'static {
    type Output: Send + 'static;

    const KIND: CommandKind;
}

/// Register a new user account.
#[derive(Debug, Clone)]
pub struct RegisterUser {
    pub username: String,
    pub email: String,
}

impl RegisterUser {
    pub fn new(username: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            email: email.into(),
        }
    }
}

impl Command for RegisterUser {
    type Output = EntityId;
    const KIND: CommandKind = CommandKind::RegisterUser;
}

/// Soft-delete a user account.
#[derive(Debug, Clone)]
pub struct DeleteUser {
    pub user_id: EntityId,
}

impl DeleteUser {
    pub fn new(user_id: EntityId) -> Self {
        Self { user_id }
    }
}

impl Command for DeleteUser {
    type Output = ();
    const KIND: CommandKind = CommandKind::DeleteUser;
}

#[derive(Debug, Clone)]
pub struct CreateCategory {
    pub name: String,
}

impl CreateCategory {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

impl Command for CreateCategory {
    type Output = EntityId;
    const KIND: CommandKind = CommandKind::CreateCategory;
}

/// Create a product under an existing category.
#[derive(Debug, Clone)]
pub struct CreateProduct {
    pub name: String,
    pub description: String,
    pub price_cents: i64,
    pub category_id: EntityId,
}

impl CreateProduct {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        price_cents: i64,
        category_id: EntityId,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            price_cents,
            category_id,
        }
    }
}

impl Command for CreateProduct {
    type Output = EntityId;
    const KIND: CommandKind = CommandKind::CreateProduct;
}

#[derive(Debug, Clone)]
pub struct ChangeProductPrice {
    pub product_id: EntityId,
    pub price_cents: i64,
}

impl ChangeProductPrice {
    pub fn new(product_id: EntityId, price_cents: i64) -> Self {
        Self {
            product_id,
            price_cents,
        }
    }
}

impl Command for ChangeProductPrice {
    type Output = ();
    const KIND: CommandKind = CommandKind::ChangeProductPrice;
}

#[derive(Debug, Clone)]
pub struct DeleteProduct {
    pub product_id: EntityId,
}

impl DeleteProduct {
    pub fn new(product_id: EntityId) -> Self {
        Self { product_id }
    }
}

impl Command for DeleteProduct {
    type Output = ();
    const KIND: CommandKind = CommandKind::DeleteProduct;
}
