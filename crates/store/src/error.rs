use common::{ProductId, SaleId};
use thiserror::Error;

/// Errors that can occur when interacting with the retail or key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Not enough stock to satisfy a checkout line. The surrounding
    /// transaction has been rolled back; no partial writes remain.
    #[error("Insufficient stock for {product_name}: requested {requested}, available {available}")]
    StockConflict {
        product_id: ProductId,
        product_name: String,
        requested: u32,
        available: i64,
    },

    /// The referenced product does not exist.
    #[error("Product not found: {0}")]
    ProductNotFound(ProductId),

    /// The referenced sale does not exist.
    #[error("Sale not found: {0}")]
    SaleNotFound(SaleId),

    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A database migration error occurred.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StoreError {
    /// Returns true for the stock-conflict variant.
    pub fn is_stock_conflict(&self) -> bool {
        matches!(self, StoreError::StockConflict { .. })
    }
}

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
