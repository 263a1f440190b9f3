//! Shared identifier and money types for the checkout core.

mod ids;
mod money;

pub use ids::{JobId, ProductId, SaleId, UserId};
pub use money::Money;
