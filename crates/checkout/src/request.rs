//! Checkout request shape and input validation.

use common::{ProductId, UserId};
use serde::Deserialize;
use store::PaymentMethod;

use crate::CheckoutError;

/// One requested line, quantity of a product.
#[derive(Debug, Clone, Deserialize)]
pub struct RequestLine {
    pub product_id: ProductId,
    pub quantity: u32,
}

/// A checkout submission, either path.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutRequest {
    pub user_id: Option<UserId>,
    pub address: String,
    pub payment_method: PaymentMethod,
    pub card_number: Option<String>,
    pub lines: Vec<RequestLine>,
}

impl CheckoutRequest {
    /// Rejects structurally bad requests before any shared state is
    /// touched. Card numbers are checked here and never stored.
    pub fn validate(&self) -> Result<(), CheckoutError> {
        if self.address.trim().is_empty() {
            return Err(CheckoutError::Validation(
                "Address and payment method are required".to_string(),
            ));
        }
        if self.lines.is_empty() {
            return Err(CheckoutError::Validation("Your cart is empty".to_string()));
        }
        if self.lines.iter().any(|line| line.quantity == 0) {
            return Err(CheckoutError::Validation(
                "Quantity must be at least 1".to_string(),
            ));
        }
        if self.payment_method == PaymentMethod::Card {
            let Some(card_number) = self.card_number.as_deref() else {
                return Err(CheckoutError::Validation(
                    "No card number provided".to_string(),
                ));
            };
            let card_number = card_number.trim();
            if card_number.len() != 16 {
                return Err(CheckoutError::Validation(
                    "Card number must be exactly 16 digits".to_string(),
                ));
            }
            if !card_number.bytes().all(|b| b.is_ascii_digit()) {
                return Err(CheckoutError::Validation(
                    "Card number must contain only numeric digits".to_string(),
                ));
            }
        }
        Ok(())
    }
}
