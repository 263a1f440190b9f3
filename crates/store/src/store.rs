//! The transactional retail data store trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{JobId, ProductId, SaleId};

use crate::Result;
use crate::records::{
    JobRecord, NewCheckout, PaymentOutcome, PaymentRecord, ProductRecord, ReleaseReason,
    ReleasedReservation, ReservationRecord, SaleItemRecord, SaleRecord,
};

/// The shared, atomic retail data store.
///
/// Every method is atomic with respect to every other: implementations
/// either run each operation inside a database transaction with exclusive
/// row locks (`SELECT ... FOR UPDATE`-equivalent) or serialize operations
/// through a single writer. `create_checkout` is the contended fast path —
/// among concurrent checkouts against the same product, exactly the
/// requests that land within available stock succeed; the rest fail with
/// [`StoreError::StockConflict`](crate::StoreError::StockConflict) and
/// leave no partial writes.
#[async_trait]
pub trait Store: Send + Sync {
    // -- products --

    /// Inserts a product, replacing any existing row with the same ID.
    async fn upsert_product(&self, product: ProductRecord) -> Result<()>;

    /// Loads a product by ID.
    async fn get_product(&self, id: &ProductId) -> Result<Option<ProductRecord>>;

    // -- checkout fast path --

    /// Runs the transactional checkout fast path: locks each product row,
    /// verifies `stock_quantity >= quantity`, decrements stock, and inserts
    /// the sale, payment (PENDING), sale items, and ACTIVE reservations.
    /// Aborts the whole transaction on the first line without stock.
    async fn create_checkout(&self, checkout: NewCheckout) -> Result<SaleId>;

    // -- sales & payments --

    /// Loads a sale by ID.
    async fn get_sale(&self, id: SaleId) -> Result<Option<SaleRecord>>;

    /// Loads the payment record for a sale.
    async fn get_payment(&self, sale_id: SaleId) -> Result<Option<PaymentRecord>>;

    /// Loads the line items of a sale.
    async fn get_sale_items(&self, sale_id: SaleId) -> Result<Vec<SaleItemRecord>>;

    /// Records the terminal payment outcome for a sale, updating the
    /// payment and sale statuses together.
    async fn record_payment_outcome(&self, sale_id: SaleId, outcome: PaymentOutcome) -> Result<()>;

    // -- reservations --

    /// Marks every ACTIVE reservation of the sale COMMITTED. Stock stays
    /// decremented permanently. Returns the number committed.
    async fn commit_reservations(&self, sale_id: SaleId) -> Result<usize>;

    /// Releases every ACTIVE reservation of the sale: re-increments the
    /// product stock and marks the reservation RELEASED. Already-terminal
    /// reservations are untouched, so a second release is a no-op.
    async fn release_reservations(
        &self,
        sale_id: SaleId,
        reason: ReleaseReason,
    ) -> Result<Vec<ReleasedReservation>>;

    /// Releases every ACTIVE reservation whose `expires_at` is before
    /// `now`, regardless of owning sale.
    async fn release_expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReleasedReservation>>;

    /// Loads all reservations for a sale.
    async fn get_reservations(&self, sale_id: SaleId) -> Result<Vec<ReservationRecord>>;

    // -- job queue --

    /// Persists a PENDING job.
    async fn enqueue_job(&self, job_type: &str, payload: serde_json::Value) -> Result<JobRecord>;

    /// Claims the oldest PENDING job by transitioning it to PROCESSING.
    /// Concurrent workers never claim the same job.
    async fn claim_next_job(&self) -> Result<Option<JobRecord>>;

    /// Marks a claimed job COMPLETED.
    async fn complete_job(&self, id: JobId) -> Result<()>;

    /// Marks a claimed job FAILED, recording the error.
    async fn fail_job(&self, id: JobId, error: &str) -> Result<()>;

    /// Loads a job by ID.
    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>>;
}
