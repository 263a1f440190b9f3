use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{JobId, ProductId, SaleId};
use tokio::sync::RwLock;

use crate::records::{
    JobRecord, JobStatus, NewCheckout, PaymentOutcome, PaymentRecord, PaymentStatus, ProductRecord,
    ReleaseReason, ReleasedReservation, ReservationRecord, ReservationStatus, SaleItemRecord,
    SaleRecord, SaleStatus,
};
use crate::{Result, Store, StoreError};

#[derive(Default)]
struct MemoryState {
    products: HashMap<ProductId, ProductRecord>,
    sales: HashMap<SaleId, SaleRecord>,
    payments: HashMap<SaleId, PaymentRecord>,
    sale_items: Vec<SaleItemRecord>,
    reservations: Vec<ReservationRecord>,
    jobs: Vec<JobRecord>,
}

/// In-memory retail store.
///
/// Every operation runs under a single write guard, which gives the same
/// total ordering a row-locked transaction provides: concurrent checkouts
/// against one product observe each other's decrements, and losing requests
/// fail with a stock conflict without partial writes.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<MemoryState>>,
}

impl InMemoryStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of persisted jobs in any status.
    pub async fn job_count(&self) -> usize {
        self.state.read().await.jobs.len()
    }

    fn release_one(
        state: &mut MemoryState,
        index: usize,
        released: &mut Vec<ReleasedReservation>,
    ) {
        let reservation = &mut state.reservations[index];
        reservation.status = ReservationStatus::Released;
        let entry = ReleasedReservation {
            sale_id: reservation.sale_id,
            product_id: reservation.product_id.clone(),
            quantity: reservation.quantity,
        };
        // A deleted product still gets its reservation closed out.
        if let Some(product) = state.products.get_mut(&entry.product_id) {
            product.stock_quantity += entry.quantity as i64;
        }
        released.push(entry);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn upsert_product(&self, product: ProductRecord) -> Result<()> {
        let mut state = self.state.write().await;
        state.products.insert(product.id.clone(), product);
        Ok(())
    }

    async fn get_product(&self, id: &ProductId) -> Result<Option<ProductRecord>> {
        Ok(self.state.read().await.products.get(id).cloned())
    }

    async fn create_checkout(&self, checkout: NewCheckout) -> Result<SaleId> {
        let mut state = self.state.write().await;

        // Aggregate per product so a cart holding the same SKU twice is
        // checked against its combined quantity.
        let mut required: HashMap<ProductId, u32> = HashMap::new();
        for line in &checkout.lines {
            *required.entry(line.product_id.clone()).or_default() += line.quantity;
        }

        for (product_id, quantity) in &required {
            let product = state
                .products
                .get(product_id)
                .ok_or_else(|| StoreError::ProductNotFound(product_id.clone()))?;
            if product.stock_quantity < *quantity as i64 {
                tracing::warn!(
                    product_id = %product_id,
                    requested = *quantity,
                    available = product.stock_quantity,
                    "stock conflict on checkout"
                );
                metrics::counter!("checkout_stock_conflicts_total").increment(1);
                return Err(StoreError::StockConflict {
                    product_id: product_id.clone(),
                    product_name: product.name.clone(),
                    requested: *quantity,
                    available: product.stock_quantity,
                });
            }
        }

        // All lines verified under the same guard; apply the writes.
        let now = Utc::now();
        for (product_id, quantity) in &required {
            let product = state
                .products
                .get_mut(product_id)
                .expect("verified above while holding the write guard");
            product.stock_quantity -= *quantity as i64;
        }

        let sale_id = checkout.sale_id;
        state.sales.insert(
            sale_id,
            SaleRecord {
                id: sale_id,
                user_id: checkout.user_id,
                address: checkout.address.clone(),
                total: checkout.total,
                status: SaleStatus::Pending,
                created_at: now,
            },
        );
        state.payments.insert(
            sale_id,
            PaymentRecord {
                sale_id,
                method: checkout.method,
                reference: None,
                amount: checkout.total,
                status: PaymentStatus::Pending,
            },
        );
        for line in &checkout.lines {
            state.sale_items.push(SaleItemRecord {
                sale_id,
                product_id: line.product_id.clone(),
                quantity: line.quantity,
                unit_price: line.unit_price,
            });
            state.reservations.push(ReservationRecord {
                sale_id,
                product_id: line.product_id.clone(),
                quantity: line.quantity,
                reserved_at: now,
                expires_at: checkout.expires_at,
                status: ReservationStatus::Active,
            });
        }

        tracing::debug!(sale_id = %sale_id, lines = checkout.lines.len(), "checkout created");
        Ok(sale_id)
    }

    async fn get_sale(&self, id: SaleId) -> Result<Option<SaleRecord>> {
        Ok(self.state.read().await.sales.get(&id).cloned())
    }

    async fn get_payment(&self, sale_id: SaleId) -> Result<Option<PaymentRecord>> {
        Ok(self.state.read().await.payments.get(&sale_id).cloned())
    }

    async fn get_sale_items(&self, sale_id: SaleId) -> Result<Vec<SaleItemRecord>> {
        Ok(self
            .state
            .read()
            .await
            .sale_items
            .iter()
            .filter(|i| i.sale_id == sale_id)
            .cloned()
            .collect())
    }

    async fn record_payment_outcome(&self, sale_id: SaleId, outcome: PaymentOutcome) -> Result<()> {
        let mut state = self.state.write().await;
        if !state.sales.contains_key(&sale_id) {
            return Err(StoreError::SaleNotFound(sale_id));
        }

        let (payment_status, sale_status, reference) = match outcome {
            PaymentOutcome::Completed { provider_ref } => (
                PaymentStatus::Completed,
                SaleStatus::Completed,
                Some(provider_ref),
            ),
            PaymentOutcome::Failed => (PaymentStatus::Failed, SaleStatus::Failed, None),
        };

        if let Some(payment) = state.payments.get_mut(&sale_id) {
            payment.status = payment_status;
            if reference.is_some() {
                payment.reference = reference;
            }
        }
        if let Some(sale) = state.sales.get_mut(&sale_id) {
            sale.status = sale_status;
        }
        Ok(())
    }

    async fn commit_reservations(&self, sale_id: SaleId) -> Result<usize> {
        let mut state = self.state.write().await;
        let mut committed = 0;
        for reservation in &mut state.reservations {
            if reservation.sale_id == sale_id && reservation.status == ReservationStatus::Active {
                reservation.status = ReservationStatus::Committed;
                committed += 1;
            }
        }
        Ok(committed)
    }

    async fn release_reservations(
        &self,
        sale_id: SaleId,
        _reason: ReleaseReason,
    ) -> Result<Vec<ReleasedReservation>> {
        let mut state = self.state.write().await;
        let mut released = Vec::new();
        for index in 0..state.reservations.len() {
            if state.reservations[index].sale_id == sale_id
                && state.reservations[index].status == ReservationStatus::Active
            {
                Self::release_one(&mut state, index, &mut released);
            }
        }
        Ok(released)
    }

    async fn release_expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReleasedReservation>> {
        let mut state = self.state.write().await;
        let mut released = Vec::new();
        for index in 0..state.reservations.len() {
            if state.reservations[index].status == ReservationStatus::Active
                && state.reservations[index].expires_at < now
            {
                Self::release_one(&mut state, index, &mut released);
            }
        }
        Ok(released)
    }

    async fn get_reservations(&self, sale_id: SaleId) -> Result<Vec<ReservationRecord>> {
        Ok(self
            .state
            .read()
            .await
            .reservations
            .iter()
            .filter(|r| r.sale_id == sale_id)
            .cloned()
            .collect())
    }

    async fn enqueue_job(&self, job_type: &str, payload: serde_json::Value) -> Result<JobRecord> {
        let job = JobRecord {
            id: JobId::new(),
            job_type: job_type.to_string(),
            payload,
            status: JobStatus::Pending,
            created_at: Utc::now(),
            processed_at: None,
            error_message: None,
        };
        self.state.write().await.jobs.push(job.clone());
        Ok(job)
    }

    async fn claim_next_job(&self) -> Result<Option<JobRecord>> {
        let mut state = self.state.write().await;
        let next = state
            .jobs
            .iter_mut()
            .filter(|j| j.status == JobStatus::Pending)
            .min_by_key(|j| j.created_at);

        Ok(next.map(|job| {
            job.status = JobStatus::Processing;
            job.processed_at = Some(Utc::now());
            job.clone()
        }))
    }

    async fn complete_job(&self, id: JobId) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            job.status = JobStatus::Completed;
        }
        Ok(())
    }

    async fn fail_job(&self, id: JobId, error: &str) -> Result<()> {
        let mut state = self.state.write().await;
        if let Some(job) = state.jobs.iter_mut().find(|j| j.id == id) {
            job.status = JobStatus::Failed;
            job.error_message = Some(error.to_string());
        }
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        Ok(self
            .state
            .read()
            .await
            .jobs
            .iter()
            .find(|j| j.id == id)
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::{CartLine, PaymentMethod};
    use chrono::Duration as ChronoDuration;
    use common::Money;

    fn widget(stock: i64) -> ProductRecord {
        ProductRecord {
            id: ProductId::new("SKU-001"),
            name: "Widget".to_string(),
            price: Money::from_cents(1000),
            stock_quantity: stock,
            active: true,
        }
    }

    fn checkout_for(quantity: u32) -> NewCheckout {
        let line = CartLine {
            product_id: ProductId::new("SKU-001"),
            quantity,
            unit_price: Money::from_cents(1000),
        };
        NewCheckout {
            sale_id: SaleId::new(),
            user_id: None,
            address: "1 Main St".to_string(),
            method: PaymentMethod::Cash,
            total: line.line_total(),
            lines: vec![line],
            expires_at: Utc::now() + ChronoDuration::minutes(5),
        }
    }

    #[tokio::test]
    async fn checkout_decrements_stock_and_creates_records() {
        let store = InMemoryStore::new();
        store.upsert_product(widget(5)).await.unwrap();

        let sale_id = store.create_checkout(checkout_for(2)).await.unwrap();

        let product = store
            .get_product(&ProductId::new("SKU-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 3);

        let sale = store.get_sale(sale_id).await.unwrap().unwrap();
        assert_eq!(sale.status, SaleStatus::Pending);

        let payment = store.get_payment(sale_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Pending);
        assert!(payment.reference.is_none());

        let reservations = store.get_reservations(sale_id).await.unwrap();
        assert_eq!(reservations.len(), 1);
        assert_eq!(reservations[0].status, ReservationStatus::Active);
        assert_eq!(reservations[0].quantity, 2);
    }

    #[tokio::test]
    async fn stock_conflict_leaves_no_partial_writes() {
        let store = InMemoryStore::new();
        store.upsert_product(widget(1)).await.unwrap();

        let checkout = checkout_for(2);
        let sale_id = checkout.sale_id;
        let err = store.create_checkout(checkout).await.unwrap_err();
        assert!(err.is_stock_conflict());

        let product = store
            .get_product(&ProductId::new("SKU-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 1);
        assert!(store.get_sale(sale_id).await.unwrap().is_none());
        assert!(store.get_reservations(sale_id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn concurrent_checkouts_for_the_last_unit_admit_exactly_one() {
        let store = InMemoryStore::new();
        store.upsert_product(widget(1)).await.unwrap();

        let a = tokio::spawn({
            let store = store.clone();
            async move { store.create_checkout(checkout_for(1)).await }
        });
        let b = tokio::spawn({
            let store = store.clone();
            async move { store.create_checkout(checkout_for(1)).await }
        });
        let results = [a.await.unwrap(), b.await.unwrap()];

        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        let loser = results.iter().find(|r| r.is_err()).unwrap();
        assert!(loser.as_ref().unwrap_err().is_stock_conflict());

        let product = store
            .get_product(&ProductId::new("SKU-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 0);
    }

    #[tokio::test]
    async fn duplicate_lines_are_checked_against_combined_quantity() {
        let store = InMemoryStore::new();
        store.upsert_product(widget(3)).await.unwrap();

        let line = CartLine {
            product_id: ProductId::new("SKU-001"),
            quantity: 2,
            unit_price: Money::from_cents(1000),
        };
        let checkout = NewCheckout {
            sale_id: SaleId::new(),
            user_id: None,
            address: "1 Main St".to_string(),
            method: PaymentMethod::Cash,
            total: Money::from_cents(4000),
            lines: vec![line.clone(), line],
            expires_at: Utc::now() + ChronoDuration::minutes(5),
        };

        let err = store.create_checkout(checkout).await.unwrap_err();
        assert!(err.is_stock_conflict());
    }

    #[tokio::test]
    async fn release_restores_stock_and_is_idempotent() {
        let store = InMemoryStore::new();
        store.upsert_product(widget(5)).await.unwrap();
        let sale_id = store.create_checkout(checkout_for(3)).await.unwrap();

        let released = store
            .release_reservations(sale_id, ReleaseReason::PaymentFailed)
            .await
            .unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].quantity, 3);

        let product = store
            .get_product(&ProductId::new("SKU-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 5);

        // Second release finds nothing ACTIVE.
        let released = store
            .release_reservations(sale_id, ReleaseReason::PaymentFailed)
            .await
            .unwrap();
        assert!(released.is_empty());
        let product = store
            .get_product(&ProductId::new("SKU-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 5);
    }

    #[tokio::test]
    async fn commit_keeps_stock_decremented() {
        let store = InMemoryStore::new();
        store.upsert_product(widget(5)).await.unwrap();
        let sale_id = store.create_checkout(checkout_for(2)).await.unwrap();

        assert_eq!(store.commit_reservations(sale_id).await.unwrap(), 1);
        let reservations = store.get_reservations(sale_id).await.unwrap();
        assert_eq!(reservations[0].status, ReservationStatus::Committed);

        // Releasing after commit is a no-op.
        let released = store
            .release_reservations(sale_id, ReleaseReason::TtlExpired)
            .await
            .unwrap();
        assert!(released.is_empty());
        let product = store
            .get_product(&ProductId::new("SKU-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 3);
    }

    #[tokio::test]
    async fn expired_reservations_are_released_by_deadline() {
        let store = InMemoryStore::new();
        store.upsert_product(widget(4)).await.unwrap();
        let sale_id = store.create_checkout(checkout_for(4)).await.unwrap();

        // Not expired yet.
        let released = store
            .release_expired_reservations(Utc::now())
            .await
            .unwrap();
        assert!(released.is_empty());

        // Past the TTL horizon everything comes back.
        let future = Utc::now() + ChronoDuration::minutes(10);
        let released = store.release_expired_reservations(future).await.unwrap();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].sale_id, sale_id);

        let product = store
            .get_product(&ProductId::new("SKU-001"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(product.stock_quantity, 4);
    }

    #[tokio::test]
    async fn payment_outcome_updates_payment_and_sale() {
        let store = InMemoryStore::new();
        store.upsert_product(widget(5)).await.unwrap();
        let sale_id = store.create_checkout(checkout_for(1)).await.unwrap();

        store
            .record_payment_outcome(
                sale_id,
                PaymentOutcome::Completed {
                    provider_ref: "txn_1".to_string(),
                },
            )
            .await
            .unwrap();

        let payment = store.get_payment(sale_id).await.unwrap().unwrap();
        assert_eq!(payment.status, PaymentStatus::Completed);
        assert_eq!(payment.reference.as_deref(), Some("txn_1"));
        let sale = store.get_sale(sale_id).await.unwrap().unwrap();
        assert_eq!(sale.status, SaleStatus::Completed);
    }

    #[tokio::test]
    async fn payment_outcome_for_unknown_sale_errors() {
        let store = InMemoryStore::new();
        let err = store
            .record_payment_outcome(SaleId::new(), PaymentOutcome::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::SaleNotFound(_)));
    }

    #[tokio::test]
    async fn jobs_are_claimed_oldest_first_and_exactly_once() {
        let store = InMemoryStore::new();
        let first = store
            .enqueue_job("finalize_flash_order", serde_json::json!({"n": 1}))
            .await
            .unwrap();
        let second = store
            .enqueue_job("finalize_flash_order", serde_json::json!({"n": 2}))
            .await
            .unwrap();

        let claimed = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(claimed.id, first.id);
        assert_eq!(claimed.status, JobStatus::Processing);

        let claimed = store.claim_next_job().await.unwrap().unwrap();
        assert_eq!(claimed.id, second.id);

        assert!(store.claim_next_job().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn job_completion_and_failure_are_recorded() {
        let store = InMemoryStore::new();
        let job = store
            .enqueue_job("finalize_flash_order", serde_json::json!({}))
            .await
            .unwrap();

        store.claim_next_job().await.unwrap().unwrap();
        store.fail_job(job.id, "gateway exploded").await.unwrap();

        let job = store.get_job(job.id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error_message.as_deref(), Some("gateway exploded"));
    }
}
