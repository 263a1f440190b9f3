use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{JobId, ProductId, SaleId, UserId};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::records::{
    JobRecord, JobStatus, NewCheckout, PaymentMethod, PaymentOutcome, PaymentRecord, PaymentStatus,
    ProductRecord, ReleaseReason, ReleasedReservation, ReservationRecord, ReservationStatus,
    SaleItemRecord, SaleRecord, SaleStatus,
};
use crate::{KeyValueStore, Result, Store, StoreError};
use common::Money;

/// PostgreSQL-backed retail store.
///
/// The checkout fast path locks product rows with `SELECT ... FOR UPDATE`
/// in stable ID order, and workers claim jobs with `FOR UPDATE SKIP LOCKED`.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

fn corrupt(what: &str, value: &str) -> StoreError {
    StoreError::Serialization(serde_json::Error::io(std::io::Error::other(format!(
        "unrecognized {what}: {value}"
    ))))
}

fn row_to_sale(row: PgRow) -> Result<SaleRecord> {
    let status: String = row.try_get("status")?;
    Ok(SaleRecord {
        id: SaleId::from_uuid(row.try_get::<Uuid, _>("id")?),
        user_id: row
            .try_get::<Option<Uuid>, _>("user_id")?
            .map(UserId::from_uuid),
        address: row.try_get("address")?,
        total: Money::from_cents(row.try_get("total_cents")?),
        status: SaleStatus::parse(&status).ok_or_else(|| corrupt("sale status", &status))?,
        created_at: row.try_get("created_at")?,
    })
}

fn row_to_payment(row: PgRow) -> Result<PaymentRecord> {
    let status: String = row.try_get("status")?;
    let method: String = row.try_get("method")?;
    Ok(PaymentRecord {
        sale_id: SaleId::from_uuid(row.try_get::<Uuid, _>("sale_id")?),
        method: PaymentMethod::parse(&method).ok_or_else(|| corrupt("payment method", &method))?,
        reference: row.try_get("reference")?,
        amount: Money::from_cents(row.try_get("amount_cents")?),
        status: PaymentStatus::parse(&status).ok_or_else(|| corrupt("payment status", &status))?,
    })
}

fn row_to_reservation(row: PgRow) -> Result<ReservationRecord> {
    let status: String = row.try_get("status")?;
    Ok(ReservationRecord {
        sale_id: SaleId::from_uuid(row.try_get::<Uuid, _>("sale_id")?),
        product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
        quantity: row.try_get::<i32, _>("quantity")? as u32,
        reserved_at: row.try_get("reserved_at")?,
        expires_at: row.try_get("expires_at")?,
        status: ReservationStatus::parse(&status)
            .ok_or_else(|| corrupt("reservation status", &status))?,
    })
}

fn row_to_job(row: PgRow) -> Result<JobRecord> {
    let status: String = row.try_get("status")?;
    Ok(JobRecord {
        id: JobId::from_uuid(row.try_get::<Uuid, _>("id")?),
        job_type: row.try_get("job_type")?,
        payload: row.try_get("payload")?,
        status: JobStatus::parse(&status).ok_or_else(|| corrupt("job status", &status))?,
        created_at: row.try_get("created_at")?,
        processed_at: row.try_get("processed_at")?,
        error_message: row.try_get("error_message")?,
    })
}

impl PostgresStore {
    /// Creates a new PostgreSQL store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    async fn release_where(
        &self,
        filter_sql: &str,
        bind_uuid: Option<Uuid>,
        bind_time: Option<DateTime<Utc>>,
    ) -> Result<Vec<ReleasedReservation>> {
        let mut tx = self.pool.begin().await?;

        let select = format!(
            "SELECT id, sale_id, product_id, quantity FROM stock_reservations \
             WHERE status = 'ACTIVE' AND {filter_sql} ORDER BY id FOR UPDATE"
        );
        let mut query = sqlx::query(&select);
        if let Some(uuid) = bind_uuid {
            query = query.bind(uuid);
        }
        if let Some(time) = bind_time {
            query = query.bind(time);
        }
        let rows = query.fetch_all(&mut *tx).await?;

        let mut released = Vec::with_capacity(rows.len());
        for row in rows {
            let reservation_id: i64 = row.try_get("id")?;
            let sale_id = SaleId::from_uuid(row.try_get::<Uuid, _>("sale_id")?);
            let product_id: String = row.try_get("product_id")?;
            let quantity: i32 = row.try_get("quantity")?;

            sqlx::query(
                "UPDATE products SET stock_quantity = stock_quantity + $1 WHERE id = $2",
            )
            .bind(quantity as i64)
            .bind(&product_id)
            .execute(&mut *tx)
            .await?;

            sqlx::query("UPDATE stock_reservations SET status = 'RELEASED' WHERE id = $1")
                .bind(reservation_id)
                .execute(&mut *tx)
                .await?;

            released.push(ReleasedReservation {
                sale_id,
                product_id: ProductId::new(product_id),
                quantity: quantity as u32,
            });
        }

        tx.commit().await?;
        Ok(released)
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn upsert_product(&self, product: ProductRecord) -> Result<()> {
        sqlx::query(
            "INSERT INTO products (id, name, price_cents, stock_quantity, active) \
             VALUES ($1, $2, $3, $4, $5) \
             ON CONFLICT (id) DO UPDATE SET \
               name = EXCLUDED.name, price_cents = EXCLUDED.price_cents, \
               stock_quantity = EXCLUDED.stock_quantity, active = EXCLUDED.active",
        )
        .bind(product.id.as_str())
        .bind(&product.name)
        .bind(product.price.cents())
        .bind(product.stock_quantity)
        .bind(product.active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_product(&self, id: &ProductId) -> Result<Option<ProductRecord>> {
        let row = sqlx::query(
            "SELECT id, name, price_cents, stock_quantity, active FROM products WHERE id = $1",
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok(ProductRecord {
                id: ProductId::new(row.try_get::<String, _>("id")?),
                name: row.try_get("name")?,
                price: Money::from_cents(row.try_get("price_cents")?),
                stock_quantity: row.try_get("stock_quantity")?,
                active: row.try_get("active")?,
            })
        })
        .transpose()
    }

    async fn create_checkout(&self, checkout: NewCheckout) -> Result<SaleId> {
        // BTreeMap keeps the lock acquisition order stable across
        // concurrent checkouts, so two carts holding the same pair of
        // products cannot deadlock each other.
        let mut required: BTreeMap<String, u32> = BTreeMap::new();
        for line in &checkout.lines {
            *required
                .entry(line.product_id.as_str().to_string())
                .or_default() += line.quantity;
        }

        let mut tx = self.pool.begin().await?;

        for (product_id, quantity) in &required {
            let row = sqlx::query(
                "SELECT name, stock_quantity FROM products WHERE id = $1 FOR UPDATE",
            )
            .bind(product_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| StoreError::ProductNotFound(ProductId::new(product_id.clone())))?;

            let name: String = row.try_get("name")?;
            let available: i64 = row.try_get("stock_quantity")?;
            if available < *quantity as i64 {
                tracing::warn!(
                    product_id = %product_id,
                    requested = *quantity,
                    available,
                    "stock conflict on checkout"
                );
                metrics::counter!("checkout_stock_conflicts_total").increment(1);
                // Dropping the transaction rolls everything back.
                return Err(StoreError::StockConflict {
                    product_id: ProductId::new(product_id.clone()),
                    product_name: name,
                    requested: *quantity,
                    available,
                });
            }

            sqlx::query(
                "UPDATE products SET stock_quantity = stock_quantity - $1 WHERE id = $2",
            )
            .bind(*quantity as i64)
            .bind(product_id)
            .execute(&mut *tx)
            .await?;
        }

        let sale_id = checkout.sale_id;
        sqlx::query(
            "INSERT INTO sales (id, user_id, address, total_cents, status) \
             VALUES ($1, $2, $3, $4, 'PENDING')",
        )
        .bind(sale_id.as_uuid())
        .bind(checkout.user_id.map(|u| u.as_uuid()))
        .bind(&checkout.address)
        .bind(checkout.total.cents())
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO payments (sale_id, method, reference, amount_cents, status) \
             VALUES ($1, $2, NULL, $3, 'PENDING')",
        )
        .bind(sale_id.as_uuid())
        .bind(checkout.method.as_str())
        .bind(checkout.total.cents())
        .execute(&mut *tx)
        .await?;

        for line in &checkout.lines {
            sqlx::query(
                "INSERT INTO sale_items (sale_id, product_id, quantity, unit_price_cents) \
                 VALUES ($1, $2, $3, $4)",
            )
            .bind(sale_id.as_uuid())
            .bind(line.product_id.as_str())
            .bind(line.quantity as i32)
            .bind(line.unit_price.cents())
            .execute(&mut *tx)
            .await?;

            sqlx::query(
                "INSERT INTO stock_reservations (sale_id, product_id, quantity, expires_at, status) \
                 VALUES ($1, $2, $3, $4, 'ACTIVE')",
            )
            .bind(sale_id.as_uuid())
            .bind(line.product_id.as_str())
            .bind(line.quantity as i32)
            .bind(checkout.expires_at)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        tracing::debug!(sale_id = %sale_id, lines = checkout.lines.len(), "checkout created");
        Ok(sale_id)
    }

    async fn get_sale(&self, id: SaleId) -> Result<Option<SaleRecord>> {
        let row = sqlx::query(
            "SELECT id, user_id, address, total_cents, status, created_at FROM sales WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_sale).transpose()
    }

    async fn get_payment(&self, sale_id: SaleId) -> Result<Option<PaymentRecord>> {
        let row = sqlx::query(
            "SELECT sale_id, method, reference, amount_cents, status FROM payments \
             WHERE sale_id = $1",
        )
        .bind(sale_id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_payment).transpose()
    }

    async fn get_sale_items(&self, sale_id: SaleId) -> Result<Vec<SaleItemRecord>> {
        let rows = sqlx::query(
            "SELECT product_id, quantity, unit_price_cents FROM sale_items \
             WHERE sale_id = $1 ORDER BY id",
        )
        .bind(sale_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                Ok(SaleItemRecord {
                    sale_id,
                    product_id: ProductId::new(row.try_get::<String, _>("product_id")?),
                    quantity: row.try_get::<i32, _>("quantity")? as u32,
                    unit_price: Money::from_cents(row.try_get("unit_price_cents")?),
                })
            })
            .collect()
    }

    async fn record_payment_outcome(&self, sale_id: SaleId, outcome: PaymentOutcome) -> Result<()> {
        let (payment_status, sale_status, reference) = match outcome {
            PaymentOutcome::Completed { provider_ref } => {
                ("COMPLETED", "COMPLETED", Some(provider_ref))
            }
            PaymentOutcome::Failed => ("FAILED", "FAILED", None),
        };

        let mut tx = self.pool.begin().await?;

        let updated = sqlx::query("UPDATE sales SET status = $1 WHERE id = $2")
            .bind(sale_status)
            .bind(sale_id.as_uuid())
            .execute(&mut *tx)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(StoreError::SaleNotFound(sale_id));
        }

        sqlx::query(
            "UPDATE payments SET status = $1, reference = COALESCE($2, reference) \
             WHERE sale_id = $3",
        )
        .bind(payment_status)
        .bind(reference)
        .bind(sale_id.as_uuid())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn commit_reservations(&self, sale_id: SaleId) -> Result<usize> {
        let updated = sqlx::query(
            "UPDATE stock_reservations SET status = 'COMMITTED' \
             WHERE sale_id = $1 AND status = 'ACTIVE'",
        )
        .bind(sale_id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(updated.rows_affected() as usize)
    }

    async fn release_reservations(
        &self,
        sale_id: SaleId,
        _reason: ReleaseReason,
    ) -> Result<Vec<ReleasedReservation>> {
        self.release_where("sale_id = $1", Some(sale_id.as_uuid()), None)
            .await
    }

    async fn release_expired_reservations(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<ReleasedReservation>> {
        self.release_where("expires_at < $1", None, Some(now)).await
    }

    async fn get_reservations(&self, sale_id: SaleId) -> Result<Vec<ReservationRecord>> {
        let rows = sqlx::query(
            "SELECT sale_id, product_id, quantity, reserved_at, expires_at, status \
             FROM stock_reservations WHERE sale_id = $1 ORDER BY id",
        )
        .bind(sale_id.as_uuid())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_reservation).collect()
    }

    async fn enqueue_job(&self, job_type: &str, payload: serde_json::Value) -> Result<JobRecord> {
        let id = JobId::new();
        let row = sqlx::query(
            "INSERT INTO queued_jobs (id, job_type, payload, status) \
             VALUES ($1, $2, $3, 'PENDING') \
             RETURNING id, job_type, payload, status, created_at, processed_at, error_message",
        )
        .bind(id.as_uuid())
        .bind(job_type)
        .bind(payload)
        .fetch_one(&self.pool)
        .await?;
        row_to_job(row)
    }

    async fn claim_next_job(&self) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            "UPDATE queued_jobs SET status = 'PROCESSING', processed_at = now() \
             WHERE id = (SELECT id FROM queued_jobs WHERE status = 'PENDING' \
                         ORDER BY created_at LIMIT 1 FOR UPDATE SKIP LOCKED) \
             RETURNING id, job_type, payload, status, created_at, processed_at, error_message",
        )
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_job).transpose()
    }

    async fn complete_job(&self, id: JobId) -> Result<()> {
        sqlx::query("UPDATE queued_jobs SET status = 'COMPLETED' WHERE id = $1")
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn fail_job(&self, id: JobId, error: &str) -> Result<()> {
        sqlx::query("UPDATE queued_jobs SET status = 'FAILED', error_message = $1 WHERE id = $2")
            .bind(error)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn get_job(&self, id: JobId) -> Result<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT id, job_type, payload, status, created_at, processed_at, error_message \
             FROM queued_jobs WHERE id = $1",
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;
        row.map(row_to_job).transpose()
    }
}

/// PostgreSQL-backed key-value store.
///
/// Gives multi-process deployments one shared counter store, so breaker
/// state and throttle windows stay consistent across API and worker
/// processes. Expiry is enforced on read; [`purge_expired`] only reclaims
/// dead rows.
///
/// [`purge_expired`]: PostgresKeyValueStore::purge_expired
#[derive(Clone)]
pub struct PostgresKeyValueStore {
    pool: PgPool,
}

impl PostgresKeyValueStore {
    /// Creates a new PostgreSQL key-value store.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|t| Utc::now() + chrono::TimeDelta::milliseconds(t.as_millis() as i64))
    }

    /// Deletes rows past their expiry. Returns how many were removed.
    pub async fn purge_expired(&self) -> Result<u64> {
        let deleted = sqlx::query(
            "DELETE FROM kv_entries WHERE expires_at IS NOT NULL AND expires_at <= now()",
        )
        .execute(&self.pool)
        .await?;
        Ok(deleted.rows_affected())
    }
}

#[async_trait]
impl KeyValueStore for PostgresKeyValueStore {
    async fn get(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            "SELECT value FROM kv_entries \
             WHERE key = $1 AND (expires_at IS NULL OR expires_at > now())",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|row| Ok(row.try_get("value")?)).transpose()
    }

    async fn set(&self, key: &str, value: serde_json::Value, ttl: Option<Duration>) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) VALUES ($1, $2, $3) \
             ON CONFLICT (key) DO UPDATE \
               SET value = EXCLUDED.value, expires_at = EXCLUDED.expires_at",
        )
        .bind(key)
        .bind(value)
        .bind(Self::expiry(ttl))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn increment(&self, key: &str, delta: i64, ttl: Option<Duration>) -> Result<i64> {
        // The upsert restarts the count when the existing row has expired,
        // matching the read-side expiry rule.
        let row = sqlx::query(
            "INSERT INTO kv_entries (key, value, expires_at) \
             VALUES ($1, to_jsonb($2::bigint), $3) \
             ON CONFLICT (key) DO UPDATE SET \
               value = to_jsonb(CASE \
                 WHEN kv_entries.expires_at IS NOT NULL AND kv_entries.expires_at <= now() \
                   THEN $2::bigint \
                 ELSE COALESCE((kv_entries.value #>> '{}')::bigint, 0) + $2::bigint \
               END), \
               expires_at = $3 \
             RETURNING (value #>> '{}')::bigint AS value",
        )
        .bind(key)
        .bind(delta)
        .bind(Self::expiry(ttl))
        .fetch_one(&self.pool)
        .await?;
        Ok(row.try_get("value")?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv_entries WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
