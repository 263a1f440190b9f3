//! Shared stores for the checkout core.
//!
//! Two seams live here. [`KeyValueStore`] is the shared counter store that
//! holds circuit breaker state, throttle windows, and idempotency records.
//! [`Store`] is the transactional retail data store holding products, sales,
//! payments, stock reservations, and queued jobs. Both come with a
//! fully-functional in-memory implementation and a PostgreSQL-backed one.

pub mod error;
pub mod kv;
pub mod memory;
pub mod postgres;
pub mod records;
pub mod store;

pub use error::{Result, StoreError};
pub use kv::{InMemoryKeyValueStore, KeyValueStore};
pub use memory::InMemoryStore;
pub use postgres::{PostgresKeyValueStore, PostgresStore};
pub use records::{
    CartLine, FinalizePayload, JOB_FINALIZE_FLASH_ORDER, JobRecord, JobStatus, NewCheckout,
    PaymentMethod, PaymentOutcome, PaymentRecord, PaymentStatus, ProductRecord, ReleaseReason,
    ReleasedReservation, ReservationRecord, ReservationStatus, SaleItemRecord, SaleRecord,
    SaleStatus,
};
pub use store::Store;
