//! Idempotent persistence for bills and their line items.
//!
//! `BillDatabase` is the contract every backend implements. The
//! production backend is [`PgBillDatabase`]; [`MemBillDatabase`] backs
//! tests and `--in-memory` local runs.

mod mem;
mod postgres;

pub use mem::MemBillDatabase;
pub use postgres::PgBillDatabase;

use async_trait::async_trait;
use domain::{BillId, BillInfo, BillInfoAndMetadata, BillLineItem};
use money::TotalAmount;

/// Errors a `BillDatabase` backend may return. `rows_affected == 0`
/// without an `Err` is the idempotency signal callers rely on — it is
/// not represented as an error.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("bill not found")]
    BillNotFound,
    #[error("bill already exists")]
    BillAlreadyExists,
    #[error("line item already exists")]
    LineItemAlreadyExists,
    #[error("bill is closed")]
    BillClosed,
    #[error("bill and line item mismatch")]
    BillMismatch,
    #[error("bill and line item have mismatched currency code")]
    CurrencyMismatch,
    #[error("transient database error: {0}")]
    Transient(String),
}

impl From<sqlx::Error> for Error {
    fn from(err: sqlx::Error) -> Self {
        Error::Transient(err.to_string())
    }
}

impl Error {
    /// Whether this failure is worth retrying (§7 "Transient" errors).
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Transient(_))
    }
}

/// Idempotent persistence operations on bills and line items. All
/// operations are safe to retry: re-submitting an operation that
/// already succeeded returns `rows_affected == 0` rather than an error.
#[async_trait]
pub trait BillDatabase: Send + Sync {
    /// Insert the bill if absent. Returns 1 if inserted, 0 if it
    /// already existed with this key (never errors on a re-run).
    async fn create_bill(&self, bill: BillInfo) -> Result<u64, Error>;

    /// Atomically: verify the bill exists, is open, and matches the
    /// item's currency; insert the item if absent; and persist
    /// `total_after` as the bill's new running total. Returns 1 if the
    /// item was newly inserted, 0 if it already existed.
    async fn add_line_item(
        &self,
        line_item: BillLineItem,
        total_after: TotalAmount,
    ) -> Result<u64, Error>;

    /// Mark a bill closed. Returns 1 if it transitioned, fails with
    /// `BillNotFound` if the bill does not exist.
    async fn close_bill(&self, bill_id: BillId) -> Result<u64, Error>;

    /// Read a bill's current info and aggregate metadata.
    async fn get_bill(&self, bill_id: BillId) -> Result<BillInfoAndMetadata, Error>;
}
