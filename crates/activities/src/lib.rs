//! Activities: the retryable, deterministic-in-arguments wrappers the
//! workflow uses to reach the database. Each of the three activities
//! maps 1:1 onto a `BillDatabase` operation.
//!
//! The substrate applies a retry policy around each call (initial
//! interval 1s, backoff ×2, capped at 10s, 10 attempts max) and a
//! per-call `StartToClose` deadline. Only [`db::Error::is_transient`]
//! failures are retried; validation/conflict errors fail the activity
//! immediately (§7's propagation policy).

use std::sync::Arc;
use std::time::Duration;

use db::{BillDatabase, Error};
use domain::{BillId, BillInfo, BillLineItem};
use money::TotalAmount;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

/// Retry and timeout policy applied around every activity call.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    pub initial_interval: Duration,
    pub backoff_coefficient: u32,
    pub max_interval: Duration,
    pub max_attempts: usize,
    pub start_to_close: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(1),
            backoff_coefficient: 2,
            max_interval: Duration::from_secs(10),
            max_attempts: 10,
            start_to_close: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    fn strategy(&self) -> impl Iterator<Item = Duration> {
        ExponentialBackoff::from_millis(self.backoff_coefficient as u64)
            .factor(self.initial_interval.as_millis() as u64)
            .max_delay(self.max_interval)
            .map(jitter)
            .take(self.max_attempts.saturating_sub(1))
    }
}

async fn with_retry<T, F, Fut>(policy: &RetryPolicy, mut call: F) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, Error>>,
{
    RetryIf::spawn(
        policy.strategy(),
        || async {
            match tokio::time::timeout(policy.start_to_close, call()).await {
                Ok(result) => result,
                Err(_elapsed) => Err(Error::Transient("activity timed out".to_string())),
            }
        },
        |err: &Error| err.is_transient(),
    )
    .await
}

/// Create the bill if it does not already exist. Returns the number of
/// rows newly inserted (0 or 1).
pub async fn create_bill_if_not_exist(
    db: &Arc<dyn BillDatabase>,
    policy: &RetryPolicy,
    bill: BillInfo,
) -> Result<u64, Error> {
    tracing::info!(bill_id = %bill.id.id, "activity: create bill if not exist");
    with_retry(policy, || {
        let db = Arc::clone(db);
        let bill = bill.clone();
        async move { db.create_bill(bill).await }
    })
    .await
}

/// Insert the line item if it does not already exist, persisting
/// `total_after` as the bill's new running total. Returns the number
/// of rows newly inserted (0 or 1).
pub async fn add_bill_line_item_if_not_exist(
    db: &Arc<dyn BillDatabase>,
    policy: &RetryPolicy,
    line_item: BillLineItem,
    total_after: TotalAmount,
) -> Result<u64, Error> {
    tracing::info!(
        bill_id = %line_item.id.bill_id.id,
        item_id = %line_item.id.id,
        "activity: add bill line item if not exist"
    );
    with_retry(policy, || {
        let db = Arc::clone(db);
        let line_item = line_item.clone();
        async move { db.add_line_item(line_item, total_after).await }
    })
    .await
}

/// Mark the bill closed. Returns the number of rows transitioned (0 or 1).
pub async fn close_bill(
    db: &Arc<dyn BillDatabase>,
    policy: &RetryPolicy,
    bill_id: BillId,
) -> Result<u64, Error> {
    tracing::info!(bill_id = %bill_id.id, "activity: close bill");
    with_retry(policy, || {
        let db = Arc::clone(db);
        let bill_id = bill_id.clone();
        async move { db.close_bill(bill_id).await }
    })
    .await
}
