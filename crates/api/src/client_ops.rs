//! The four client-facing operations, independent of transport. The
//! HTTP router in [`crate::http`] is a thin adapter over these.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use db::BillDatabase;
use domain::{
    BillId, BillIdGenerator, BillInfo, BillInfoAndMetadata, BillLineItem, BillLineItemId,
    BillStatus, CustomerId,
};
use host::Host;
use money::{Amount, CurrencyCode};
use workflow::{UpdateRequest, UpdateResult};

use crate::Error;

/// How many times `open_new_bill` polls for the workflow to have run
/// its `CreateBill` activity before giving up and reporting the open
/// as having timed out (it may still complete in the background).
const START_POLL_ATTEMPTS: usize = 10;
const START_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Open a new bill maturing at `close_time`. Fails fast if `close_time`
/// is already in the past.
pub async fn open_new_bill(
    host: &dyn Host,
    id_generator: &dyn BillIdGenerator,
    customer_id: CustomerId,
    currency_code: CurrencyCode,
    close_time: DateTime<Utc>,
) -> Result<BillInfo, Error> {
    let bill_id = BillId {
        customer_id,
        id: id_generator.new_id(),
    };
    let bill_info = BillInfo {
        id: bill_id.clone(),
        currency_code,
        status: BillStatus::Open,
    };
    let duration_secs = (close_time - Utc::now()).num_seconds();
    let workflow_id = workflow::workflow_id(&bill_id);

    host.start_workflow(workflow_id.clone(), bill_info.clone(), duration_secs)
        .await
        .map_err(Error::Host)?;

    for attempt in 0..START_POLL_ATTEMPTS {
        match host.query_state(&workflow_id).await {
            Ok(_) => return Ok(bill_info),
            Err(_) if attempt + 1 < START_POLL_ATTEMPTS => {
                tokio::time::sleep(START_POLL_INTERVAL).await;
            }
            // Retries exhausted: the workflow may still come up in the
            // background, but this call can no longer confirm it did.
            Err(_) => return Err(Error::StartUnconfirmed),
        }
    }
    unreachable!("loop always returns before exhausting its attempts")
}

/// Add a line item to an open bill. `update_id` makes the call safe to
/// retry: resubmitting the same id returns the first attempt's outcome.
pub async fn add_bill_line_item(
    host: &dyn Host,
    bill_id: BillId,
    update_id: String,
    item_id: String,
    description: String,
    amount: Amount,
) -> Result<BillInfoAndMetadata, Error> {
    let workflow_id = workflow::workflow_id(&bill_id);
    let request = UpdateRequest {
        update_id,
        item: BillLineItem {
            id: BillLineItemId {
                bill_id: bill_id.clone(),
                id: item_id,
            },
            description,
            amount,
        },
    };

    match host
        .update_add_line_item(&workflow_id, request)
        .await
        .map_err(Error::Host)?
    {
        UpdateResult::Accepted(state) => Ok(BillInfoAndMetadata {
            bill_info: state.bill_info,
            line_item_count: state.line_item_count,
            total_amount: state.total.total,
            total_ok: state.total.ok,
        }),
        UpdateResult::Rejected(e) => Err(Error::Validation(e)),
        UpdateResult::ActivityFailed(message) => Err(Error::ActivityFailed(message)),
    }
}

/// Close a bill ahead of its scheduled maturity and wait for the
/// workflow to run to completion.
pub async fn close_bill(host: &dyn Host, bill_id: BillId, reason: String) -> Result<BillInfoAndMetadata, Error> {
    let workflow_id = workflow::workflow_id(&bill_id);
    host.signal_close(&workflow_id, reason)
        .await
        .map_err(Error::Host)?;
    let state = host.await_completion(&workflow_id).await.map_err(Error::Host)?;
    Ok(BillInfoAndMetadata {
        bill_info: state.bill_info,
        line_item_count: state.line_item_count,
        total_amount: state.total.total,
        total_ok: state.total.ok,
    })
}

/// Read a bill, preferring the live workflow's query (current for an
/// open bill) and falling back to the database (authoritative once the
/// workflow has completed, or if no instance is running for it, e.g.
/// after a worker restart). The lookup is always scoped to the caller's
/// own customer id via `bill_id.customer_id`.
pub async fn get_bill(
    host: &dyn Host,
    db: &Arc<dyn BillDatabase>,
    bill_id: BillId,
) -> Result<BillInfoAndMetadata, Error> {
    let workflow_id = workflow::workflow_id(&bill_id);
    match host.query_state(&workflow_id).await {
        // `workflow_id` is derived from the bare bill id, with no
        // customer scoping, so any customer can address any other
        // customer's live workflow by guessing or learning its id.
        // The DB path below is safe because `BillDatabase::get_bill`
        // is keyed by `(customer_id, id)`; this path has to check
        // explicitly instead.
        Ok(state) if state.bill_info.id.customer_id != bill_id.customer_id => {
            Err(Error::CustomerMismatch)
        }
        Ok(state) => Ok(BillInfoAndMetadata {
            bill_info: state.bill_info,
            line_item_count: state.line_item_count,
            total_amount: state.total.total,
            total_ok: state.total.ok,
        }),
        Err(_) => db.get_bill(bill_id).await.map_err(Error::Database),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemBillDatabase;
    use domain::UuidBillIdGenerator;
    use host::LocalHost;

    fn host_and_db() -> (LocalHost, Arc<dyn BillDatabase>) {
        let db: Arc<dyn BillDatabase> = Arc::new(MemBillDatabase::new());
        let host = LocalHost::new(Arc::clone(&db), activities::RetryPolicy::default());
        (host, db)
    }

    #[tokio::test(start_paused = true)]
    async fn open_add_and_get_round_trips_through_the_workflow() {
        let (host, db) = host_and_db();
        let id_gen = UuidBillIdGenerator;

        let bill_info = open_new_bill(
            &host,
            &id_gen,
            CustomerId::new("alice"),
            CurrencyCode::new("USD"),
            Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .unwrap();

        let metadata = add_bill_line_item(
            &host,
            bill_info.id.clone(),
            "update-1".into(),
            "item-1".into(),
            "widget".into(),
            Amount::new(500, CurrencyCode::new("USD")).unwrap(),
        )
        .await
        .unwrap();
        assert_eq!(metadata.line_item_count, 1);

        let fetched = get_bill(&host, &db, bill_info.id.clone()).await.unwrap();
        assert_eq!(fetched.line_item_count, 1);
        assert_eq!(fetched.total_amount.number, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn get_bill_falls_back_to_the_database_once_closed() {
        let (host, db) = host_and_db();
        let id_gen = UuidBillIdGenerator;

        let bill_info = open_new_bill(
            &host,
            &id_gen,
            CustomerId::new("alice"),
            CurrencyCode::new("USD"),
            Utc::now() + chrono::Duration::hours(1),
        )
        .await
        .unwrap();

        close_bill(&host, bill_info.id.clone(), "done".into())
            .await
            .unwrap();

        let fetched = get_bill(&host, &db, bill_info.id).await.unwrap();
        assert_eq!(fetched.bill_info.status, BillStatus::Closed);
    }
}
