//! The durable per-bill billing workflow: the core of this system.
//!
//! [`run`] is the workflow body. It is meant to be driven by a host as
//! a single long-lived task (see the `host` crate) — within `run`,
//! everything is sequential and deterministic between `.await` points,
//! matching the "single logical thread" model a durable-execution
//! substrate provides.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use activities::RetryPolicy;
use db::BillDatabase;
use domain::{BillId, BillInfo, BillLineItem, BillingState};
use tokio::sync::{mpsc, oneshot};

/// Errors that can end the workflow itself (as opposed to a single
/// update, which fails without ending the workflow).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("duration is negative: {0} seconds")]
    NegativeDuration(i64),
    #[error("activity failed: {0}")]
    Activity(#[from] db::Error),
}

/// A request to add a line item, submitted with a caller-chosen update
/// id so retries over an unreliable transport are safe.
#[derive(Clone, Debug)]
pub struct UpdateRequest {
    pub update_id: String,
    pub item: BillLineItem,
}

/// The outcome of a single `AddBillLineItem` update.
#[derive(Clone, Debug)]
pub enum UpdateResult {
    /// The update was accepted (possibly a no-op replay); here is the
    /// post-update state.
    Accepted(BillingState),
    /// The validator rejected the update; state is unchanged.
    Rejected(domain::Error),
    /// The activity failed after exhausting retries; state is
    /// unchanged beyond what earlier successful attempts may have
    /// done (which idempotency reconciles).
    ActivityFailed(String),
}

/// Messages the host dispatches into a running workflow instance.
pub enum WorkflowMessage {
    /// `GetPendingBillState`: synchronous, side-effect-free state read.
    Query(oneshot::Sender<BillingState>),
    /// `AddBillLineItem`: validate then (at most once per update id) execute.
    Update(UpdateRequest, oneshot::Sender<UpdateResult>),
}

/// Run the billing workflow to completion.
///
/// Returns the terminal `BillingState` alongside an error if the
/// workflow failed to progress (a negative duration, or an activity
/// failure in `CreateBill`/`CloseBill`). A failed *update* never
/// appears here — it resolves through its own reply channel while the
/// workflow keeps running.
pub async fn run(
    bill_info: BillInfo,
    duration_secs: i64,
    mut messages: mpsc::Receiver<WorkflowMessage>,
    mut close_signal: mpsc::Receiver<String>,
    db: Arc<dyn BillDatabase>,
    retry_policy: RetryPolicy,
) -> (BillingState, Result<(), Error>) {
    let mut state = BillingState::new(bill_info.clone());

    if duration_secs < 0 {
        return (state, Err(Error::NegativeDuration(duration_secs)));
    }

    tracing::info!(bill_id = %bill_info.id.id, duration_secs, "bill line items workflow started");

    if let Err(e) = activities::create_bill_if_not_exist(&db, &retry_policy, bill_info.clone()).await
    {
        return (state, Err(Error::Activity(e)));
    }

    let mut completed_updates: HashMap<String, UpdateResult> = HashMap::new();
    let sleep = tokio::time::sleep(Duration::from_secs(duration_secs as u64));
    tokio::pin!(sleep);

    let mut messages_open = true;
    let mut close_signal_open = true;
    loop {
        tokio::select! {
            biased;

            _ = &mut sleep => {
                tracing::info!(bill_id = %bill_info.id.id, "bill arrived at maturity, closing");
                break;
            }

            reason = close_signal.recv(), if close_signal_open => {
                match reason {
                    Some(reason) => {
                        tracing::info!(bill_id = %bill_info.id.id, reason, "received signal to close bill early");
                        break;
                    }
                    None => close_signal_open = false,
                }
            }

            message = messages.recv(), if messages_open => {
                match message {
                    Some(message) => {
                        handle_message(message, &mut state, &bill_info, &db, &retry_policy, &mut completed_updates).await;
                    }
                    None => messages_open = false,
                }
            }
        }
    }

    let close_result =
        activities::close_bill(&db, &retry_policy, bill_info.id.clone()).await;

    // Anything that arrived while `close_bill` was in flight is still
    // sitting in the channel. Drain it here instead of letting `messages`
    // (and any `oneshot::Sender`s queued with it) drop silently on
    // return — each such update now runs against an already-closed bill
    // and gets a real answer (`BillClosed`) instead of a dropped sender.
    while let Ok(message) = messages.try_recv() {
        handle_message(message, &mut state, &bill_info, &db, &retry_policy, &mut completed_updates)
            .await;
    }

    match close_result {
        Ok(_) => {
            state.bill_info.status = domain::BillStatus::Closed;
            tracing::info!(bill_id = %bill_info.id.id, count = state.line_item_count, "bill closed");
            (state, Ok(()))
        }
        Err(e) => (state, Err(Error::Activity(e))),
    }
}

async fn handle_message(
    message: WorkflowMessage,
    state: &mut BillingState,
    bill_info: &BillInfo,
    db: &Arc<dyn BillDatabase>,
    retry_policy: &RetryPolicy,
    completed_updates: &mut HashMap<String, UpdateResult>,
) {
    match message {
        WorkflowMessage::Query(reply) => {
            // Queries never suspend on anything but reading the record,
            // and never return a live reference to caller-owned memory.
            let _ = reply.send(state.clone());
        }
        WorkflowMessage::Update(request, reply) => {
            let result =
                handle_update(request, state, bill_info, db, retry_policy, completed_updates)
                    .await;
            let _ = reply.send(result);
        }
    }
}

async fn handle_update(
    request: UpdateRequest,
    state: &mut BillingState,
    bill_info: &BillInfo,
    db: &Arc<dyn BillDatabase>,
    retry_policy: &RetryPolicy,
    completed_updates: &mut HashMap<String, UpdateResult>,
) -> UpdateResult {
    // The validator runs on every attempt, including duplicates of an
    // already-completed update id, and never mutates state.
    if let Err(e) = bill_info.check_line_item_compatible(&request.item) {
        return UpdateResult::Rejected(e);
    }

    if let Some(cached) = completed_updates.get(&request.update_id) {
        return cached.clone();
    }

    tracing::info!(
        bill_id = %bill_info.id.id,
        item_id = %request.item.id.id,
        update_id = %request.update_id,
        "adding bill line item if it does not exist"
    );

    let result = activities::add_bill_line_item_if_not_exist(
        db,
        retry_policy,
        request.item.clone(),
        {
            let mut total = state.total.clone();
            total.add(&request.item.amount);
            total
        },
    )
    .await;

    let outcome = match result {
        Ok(update_count) => {
            if update_count > 0 {
                state.line_item_count += update_count;
                state.total.add(&request.item.amount);
                tracing::info!(
                    bill_id = %bill_info.id.id,
                    total = ?state.total,
                    "bill line item added"
                );
            }
            UpdateResult::Accepted(state.clone())
        }
        Err(e) => UpdateResult::ActivityFailed(e.to_string()),
    };

    completed_updates.insert(request.update_id.clone(), outcome.clone());
    outcome
}

/// Construct the workflow id a host uses to address a bill's instance.
pub fn workflow_id(bill_id: &BillId) -> String {
    format!("create-bill-{}", bill_id.id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use db::MemBillDatabase;
    use domain::{BillLineItemId, BillStatus, CustomerId};
    use money::{Amount, CurrencyCode};

    fn bill_info() -> BillInfo {
        BillInfo {
            id: BillId {
                customer_id: CustomerId::new("alice"),
                id: "bill-1".into(),
            },
            currency_code: CurrencyCode::new("USD"),
            status: BillStatus::Open,
        }
    }

    fn line_item(id: &str, cents: i64) -> BillLineItem {
        BillLineItem {
            id: BillLineItemId {
                bill_id: bill_info().id,
                id: id.into(),
            },
            description: "widget".into(),
            amount: Amount::new(cents, CurrencyCode::new("USD")).unwrap(),
        }
    }

    fn harness() -> (
        Arc<dyn BillDatabase>,
        mpsc::Sender<WorkflowMessage>,
        mpsc::Receiver<WorkflowMessage>,
        mpsc::Sender<String>,
        mpsc::Receiver<String>,
    ) {
        let db: Arc<dyn BillDatabase> = Arc::new(MemBillDatabase::new());
        let (msg_tx, msg_rx) = mpsc::channel(8);
        let (close_tx, close_rx) = mpsc::channel(1);
        (db, msg_tx, msg_rx, close_tx, close_rx)
    }

    #[tokio::test(start_paused = true)]
    async fn negative_duration_fails_before_any_activity() {
        let (db, _msg_tx, msg_rx, _close_tx, close_rx) = harness();
        let (state, result) = run(
            bill_info(),
            -1,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        )
        .await;

        assert!(matches!(result, Err(Error::NegativeDuration(-1))));
        assert_eq!(state.line_item_count, 0);
        assert!(db.get_bill(bill_info().id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn closes_at_maturity_with_no_items() {
        let (db, _msg_tx, msg_rx, _close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            60,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        ));

        tokio::time::advance(Duration::from_secs(61)).await;
        let (state, result) = handle.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(state.bill_info.status, BillStatus::Closed);
        assert_eq!(state.line_item_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn close_signal_ends_the_bill_early() {
        let (db, _msg_tx, msg_rx, close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        ));

        close_tx.send("customer requested early close".into()).await.unwrap();
        let (state, result) = handle.await.unwrap();

        assert!(result.is_ok());
        assert_eq!(state.bill_info.status, BillStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn add_item_then_close_reflects_in_final_state() {
        let (db, msg_tx, msg_rx, close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        ));

        let (reply_tx, reply_rx) = oneshot::channel();
        msg_tx
            .send(WorkflowMessage::Update(
                UpdateRequest {
                    update_id: "update-1".into(),
                    item: line_item("item-1", 500),
                },
                reply_tx,
            ))
            .await
            .unwrap();
        match reply_rx.await.unwrap() {
            UpdateResult::Accepted(state) => {
                assert_eq!(state.line_item_count, 1);
                assert_eq!(state.total.total.number, 500);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }

        close_tx.send("done".into()).await.unwrap();
        let (state, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state.line_item_count, 1);
        assert_eq!(state.total.total.number, 500);
        assert_eq!(state.bill_info.status, BillStatus::Closed);

        let persisted = db.get_bill(bill_info().id).await.unwrap();
        assert_eq!(persisted.line_item_count, 1);
        assert_eq!(persisted.total_amount.number, 500);
        assert_eq!(persisted.bill_info.status, BillStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn duplicate_update_id_is_not_re_executed() {
        let (db, msg_tx, msg_rx, close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        ));

        for _ in 0..2 {
            let (reply_tx, reply_rx) = oneshot::channel();
            msg_tx
                .send(WorkflowMessage::Update(
                    UpdateRequest {
                        update_id: "update-1".into(),
                        item: line_item("item-1", 500),
                    },
                    reply_tx,
                ))
                .await
                .unwrap();
            match reply_rx.await.unwrap() {
                UpdateResult::Accepted(state) => assert_eq!(state.line_item_count, 1),
                other => panic!("expected acceptance, got {other:?}"),
            }
        }

        close_tx.send("done".into()).await.unwrap();
        let (state, _) = handle.await.unwrap();
        assert_eq!(state.line_item_count, 1);
        assert_eq!(state.total.total.number, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn same_item_id_different_update_id_stays_idempotent() {
        let (db, msg_tx, msg_rx, close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        ));

        for update_id in ["update-1", "update-2"] {
            let (reply_tx, reply_rx) = oneshot::channel();
            msg_tx
                .send(WorkflowMessage::Update(
                    UpdateRequest {
                        update_id: update_id.into(),
                        item: line_item("item-1", 500),
                    },
                    reply_tx,
                ))
                .await
                .unwrap();
            reply_rx.await.unwrap();
        }

        close_tx.send("done".into()).await.unwrap();
        let (state, _) = handle.await.unwrap();
        // The second update replays the same item id; the activity's own
        // idempotency keeps the count and total from double counting.
        assert_eq!(state.line_item_count, 1);
        assert_eq!(state.total.total.number, 500);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_currency_is_rejected_without_mutating_state() {
        let (_db, msg_tx, msg_rx, close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::new(MemBillDatabase::new()),
            RetryPolicy::default(),
        ));

        let mut item = line_item("item-1", 500);
        item.amount = Amount::new(500, CurrencyCode::new("GEL")).unwrap();
        let (reply_tx, reply_rx) = oneshot::channel();
        msg_tx
            .send(WorkflowMessage::Update(
                UpdateRequest {
                    update_id: "update-1".into(),
                    item,
                },
                reply_tx,
            ))
            .await
            .unwrap();
        assert!(matches!(
            reply_rx.await.unwrap(),
            UpdateResult::Rejected(domain::Error::IncompatibleCurrencyCodes { .. })
        ));

        close_tx.send("done".into()).await.unwrap();
        let (state, _) = handle.await.unwrap();
        assert_eq!(state.line_item_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn query_returns_a_snapshot_without_mutating_state() {
        let (db, msg_tx, msg_rx, close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        ));

        let (reply_tx, reply_rx) = oneshot::channel();
        msg_tx.send(WorkflowMessage::Query(reply_tx)).await.unwrap();
        let snapshot = reply_rx.await.unwrap();
        assert_eq!(snapshot.line_item_count, 0);
        assert_eq!(snapshot.bill_info.status, BillStatus::Open);

        close_tx.send("done".into()).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn two_items_submitted_concurrently_both_land_in_the_final_total() {
        let (db, msg_tx, msg_rx, close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        ));

        let tx1 = msg_tx.clone();
        let tx2 = msg_tx.clone();
        let first = tokio::spawn(async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx1.send(WorkflowMessage::Update(
                UpdateRequest {
                    update_id: "update-1".into(),
                    item: line_item("item-1", 100),
                },
                reply_tx,
            ))
            .await
            .unwrap();
            reply_rx.await.unwrap()
        });
        let second = tokio::spawn(async move {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx2.send(WorkflowMessage::Update(
                UpdateRequest {
                    update_id: "update-2".into(),
                    item: line_item("item-2", 200),
                },
                reply_tx,
            ))
            .await
            .unwrap();
            reply_rx.await.unwrap()
        });
        let (first_result, second_result) = tokio::join!(first, second);
        for result in [first_result.unwrap(), second_result.unwrap()] {
            assert!(matches!(result, UpdateResult::Accepted(_)));
        }

        close_tx.send("done".into()).await.unwrap();
        let (state, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state.line_item_count, 2);
        assert_eq!(state.total.total.number, 300);
        assert!(state.total.ok);
    }

    #[tokio::test(start_paused = true)]
    async fn overflow_poisons_the_total_and_resets_it_to_zero() {
        let (db, msg_tx, msg_rx, close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        ));

        let (reply_tx, reply_rx) = oneshot::channel();
        msg_tx
            .send(WorkflowMessage::Update(
                UpdateRequest {
                    update_id: "update-1".into(),
                    item: line_item("item-1", i64::MAX),
                },
                reply_tx,
            ))
            .await
            .unwrap();
        match reply_rx.await.unwrap() {
            UpdateResult::Accepted(state) => {
                assert_eq!(state.line_item_count, 1);
                assert_eq!(state.total.total.number, i64::MAX);
                assert!(state.total.ok);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }

        let (reply_tx, reply_rx) = oneshot::channel();
        msg_tx
            .send(WorkflowMessage::Update(
                UpdateRequest {
                    update_id: "update-2".into(),
                    item: line_item("item-2", 200),
                },
                reply_tx,
            ))
            .await
            .unwrap();
        match reply_rx.await.unwrap() {
            UpdateResult::Accepted(state) => {
                assert_eq!(state.line_item_count, 2);
                assert_eq!(state.total.total.number, 0);
                assert!(!state.total.ok);
            }
            other => panic!("expected acceptance, got {other:?}"),
        }

        close_tx.send("done".into()).await.unwrap();
        let (state, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state.line_item_count, 2);
        assert!(!state.total.ok);
    }

    /// A `BillDatabase` whose `add_line_item` always fails transiently,
    /// simulating an outage that outlasts the retry policy's attempts.
    struct AlwaysFailsOnAddDatabase {
        inner: MemBillDatabase,
    }

    #[async_trait::async_trait]
    impl BillDatabase for AlwaysFailsOnAddDatabase {
        async fn create_bill(&self, bill: BillInfo) -> Result<u64, db::Error> {
            self.inner.create_bill(bill).await
        }

        async fn add_line_item(
            &self,
            _line_item: BillLineItem,
            _total_after: money::TotalAmount,
        ) -> Result<u64, db::Error> {
            Err(db::Error::Transient("simulated database outage".into()))
        }

        async fn close_bill(&self, bill_id: BillId) -> Result<u64, db::Error> {
            self.inner.close_bill(bill_id).await
        }

        async fn get_bill(
            &self,
            bill_id: BillId,
        ) -> Result<domain::BillInfoAndMetadata, db::Error> {
            self.inner.get_bill(bill_id).await
        }
    }

    #[tokio::test]
    async fn activity_failure_exhausting_retries_fails_the_update_not_the_workflow() {
        let db: Arc<dyn BillDatabase> = Arc::new(AlwaysFailsOnAddDatabase {
            inner: MemBillDatabase::new(),
        });
        let (msg_tx, msg_rx) = mpsc::channel(8);
        let (close_tx, close_rx) = mpsc::channel(1);
        // A fast policy so the test doesn't spend ten real seconds
        // exhausting the production retry cap; the policy's shape (a
        // bounded number of attempts, then give up) is what's under
        // test, not its exact timings.
        let fast_policy = RetryPolicy {
            initial_interval: Duration::from_millis(1),
            backoff_coefficient: 2,
            max_interval: Duration::from_millis(5),
            max_attempts: 3,
            start_to_close: Duration::from_millis(50),
        };
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            fast_policy,
        ));

        let (reply_tx, reply_rx) = oneshot::channel();
        msg_tx
            .send(WorkflowMessage::Update(
                UpdateRequest {
                    update_id: "update-1".into(),
                    item: line_item("item-1", 500),
                },
                reply_tx,
            ))
            .await
            .unwrap();
        assert!(matches!(
            reply_rx.await.unwrap(),
            UpdateResult::ActivityFailed(_)
        ));

        close_tx.send("done".into()).await.unwrap();
        let (state, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state.line_item_count, 0);
        assert!(state.total.ok);
        assert_eq!(state.total.total.number, 0);
        assert_eq!(state.bill_info.status, BillStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn update_after_close_is_rejected_by_the_closed_channel() {
        let (db, msg_tx, msg_rx, close_tx, close_rx) = harness();
        let handle = tokio::spawn(run(
            bill_info(),
            3600,
            msg_rx,
            close_rx,
            Arc::clone(&db),
            RetryPolicy::default(),
        ));

        close_tx.send("done".into()).await.unwrap();
        let (state, result) = handle.await.unwrap();
        assert!(result.is_ok());
        assert_eq!(state.bill_info.status, BillStatus::Closed);

        // The workflow task has exited and dropped its message receiver;
        // a host sees this send fail and treats the bill as already closed.
        let (reply_tx, _reply_rx) = oneshot::channel();
        let send_result = msg_tx
            .send(WorkflowMessage::Update(
                UpdateRequest {
                    update_id: "update-1".into(),
                    item: line_item("item-1", 500),
                },
                reply_tx,
            ))
            .await;
        assert!(send_result.is_err());
    }
}
