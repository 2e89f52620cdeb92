//! An in-process substitute for a durable-execution host: it spawns one
//! `tokio` task per bill (the workflow), registers it under a workflow
//! id, and routes queries/updates/signals into its channels.
//!
//! A real durable-execution platform persists workflow history and can
//! resume a workflow on another process after a crash; `LocalHost`
//! trades that durability for an in-process implementation grounded in
//! the same request/reply shape, suitable for tests and the
//! `--in-memory` mode of the worker binary. Production durability comes
//! from `db::BillDatabase` being the source of truth for anything the
//! workflow has already committed; only in-flight, uncommitted
//! coordination state (the open bill's pending update cache, its timer)
//! is lost if the process restarts.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use db::BillDatabase;
use domain::{BillInfo, BillingState};
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use workflow::{Error as WorkflowError, UpdateRequest, UpdateResult, WorkflowMessage};

/// Errors raised while addressing a workflow instance.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("workflow {0} not found")]
    NotFound(String),
    #[error("workflow {0} already exists")]
    AlreadyExists(String),
    #[error("workflow {0} is no longer accepting requests")]
    Unreachable(String),
}

/// A running (or just-completed) workflow instance's addressable handle.
struct Instance {
    messages: mpsc::Sender<WorkflowMessage>,
    close_signal: mpsc::Sender<String>,
    join: JoinHandle<(BillingState, Result<(), WorkflowError>)>,
}

/// Start, signal, query, and update workflow instances by id.
#[async_trait]
pub trait Host: Send + Sync {
    async fn start_workflow(
        &self,
        workflow_id: String,
        bill_info: BillInfo,
        duration_secs: i64,
    ) -> Result<(), Error>;

    async fn signal_close(&self, workflow_id: &str, reason: String) -> Result<(), Error>;

    async fn query_state(&self, workflow_id: &str) -> Result<BillingState, Error>;

    async fn update_add_line_item(
        &self,
        workflow_id: &str,
        request: UpdateRequest,
    ) -> Result<UpdateResult, Error>;

    /// Wait for the workflow to run to completion and return its
    /// terminal state. Consumes the instance: a subsequent lookup of
    /// this workflow id returns `NotFound`.
    async fn await_completion(&self, workflow_id: &str) -> Result<BillingState, Error>;
}

/// The in-process [`Host`] implementation: a registry of spawned
/// workflow tasks, keyed by workflow id.
pub struct LocalHost {
    db: Arc<dyn BillDatabase>,
    retry_policy: activities::RetryPolicy,
    instances: RwLock<HashMap<String, Instance>>,
}

impl LocalHost {
    pub fn new(db: Arc<dyn BillDatabase>, retry_policy: activities::RetryPolicy) -> Self {
        Self {
            db,
            retry_policy,
            instances: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait]
impl Host for LocalHost {
    async fn start_workflow(
        &self,
        workflow_id: String,
        bill_info: BillInfo,
        duration_secs: i64,
    ) -> Result<(), Error> {
        let mut instances = self.instances.write().await;
        if instances.contains_key(&workflow_id) {
            return Err(Error::AlreadyExists(workflow_id));
        }

        let (messages_tx, messages_rx) = mpsc::channel(64);
        let (close_tx, close_rx) = mpsc::channel(1);
        let db = Arc::clone(&self.db);
        let retry_policy = self.retry_policy;

        tracing::info!(%workflow_id, "starting workflow");
        let join = tokio::spawn(workflow::run(
            bill_info,
            duration_secs,
            messages_rx,
            close_rx,
            db,
            retry_policy,
        ));

        instances.insert(
            workflow_id,
            Instance {
                messages: messages_tx,
                close_signal: close_tx,
                join,
            },
        );
        Ok(())
    }

    async fn signal_close(&self, workflow_id: &str, reason: String) -> Result<(), Error> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(workflow_id)
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        instance
            .close_signal
            .send(reason)
            .await
            .map_err(|_| Error::Unreachable(workflow_id.to_string()))
    }

    async fn query_state(&self, workflow_id: &str) -> Result<BillingState, Error> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(workflow_id)
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        instance
            .messages
            .send(WorkflowMessage::Query(reply_tx))
            .await
            .map_err(|_| Error::Unreachable(workflow_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Unreachable(workflow_id.to_string()))
    }

    async fn update_add_line_item(
        &self,
        workflow_id: &str,
        request: UpdateRequest,
    ) -> Result<UpdateResult, Error> {
        let instances = self.instances.read().await;
        let instance = instances
            .get(workflow_id)
            .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;
        let (reply_tx, reply_rx) = oneshot::channel();
        instance
            .messages
            .send(WorkflowMessage::Update(request, reply_tx))
            .await
            .map_err(|_| Error::Unreachable(workflow_id.to_string()))?;
        reply_rx
            .await
            .map_err(|_| Error::Unreachable(workflow_id.to_string()))
    }

    async fn await_completion(&self, workflow_id: &str) -> Result<BillingState, Error> {
        let instance = {
            let mut instances = self.instances.write().await;
            instances.remove(workflow_id)
        }
        .ok_or_else(|| Error::NotFound(workflow_id.to_string()))?;

        let (state, result) = instance
            .join
            .await
            .map_err(|_| Error::Unreachable(workflow_id.to_string()))?;
        if let Err(e) = result {
            tracing::warn!(workflow_id, error = %e, "workflow ended with an error");
        }
        Ok(state)
    }
}

impl LocalHost {
    /// Drop a completed instance's handle once its task has joined, so
    /// the registry does not grow without bound. A worker calls this
    /// periodically, or after observing `Error::Unreachable`.
    pub async fn reap_finished(&self) {
        let mut instances = self.instances.write().await;
        instances.retain(|_, instance| !instance.join.is_finished());
    }
}
