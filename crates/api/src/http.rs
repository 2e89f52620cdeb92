//! The HTTP transport: a thin `axum` adapter over [`crate::client_ops`].
//!
//! Field names and status-code mappings follow the JSON shapes this
//! system has always exposed; the route handlers themselves hold no
//! domain logic beyond translating requests into `client_ops` calls
//! and their results into response bodies.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{FromRequestParts, Path, State};
use axum::http::request::Parts;
use axum::http::header::AUTHORIZATION;
use axum::routing::{get, patch, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use db::BillDatabase;
use domain::{BillId, BillIdGenerator, BillStatus, CustomerId};
use money::{Amount, CurrencyCode};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::auth::TokenVerifier;
use crate::{client_ops, Error};

/// Shared state handed to every handler. Cheap to clone: every field
/// is an `Arc`.
#[derive(Clone)]
pub struct AppState {
    pub host: Arc<dyn host::Host>,
    pub db: Arc<dyn BillDatabase>,
    pub id_generator: Arc<dyn BillIdGenerator>,
    pub token_verifier: Arc<dyn TokenVerifier>,
}

/// The authenticated caller, extracted from the `Authorization` header.
struct AuthenticatedCustomer(CustomerId);

#[async_trait]
impl FromRequestParts<AppState> for AuthenticatedCustomer {
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Error> {
        let token = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.strip_prefix("Bearer "))
            .ok_or(Error::Unauthenticated)?;
        let customer_id = state
            .token_verifier
            .verify(token)
            .ok_or(Error::Unauthenticated)?;
        Ok(AuthenticatedCustomer(customer_id))
    }
}

fn total_ok_string(ok: bool) -> &'static str {
    if ok {
        "y"
    } else {
        "n"
    }
}

fn status_code(status: BillStatus) -> i16 {
    match status {
        BillStatus::Open => 0,
        BillStatus::Closed => 1,
    }
}

#[derive(Deserialize)]
struct OpenBillRequest {
    currency_code: String,
    close_time: DateTime<Utc>,
}

#[derive(Serialize)]
struct OpenBillResponse {
    id: String,
}

async fn open_new_bill_handler(
    State(app): State<AppState>,
    AuthenticatedCustomer(customer_id): AuthenticatedCustomer,
    Json(body): Json<OpenBillRequest>,
) -> Result<Json<OpenBillResponse>, Error> {
    let bill_info = client_ops::open_new_bill(
        app.host.as_ref(),
        app.id_generator.as_ref(),
        customer_id,
        CurrencyCode::new(body.currency_code),
        body.close_time,
    )
    .await?;
    Ok(Json(OpenBillResponse {
        id: bill_info.id.id,
    }))
}

#[derive(Serialize)]
struct BillResponse {
    id: String,
    currency_code: String,
    status: i16,
    line_item_count: u64,
    total_ok: String,
    total: i64,
}

async fn get_bill_handler(
    State(app): State<AppState>,
    AuthenticatedCustomer(customer_id): AuthenticatedCustomer,
    Path(id): Path<String>,
) -> Result<Json<BillResponse>, Error> {
    let bill_id = BillId { customer_id, id };
    let metadata = client_ops::get_bill(app.host.as_ref(), &app.db, bill_id).await?;
    Ok(Json(BillResponse {
        id: metadata.bill_info.id.id,
        currency_code: metadata.bill_info.currency_code.to_string(),
        status: status_code(metadata.bill_info.status),
        line_item_count: metadata.line_item_count,
        total_ok: total_ok_string(metadata.total_ok).to_string(),
        total: metadata.total_amount.number,
    }))
}

#[derive(Serialize)]
struct CloseBillResponse {
    currency_code: String,
    line_item_count: u64,
    total_ok: String,
    total: i64,
}

async fn close_bill_handler(
    State(app): State<AppState>,
    AuthenticatedCustomer(customer_id): AuthenticatedCustomer,
    Path(id): Path<String>,
) -> Result<Json<CloseBillResponse>, Error> {
    let bill_id = BillId { customer_id, id };
    let metadata = client_ops::close_bill(app.host.as_ref(), bill_id, "client requested close".to_string()).await?;
    Ok(Json(CloseBillResponse {
        currency_code: metadata.bill_info.currency_code.to_string(),
        line_item_count: metadata.line_item_count,
        total_ok: total_ok_string(metadata.total_ok).to_string(),
        total: metadata.total_amount.number,
    }))
}

#[derive(Deserialize)]
struct AddLineItemRequest {
    description: String,
    amount: i64,
    #[serde(rename = "currency-code")]
    currency_code: String,
}

#[derive(Serialize)]
struct AddLineItemResponse {
    id: String,
    currency_code: String,
    line_item_count: u64,
    total_ok: String,
    total: i64,
}

async fn add_line_item_handler(
    State(app): State<AppState>,
    AuthenticatedCustomer(customer_id): AuthenticatedCustomer,
    Path(id): Path<String>,
    Json(body): Json<AddLineItemRequest>,
) -> Result<Json<AddLineItemResponse>, Error> {
    let bill_id = BillId { customer_id, id };
    let currency_code = CurrencyCode::new(body.currency_code);
    let amount = Amount::new(body.amount, currency_code)?;
    let update_id = uuid::Uuid::new_v4().to_string();
    let item_id = uuid::Uuid::new_v4().to_string();
    let metadata = client_ops::add_bill_line_item(
        app.host.as_ref(),
        bill_id,
        update_id,
        item_id,
        body.description,
        amount,
    )
    .await?;
    Ok(Json(AddLineItemResponse {
        id: metadata.bill_info.id.id,
        currency_code: metadata.bill_info.currency_code.to_string(),
        line_item_count: metadata.line_item_count,
        total_ok: total_ok_string(metadata.total_ok).to_string(),
        total: metadata.total_amount.number,
    }))
}

/// Build the billing HTTP router. `app` carries every dependency a
/// handler needs; wiring it (choosing `LocalHost` vs a future
/// distributed host, `PgBillDatabase` vs `MemBillDatabase`) is the
/// worker binary's job.
pub fn router(app: AppState) -> Router {
    Router::new()
        .route("/bills", post(open_new_bill_handler))
        .route("/bill/:id", get(get_bill_handler))
        .route("/bill/:id/close", patch(close_bill_handler))
        .route("/bill/:id/line-items", post(add_line_item_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(app)
}
