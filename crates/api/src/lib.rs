//! Client-facing billing operations, independent of any one host
//! implementation, plus the HTTP transport and bearer-token auth that
//! expose them.

pub mod auth;
pub mod client_ops;
pub mod http;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// The error type every client operation returns. Maps onto HTTP
/// status codes at the edge via [`IntoResponse`]; never constructed
/// directly by a handler, only produced by `client_ops`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unauthenticated")]
    Unauthenticated,
    #[error(transparent)]
    Validation(#[from] domain::Error),
    #[error(transparent)]
    Money(#[from] money::Error),
    #[error("workflow error: {0}")]
    Host(#[from] host::Error),
    #[error(transparent)]
    Database(#[from] db::Error),
    #[error("activity failed: {0}")]
    ActivityFailed(String),
    #[error("timed out confirming the new bill started")]
    StartUnconfirmed,
    #[error("bill state belongs to a different customer than the caller")]
    CustomerMismatch,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let status = match &self {
            Error::Unauthenticated => StatusCode::UNAUTHORIZED,
            Error::Validation(_) | Error::Money(_) => StatusCode::BAD_REQUEST,
            Error::Host(host::Error::NotFound(_)) => StatusCode::NOT_FOUND,
            Error::Database(db::Error::BillNotFound) => StatusCode::NOT_FOUND,
            Error::Database(
                db::Error::BillAlreadyExists
                | db::Error::LineItemAlreadyExists
                | db::Error::BillClosed
                | db::Error::BillMismatch
                | db::Error::CurrencyMismatch,
            ) => StatusCode::CONFLICT,
            Error::StartUnconfirmed => StatusCode::SERVICE_UNAVAILABLE,
            Error::Host(_)
            | Error::Database(_)
            | Error::ActivityFailed(_)
            | Error::CustomerMismatch => StatusCode::INTERNAL_SERVER_ERROR,
        };
        tracing::error!(error = %self, status = %status, "request failed");
        (status, axum::Json(ErrorBody { error: self.to_string() })).into_response()
    }
}
