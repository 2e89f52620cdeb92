//! Bills, line items, and the identifiers that tie them to a customer.

mod ids;

pub use ids::{BillIdGenerator, UuidBillIdGenerator};

use money::{Amount, CurrencyCode, TotalAmount};
use serde::{Deserialize, Serialize};

/// The authenticated customer a bill belongs to.
#[derive(Clone, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct CustomerId(pub String);

impl CustomerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

/// Globally unique bill identifier: a customer id paired with a local id.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BillId {
    pub customer_id: CustomerId,
    pub id: String,
}

/// Monotonic, one-way: `Open` may transition to `Closed`, never back.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum BillStatus {
    Open,
    Closed,
}

/// The fixed, currency-scoped identity of a bill. `currency_code` is
/// set at creation and never changes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct BillInfo {
    pub id: BillId,
    pub currency_code: CurrencyCode,
    pub status: BillStatus,
}

/// Errors raised while building or growing a bill.
#[derive(Clone, Debug, Eq, PartialEq, thiserror::Error)]
pub enum Error {
    #[error("incompatible currency codes, expected {expected:?}, received {received:?}")]
    IncompatibleCurrencyCodes {
        expected: CurrencyCode,
        received: CurrencyCode,
    },
}

impl BillInfo {
    /// A line item may only be added to a bill sharing its currency.
    pub fn check_line_item_compatible(&self, line_item: &BillLineItem) -> Result<(), Error> {
        if self.currency_code != line_item.amount.currency_code {
            return Err(Error::IncompatibleCurrencyCodes {
                expected: self.currency_code.clone(),
                received: line_item.amount.currency_code.clone(),
            });
        }
        Ok(())
    }
}

/// Globally unique line-item identifier, embedding the bill it belongs to.
#[derive(Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct BillLineItemId {
    pub bill_id: BillId,
    pub id: String,
}

/// A single charge on a bill. Created once by an activity; never
/// mutated or deleted afterwards.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillLineItem {
    pub id: BillLineItemId,
    pub description: String,
    pub amount: Amount,
}

/// The workflow's in-memory view of a bill, also exported via query.
///
/// Invariants (enforced by the workflow, not by this type):
/// - `line_item_count` equals the number of successfully persisted items.
/// - `total.total.currency_code == bill_info.currency_code` whenever `total.ok`.
/// - once `bill_info.status == Closed`, no further item may be admitted.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillingState {
    pub bill_info: BillInfo,
    pub line_item_count: u64,
    pub total: TotalAmount,
}

impl BillingState {
    pub fn new(bill_info: BillInfo) -> Self {
        let currency_code = bill_info.currency_code.clone();
        Self {
            bill_info,
            line_item_count: 0,
            total: TotalAmount::zero(currency_code),
        }
    }
}

/// The database's read shape for a bill: `BillInfo` plus its metadata.
/// Authoritative for closed bills; the workflow is authoritative while open.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BillInfoAndMetadata {
    pub bill_info: BillInfo,
    pub line_item_count: u64,
    pub total_amount: Amount,
    pub total_ok: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bill_info(status: BillStatus) -> BillInfo {
        BillInfo {
            id: BillId {
                customer_id: CustomerId::new("alice"),
                id: "bill-1".into(),
            },
            currency_code: CurrencyCode::new("USD"),
            status,
        }
    }

    #[test]
    fn line_item_compatible_same_currency() {
        let info = bill_info(BillStatus::Open);
        let item = BillLineItem {
            id: BillLineItemId {
                bill_id: info.id.clone(),
                id: "item-1".into(),
            },
            description: "widget".into(),
            amount: Amount::new(100, CurrencyCode::new("USD")).unwrap(),
        };
        assert!(info.check_line_item_compatible(&item).is_ok());
    }

    #[test]
    fn line_item_incompatible_currency_rejected() {
        let info = bill_info(BillStatus::Open);
        let item = BillLineItem {
            id: BillLineItemId {
                bill_id: info.id.clone(),
                id: "item-1".into(),
            },
            description: "widget".into(),
            amount: Amount::new(100, CurrencyCode::new("GEL")).unwrap(),
        };
        assert!(matches!(
            info.check_line_item_compatible(&item),
            Err(Error::IncompatibleCurrencyCodes { .. })
        ));
    }

    #[test]
    fn new_billing_state_starts_at_zero() {
        let state = BillingState::new(bill_info(BillStatus::Open));
        assert_eq!(state.line_item_count, 0);
        assert!(state.total.ok);
        assert_eq!(state.total.total.number, 0);
    }
}
