use std::collections::HashMap;

use async_trait::async_trait;
use domain::{BillId, BillInfo, BillInfoAndMetadata, BillLineItem, BillStatus, CustomerId};
use money::TotalAmount;
use tokio::sync::RwLock;

use crate::{BillDatabase, Error};

struct StoredBill {
    bill: BillInfo,
    line_items: HashMap<String, BillLineItem>,
    line_item_count: u64,
    total_amount: money::Amount,
    total_ok: bool,
}

/// An in-process `BillDatabase`, guarded by a single `RwLock`. Used by
/// tests and by the worker's `--in-memory` mode; not crash-durable.
#[derive(Default)]
pub struct MemBillDatabase {
    bills: RwLock<HashMap<CustomerId, HashMap<String, StoredBill>>>,
}

impl MemBillDatabase {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BillDatabase for MemBillDatabase {
    async fn create_bill(&self, bill: BillInfo) -> Result<u64, Error> {
        let mut bills = self.bills.write().await;
        let customer = bills.entry(bill.id.customer_id.clone()).or_default();
        if customer.contains_key(&bill.id.id) {
            return Ok(0);
        }
        let currency_code = bill.currency_code.clone();
        customer.insert(
            bill.id.id.clone(),
            StoredBill {
                bill,
                line_items: HashMap::new(),
                line_item_count: 0,
                total_amount: money::Amount {
                    number: 0,
                    currency_code,
                },
                total_ok: true,
            },
        );
        Ok(1)
    }

    async fn add_line_item(
        &self,
        line_item: BillLineItem,
        total_after: TotalAmount,
    ) -> Result<u64, Error> {
        let mut bills = self.bills.write().await;
        let customer = bills
            .get_mut(&line_item.id.bill_id.customer_id)
            .ok_or(Error::BillNotFound)?;
        let stored = customer
            .get_mut(&line_item.id.bill_id.id)
            .ok_or(Error::BillNotFound)?;
        if !matches!(stored.bill.status, BillStatus::Open) {
            return Err(Error::BillClosed);
        }
        if stored.bill.currency_code != line_item.amount.currency_code {
            return Err(Error::CurrencyMismatch);
        }
        if stored.line_items.contains_key(&line_item.id.id) {
            return Ok(0);
        }
        stored
            .line_items
            .insert(line_item.id.id.clone(), line_item);
        stored.line_item_count += 1;
        stored.total_amount = total_after.total;
        stored.total_ok = total_after.ok;
        Ok(1)
    }

    async fn close_bill(&self, bill_id: BillId) -> Result<u64, Error> {
        let mut bills = self.bills.write().await;
        let customer = bills
            .get_mut(&bill_id.customer_id)
            .ok_or(Error::BillNotFound)?;
        let stored = customer.get_mut(&bill_id.id).ok_or(Error::BillNotFound)?;
        stored.bill.status = BillStatus::Closed;
        Ok(1)
    }

    async fn get_bill(&self, bill_id: BillId) -> Result<BillInfoAndMetadata, Error> {
        let bills = self.bills.read().await;
        let customer = bills.get(&bill_id.customer_id).ok_or(Error::BillNotFound)?;
        let stored = customer.get(&bill_id.id).ok_or(Error::BillNotFound)?;
        Ok(BillInfoAndMetadata {
            bill_info: stored.bill.clone(),
            line_item_count: stored.line_item_count,
            total_amount: stored.total_amount.clone(),
            total_ok: stored.total_ok,
        })
    }
}
