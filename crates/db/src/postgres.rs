use async_trait::async_trait;
use domain::{BillId, BillInfo, BillInfoAndMetadata, BillLineItem, BillStatus, CustomerId};
use money::{Amount, CurrencyCode, TotalAmount};
use sqlx::{PgPool, Row};

use crate::{BillDatabase, Error};

fn status_to_i16(status: BillStatus) -> i16 {
    match status {
        BillStatus::Open => 0,
        BillStatus::Closed => 1,
    }
}

fn status_from_i16(value: i16) -> BillStatus {
    match value {
        1 => BillStatus::Closed,
        _ => BillStatus::Open,
    }
}

/// The production `BillDatabase` backend, backed by Postgres via `sqlx`.
///
/// Table shapes and the `ON CONFLICT DO NOTHING` idempotency idiom
/// mirror the schema in the system's persistence contract (see the
/// `migrations/` directory).
pub struct PgBillDatabase {
    pool: PgPool,
}

impl PgBillDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BillDatabase for PgBillDatabase {
    async fn create_bill(&self, bill: BillInfo) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            INSERT INTO bill (customer_id, id, currency_code, status, line_item_count, total_amount, total_ok)
            VALUES ($1, $2, $3, $4, 0, 0, true)
            ON CONFLICT (customer_id, id) DO NOTHING
            "#,
        )
        .bind(&bill.id.customer_id.0)
        .bind(&bill.id.id)
        .bind(bill.currency_code.as_str())
        .bind(status_to_i16(bill.status))
        .execute(&self.pool)
        .await?;

        tracing::info!(customer_id = %bill.id.customer_id.0, bill_id = %bill.id.id, rows = result.rows_affected(), "created bill");
        Ok(result.rows_affected())
    }

    async fn add_line_item(
        &self,
        line_item: BillLineItem,
        total_after: TotalAmount,
    ) -> Result<u64, Error> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            r#"
            SELECT status, currency_code
            FROM bill
            WHERE customer_id = $1 AND id = $2
            FOR UPDATE
            "#,
        )
        .bind(&line_item.id.bill_id.customer_id.0)
        .bind(&line_item.id.bill_id.id)
        .fetch_optional(&mut *tx)
        .await?;

        let row = row.ok_or(Error::BillNotFound)?;
        let status: i16 = row.try_get("status")?;
        let currency_code: String = row.try_get("currency_code")?;

        if status_from_i16(status) != BillStatus::Open {
            return Err(Error::BillClosed);
        }
        if currency_code != line_item.amount.currency_code.as_str() {
            return Err(Error::CurrencyMismatch);
        }

        let updated = sqlx::query(
            r#"
            UPDATE bill
            SET line_item_count = line_item_count + 1, total_amount = $3, total_ok = $4
            WHERE customer_id = $1 AND id = $2
            "#,
        )
        .bind(&line_item.id.bill_id.customer_id.0)
        .bind(&line_item.id.bill_id.id)
        .bind(total_after.total.number)
        .bind(total_after.ok)
        .execute(&mut *tx)
        .await?;
        if updated.rows_affected() == 0 {
            return Err(Error::BillNotFound);
        }

        let inserted = sqlx::query(
            r#"
            INSERT INTO line_item (customer_id, bill_id, id, description, amount)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (customer_id, bill_id, id) DO NOTHING
            "#,
        )
        .bind(&line_item.id.bill_id.customer_id.0)
        .bind(&line_item.id.bill_id.id)
        .bind(&line_item.id.id)
        .bind(&line_item.description)
        .bind(line_item.amount.number)
        .execute(&mut *tx)
        .await?;

        if inserted.rows_affected() == 0 {
            // Already persisted by a prior attempt; roll back the
            // counter/total bump above so a retried call stays a no-op.
            tx.rollback().await?;
            return Ok(0);
        }

        tx.commit().await?;
        Ok(inserted.rows_affected())
    }

    async fn close_bill(&self, bill_id: BillId) -> Result<u64, Error> {
        let result = sqlx::query(
            r#"
            UPDATE bill
            SET status = $3
            WHERE customer_id = $1 AND id = $2
            "#,
        )
        .bind(&bill_id.customer_id.0)
        .bind(&bill_id.id)
        .bind(status_to_i16(BillStatus::Closed))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(Error::BillNotFound);
        }
        Ok(result.rows_affected())
    }

    async fn get_bill(&self, bill_id: BillId) -> Result<BillInfoAndMetadata, Error> {
        let row = sqlx::query(
            r#"
            SELECT customer_id, id, currency_code, status, line_item_count, total_amount, total_ok
            FROM bill
            WHERE customer_id = $1 AND id = $2
            "#,
        )
        .bind(&bill_id.customer_id.0)
        .bind(&bill_id.id)
        .fetch_optional(&self.pool)
        .await?;

        let row = row.ok_or(Error::BillNotFound)?;
        let customer_id: String = row.try_get("customer_id")?;
        let id: String = row.try_get("id")?;
        let currency_code: String = row.try_get("currency_code")?;
        let status: i16 = row.try_get("status")?;
        let line_item_count: i64 = row.try_get("line_item_count")?;
        let total_amount: i64 = row.try_get("total_amount")?;
        let total_ok: bool = row.try_get("total_ok")?;

        Ok(BillInfoAndMetadata {
            bill_info: BillInfo {
                id: BillId {
                    customer_id: CustomerId::new(customer_id),
                    id,
                },
                currency_code: CurrencyCode::new(currency_code.clone()),
                status: status_from_i16(status),
            },
            line_item_count: line_item_count as u64,
            total_amount: Amount {
                number: total_amount,
                currency_code: CurrencyCode::new(currency_code),
            },
            total_ok,
        })
    }
}
