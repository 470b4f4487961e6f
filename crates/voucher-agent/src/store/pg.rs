// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Postgres-backed [`ReceiptStore`].
//!
//! Big integers are carried in NUMERIC(78) columns, wide enough for any
//! 33-byte fee amount; addresses and receipt ids are stored in their
//! canonical 0x-prefixed lowercase hex form, so `ORDER BY id` equals
//! ascending byte order.

use std::str::FromStr;

use alloy_primitives::{hex::ToHexExt, Address, Bytes, FixedBytes};
use async_trait::async_trait;
use bigdecimal::{num_bigint::BigInt, num_bigint::ToBigInt, BigDecimal};
use chrono::{DateTime, Utc};
use sqlx::{postgres::PgRow, PgConnection, PgPool, Postgres, Row, Transaction};

use super::{ReceiptStore, StoreError};
use crate::models::{allocation_key, AllocationReceipt, AllocationSummary, ReceiptId, Voucher};

/// [`ReceiptStore`] over a Postgres connection pool.
#[derive(Clone, Debug)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn begin_serializable(&self) -> Result<Transaction<'_, Postgres>, StoreError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }
}

async fn ensure_summary(conn: &mut PgConnection, allocation: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
            INSERT INTO allocation_summaries (allocation, closed_at, collected_fees, withdrawn_fees)
            VALUES ($1, NULL, 0, 0)
            ON CONFLICT (allocation) DO NOTHING
        "#,
    )
    .bind(allocation)
    .execute(conn)
    .await?;
    Ok(())
}

#[async_trait]
impl ReceiptStore for PgStore {
    async fn ensure_summaries(&self, allocations: &[Address]) -> Result<(), StoreError> {
        let mut tx = self.begin_serializable().await?;
        for allocation in allocations {
            ensure_summary(&mut tx, &allocation_key(allocation)).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn close_allocation(
        &self,
        allocation: Address,
        closed_at: DateTime<Utc>,
    ) -> Result<Vec<AllocationReceipt>, StoreError> {
        let key = allocation_key(&allocation);
        let mut tx = self.begin_serializable().await?;
        sqlx::query("UPDATE allocation_summaries SET closed_at = $2 WHERE allocation = $1")
            .bind(&key)
            .bind(closed_at)
            .execute(&mut *tx)
            .await?;
        let rows = sqlx::query(
            r#"
                SELECT id, allocation, fees, signature
                FROM allocation_receipts
                WHERE allocation = $1
                ORDER BY id ASC
            "#,
        )
        .bind(&key)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;
        rows.iter().map(receipt_from_row).collect()
    }

    async fn store_voucher(
        &self,
        receipt_ids: &[ReceiptId],
        voucher: &Voucher,
    ) -> Result<BigInt, StoreError> {
        let key = allocation_key(&voucher.allocation);
        let ids: Vec<String> = receipt_ids
            .iter()
            .map(|id| id.encode_hex_with_prefix())
            .collect();
        let amount = BigDecimal::from(voucher.amount.clone());

        let mut tx = self.begin_serializable().await?;
        sqlx::query("DELETE FROM allocation_receipts WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&mut *tx)
            .await?;
        ensure_summary(&mut tx, &key).await?;
        let row = sqlx::query(
            r#"
                UPDATE allocation_summaries
                SET collected_fees = collected_fees + $2
                WHERE allocation = $1
                RETURNING collected_fees
            "#,
        )
        .bind(&key)
        .bind(&amount)
        .fetch_one(&mut *tx)
        .await?;
        sqlx::query(
            r#"
                INSERT INTO vouchers (allocation, amount, signature)
                VALUES ($1, $2, $3)
                ON CONFLICT (allocation)
                DO UPDATE SET amount = EXCLUDED.amount, signature = EXCLUDED.signature
            "#,
        )
        .bind(&key)
        .bind(&amount)
        .bind(voucher.signature.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        decimal_to_int("collected_fees", row.try_get("collected_fees")?)
    }

    async fn load_vouchers(&self, limit: usize) -> Result<Vec<Voucher>, StoreError> {
        let rows = sqlx::query(
            r#"
                SELECT allocation, amount, signature
                FROM vouchers
                ORDER BY amount DESC, allocation ASC
                LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(voucher_from_row).collect()
    }

    async fn record_withdrawals(&self, vouchers: &[Voucher]) -> Result<(), StoreError> {
        let mut tx = self.begin_serializable().await?;
        for voucher in vouchers {
            let key = allocation_key(&voucher.allocation);
            ensure_summary(&mut tx, &key).await?;
            sqlx::query(
                r#"
                    UPDATE allocation_summaries
                    SET withdrawn_fees = withdrawn_fees + $2
                    WHERE allocation = $1
                "#,
            )
            .bind(&key)
            .bind(BigDecimal::from(voucher.amount.clone()))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn delete_vouchers(&self, allocations: &[Address]) -> Result<(), StoreError> {
        let keys: Vec<String> = allocations.iter().map(allocation_key).collect();
        sqlx::query("DELETE FROM vouchers WHERE allocation = ANY($1)")
            .bind(&keys)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn closed_summaries(&self) -> Result<Vec<AllocationSummary>, StoreError> {
        let rows = sqlx::query(
            r#"
                SELECT allocation, closed_at, collected_fees, withdrawn_fees
                FROM allocation_summaries
                WHERE closed_at IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(summary_from_row).collect()
    }

    async fn receipts_for_allocations(
        &self,
        allocations: &[Address],
    ) -> Result<Vec<AllocationReceipt>, StoreError> {
        let keys: Vec<String> = allocations.iter().map(allocation_key).collect();
        let rows = sqlx::query(
            r#"
                SELECT id, allocation, fees, signature
                FROM allocation_receipts
                WHERE allocation = ANY($1)
                ORDER BY id ASC
            "#,
        )
        .bind(&keys)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(receipt_from_row).collect()
    }
}

fn receipt_from_row(row: &PgRow) -> Result<AllocationReceipt, StoreError> {
    Ok(AllocationReceipt {
        id: parse_fixed("id", &row.try_get::<String, _>("id")?)?,
        allocation: parse_address("allocation", &row.try_get::<String, _>("allocation")?)?,
        fees: decimal_to_int("fees", row.try_get("fees")?)?,
        signature: parse_fixed("signature", &row.try_get::<String, _>("signature")?)?,
    })
}

fn voucher_from_row(row: &PgRow) -> Result<Voucher, StoreError> {
    let signature: String = row.try_get("signature")?;
    Ok(Voucher {
        allocation: parse_address("allocation", &row.try_get::<String, _>("allocation")?)?,
        amount: decimal_to_int("amount", row.try_get("amount")?)?,
        signature: Bytes::from_str(signature.trim()).map_err(|e| StoreError::Decode {
            column: "signature",
            message: e.to_string(),
        })?,
    })
}

fn summary_from_row(row: &PgRow) -> Result<AllocationSummary, StoreError> {
    Ok(AllocationSummary {
        allocation: parse_address("allocation", &row.try_get::<String, _>("allocation")?)?,
        closed_at: row.try_get("closed_at")?,
        collected_fees: decimal_to_int("collected_fees", row.try_get("collected_fees")?)?,
        withdrawn_fees: decimal_to_int("withdrawn_fees", row.try_get("withdrawn_fees")?)?,
    })
}

fn parse_address(column: &'static str, value: &str) -> Result<Address, StoreError> {
    Address::from_str(value.trim()).map_err(|e| StoreError::Decode {
        column,
        message: e.to_string(),
    })
}

fn parse_fixed<const N: usize>(
    column: &'static str,
    value: &str,
) -> Result<FixedBytes<N>, StoreError> {
    FixedBytes::from_str(value.trim()).map_err(|e| StoreError::Decode {
        column,
        message: e.to_string(),
    })
}

fn decimal_to_int(column: &'static str, value: BigDecimal) -> Result<BigInt, StoreError> {
    value.to_bigint().ok_or(StoreError::Decode {
        column,
        message: "value is not an integer".to_string(),
    })
}
