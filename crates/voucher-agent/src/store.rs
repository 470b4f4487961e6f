// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Typed, transactional access to the query-fee tables.
//!
//! Every multi-statement write happens inside one serializable
//! transaction, which is what upholds the crate's central durability
//! invariant: the database never holds both a voucher for an allocation
//! and any of that allocation's receipts.

use alloy_primitives::Address;
use async_trait::async_trait;
use bigdecimal::num_bigint::BigInt;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::models::{AllocationReceipt, AllocationSummary, ReceiptId, Voucher};

pub mod pg;

/// Storage failure.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database error.
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    /// A stored value could not be decoded into its typed form.
    #[error("error decoding {column} from the database: {message}")]
    Decode {
        /// Column the undecodable value came from.
        column: &'static str,
        /// What went wrong.
        message: String,
    },
}

/// Access to receipts, allocation summaries and vouchers.
#[async_trait]
pub trait ReceiptStore: Send + Sync {
    /// Upsert a zeroed summary for every allocation, in one transaction.
    /// Existing summaries are left untouched; the call is idempotent.
    async fn ensure_summaries(&self, allocations: &[Address]) -> Result<(), StoreError>;

    /// Mark an allocation closed and return its receipts ordered by id
    /// ascending, in one transaction.
    async fn close_allocation(
        &self,
        allocation: Address,
        closed_at: DateTime<Utc>,
    ) -> Result<Vec<AllocationReceipt>, StoreError>;

    /// Swap receipts for their voucher, in one transaction: delete the
    /// receipts by id, ensure the summary, add the voucher amount to its
    /// collected fees and upsert the voucher. Returns the updated
    /// collected-fees total.
    async fn store_voucher(
        &self,
        receipt_ids: &[ReceiptId],
        voucher: &Voucher,
    ) -> Result<BigInt, StoreError>;

    /// The top `limit` vouchers by amount descending.
    async fn load_vouchers(&self, limit: usize) -> Result<Vec<Voucher>, StoreError>;

    /// Add each voucher's amount to its summary's withdrawn fees,
    /// ensuring summaries as needed, in one transaction.
    async fn record_withdrawals(&self, vouchers: &[Voucher]) -> Result<(), StoreError>;

    /// Delete the vouchers of the given allocations.
    async fn delete_vouchers(&self, allocations: &[Address]) -> Result<(), StoreError>;

    /// Summaries of allocations that have been closed.
    async fn closed_summaries(&self) -> Result<Vec<AllocationSummary>, StoreError>;

    /// All receipts of the given allocations, ordered by id ascending.
    async fn receipts_for_allocations(
        &self,
        allocations: &[Address],
    ) -> Result<Vec<AllocationReceipt>, StoreError>;
}
