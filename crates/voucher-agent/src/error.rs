// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the collection and redemption pipelines.
//!
//! Only [`AgentError::QueueReceiptsFailed`] reaches callers; everything
//! else is absorbed inside the background ticks, which log the stable
//! [`code`](AgentError::code) and continue.

use thiserror::Error;

use crate::store::StoreError;

/// A pipeline failure with a stable, log-searchable code.
#[derive(Debug, Error)]
pub enum AgentError {
    /// Upserting allocation summaries failed. Absorbed; the caller may
    /// simply retry.
    #[error("failed to remember allocations")]
    RememberAllocationsFailed(#[source] StoreError),

    /// Closing an allocation or queueing its receipts failed. Fatal for
    /// that close action; surfaced to the caller.
    #[error("failed to queue receipts for collection")]
    QueueReceiptsFailed(#[source] StoreError),

    /// The gateway exchange failed. The batch's receipts stay in the
    /// database; a restart or a later close of the same allocation
    /// re-queues them.
    #[error("failed to exchange receipts for a voucher")]
    CollectExchangeFailed(#[source] anyhow::Error),

    /// On-chain submission failed. Vouchers stay and are retried on the
    /// next redemption cycle.
    #[error("failed to redeem voucher batch")]
    VoucherRedeemFailed(#[source] anyhow::Error),

    /// The transaction manager refused the redemption: the exchange
    /// contract is paused or the operator is unauthorized. Retried.
    #[error("voucher redemption is currently not accepted on chain")]
    VoucherRedeemInvalid,
}

impl AgentError {
    /// Stable code attached to structured log entries.
    pub fn code(&self) -> &'static str {
        match self {
            Self::RememberAllocationsFailed(_) => "remember_allocations_failed",
            Self::QueueReceiptsFailed(_) => "queue_receipts_failed",
            Self::CollectExchangeFailed(_) => "collect_exchange_failed",
            Self::VoucherRedeemFailed(_) => "voucher_redeem_failed",
            Self::VoucherRedeemInvalid => "voucher_redeem_invalid",
        }
    }
}
