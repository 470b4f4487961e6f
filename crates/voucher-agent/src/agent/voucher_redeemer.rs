// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Voucher redemption: batching vouchers by economic thresholds and
//! submitting them to the allocation exchange contract.
//!
//! Each cycle loads the most valuable vouchers, drops those already
//! redeemed on chain (stale local copies are deleted), filters out those
//! not worth redeeming on their own, and submits the rest as one
//! `redeemMany` call, provided the batch total clears the batch
//! threshold. Vouchers are only deleted after a confirmed transaction,
//! so every failure mode converges by retrying on a later cycle.

use std::{sync::Arc, time::Instant};

use alloy_primitives::Address;
use bigdecimal::num_bigint::BigInt;
use tracing::{error, info, warn};

use super::metrics;
use crate::{
    chain::{
        redeem_payload, AllocationExchange, RedeemManyTransaction, TransactionManager,
        TransactionOutcome,
    },
    error::AgentError,
    models::{allocation_key, Voucher},
    store::ReceiptStore,
};

/// Economic policy for on-chain redemption.
#[derive(Clone, Debug)]
pub struct RedemptionPolicy {
    /// Minimum per-voucher amount (wei) worth redeeming at all.
    pub voucher_redemption_threshold: BigInt,
    /// Minimum total batch amount (wei) before a batch is submitted.
    pub voucher_redemption_batch_threshold: BigInt,
    /// Hard cap on vouchers per `redeemMany` call and per database load.
    pub voucher_redemption_max_batch_size: usize,
}

/// Redeems collected vouchers on chain in economically sized batches.
pub struct VoucherRedeemer<S> {
    store: Arc<S>,
    transaction_manager: Arc<dyn TransactionManager>,
    allocation_exchange: Arc<dyn AllocationExchange>,
    policy: RedemptionPolicy,
}

impl<S: ReceiptStore> VoucherRedeemer<S> {
    /// A redeemer submitting through `transaction_manager` against
    /// `allocation_exchange`.
    pub fn new(
        store: Arc<S>,
        transaction_manager: Arc<dyn TransactionManager>,
        allocation_exchange: Arc<dyn AllocationExchange>,
        policy: RedemptionPolicy,
    ) -> Self {
        Self {
            store,
            transaction_manager,
            allocation_exchange,
            policy,
        }
    }

    /// Run one redemption cycle. Tick handler: never propagates.
    pub async fn redeem_vouchers(&self) {
        if let Err(err) = self.redeem_cycle().await {
            error!(code = err.code(), error = %err, "Failed to redeem vouchers");
        }
    }

    async fn redeem_cycle(&self) -> Result<(), AgentError> {
        let candidates = self
            .store
            .load_vouchers(self.policy.voucher_redemption_max_batch_size)
            .await
            .map_err(|e| AgentError::VoucherRedeemFailed(e.into()))?;
        if candidates.is_empty() {
            return Ok(());
        }

        let mut eligible = Vec::new();
        let mut below_threshold = 0usize;
        let mut stale = Vec::new();
        for voucher in candidates {
            let redeemed = self
                .allocation_exchange
                .allocations_redeemed(voucher.allocation)
                .await
                .map_err(AgentError::VoucherRedeemFailed)?;
            if redeemed {
                warn!(
                    allocation = %voucher.allocation,
                    "Allocation already redeemed on chain, deleting local voucher"
                );
                stale.push(voucher.allocation);
            } else if voucher.amount < self.policy.voucher_redemption_threshold {
                below_threshold += 1;
            } else {
                eligible.push(voucher);
            }
        }
        if !stale.is_empty() {
            self.store
                .delete_vouchers(&stale)
                .await
                .map_err(|e| AgentError::VoucherRedeemFailed(e.into()))?;
        }
        if below_threshold > 0 {
            info!(
                vouchers = below_threshold,
                threshold = %self.policy.voucher_redemption_threshold,
                "Some vouchers are below the redemption threshold, skipping them"
            );
        }
        if eligible.is_empty() {
            return Ok(());
        }

        // already value-sorted by the load
        let batch: Vec<Voucher> = eligible
            .into_iter()
            .take(self.policy.voucher_redemption_max_batch_size)
            .collect();
        let total: BigInt = batch.iter().map(|voucher| &voucher.amount).sum();
        if total <= self.policy.voucher_redemption_batch_threshold {
            info!(
                vouchers = batch.len(),
                total = %total,
                batch_threshold = %self.policy.voucher_redemption_batch_threshold,
                "Voucher batch total is too small to redeem economically"
            );
            return Ok(());
        }

        self.submit(batch, total).await
    }

    async fn submit(&self, batch: Vec<Voucher>, total: BigInt) -> Result<(), AgentError> {
        info!(vouchers = batch.len(), total = %total, "Redeem voucher batch on chain");
        metrics::VOUCHERS_REDEEM.set(batch.len() as f64);
        let started = Instant::now();

        let payload = redeem_payload(&batch);
        let transaction = RedeemManyTransaction::new(self.allocation_exchange.as_ref(), &payload);
        let outcome = match self
            .transaction_manager
            .execute("allocation-exchange.redeemMany", &transaction)
            .await
        {
            Ok(outcome) => outcome,
            Err(err) => {
                self.count_failed(&batch);
                return Err(AgentError::VoucherRedeemFailed(err));
            }
        };

        match outcome {
            TransactionOutcome::Paused | TransactionOutcome::Unauthorized => {
                for voucher in &batch {
                    metrics::VOUCHER_EXCHANGES_INVALID
                        .with_label_values(&[&allocation_key(&voucher.allocation)])
                        .inc();
                }
                let err = AgentError::VoucherRedeemInvalid;
                warn!(
                    code = err.code(),
                    vouchers = batch.len(),
                    "Voucher redemption refused by the transaction manager, retrying next cycle"
                );
                Ok(())
            }
            TransactionOutcome::Confirmed(transaction_hash) => {
                if let Err(err) = self.record_redeemed(&batch).await {
                    self.count_failed(&batch);
                    return Err(err);
                }
                for voucher in &batch {
                    metrics::VOUCHERS_REDEEM_DURATION
                        .with_label_values(&[&allocation_key(&voucher.allocation)])
                        .observe(started.elapsed().as_secs_f64());
                }
                metrics::VOUCHERS_REDEEM.set(0.0);
                info!(
                    transaction = %transaction_hash,
                    vouchers = batch.len(),
                    total = %total,
                    "Successfully redeemed voucher batch"
                );
                Ok(())
            }
        }
    }

    /// Post-confirmation bookkeeping: fold amounts into the summaries'
    /// withdrawn fees, then drop the redeemed vouchers.
    async fn record_redeemed(&self, batch: &[Voucher]) -> Result<(), AgentError> {
        self.store
            .record_withdrawals(batch)
            .await
            .map_err(|e| AgentError::VoucherRedeemFailed(e.into()))?;
        let allocations: Vec<Address> = batch.iter().map(|voucher| voucher.allocation).collect();
        self.store
            .delete_vouchers(&allocations)
            .await
            .map_err(|e| AgentError::VoucherRedeemFailed(e.into()))?;
        Ok(())
    }

    fn count_failed(&self, batch: &[Voucher]) {
        for voucher in batch {
            metrics::VOUCHER_REDEEMS_FAILED
                .with_label_values(&[&allocation_key(&voucher.allocation)])
                .inc();
        }
    }
}
