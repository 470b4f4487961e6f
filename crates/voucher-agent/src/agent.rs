// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Wiring: startup recovery plus the two background tick loops.
//!
//! Collection and redemption each run on their own loop, one handler
//! execution at a time; the loops share no mutable state beyond the
//! database, and the delay queue is owned by the collector.

use std::{sync::Arc, time::Duration};

use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};

use crate::{error::AgentError, store::ReceiptStore};

pub mod delay_queue;
pub mod metrics;
pub mod receipt_collector;
pub mod voucher_redeemer;

pub use receipt_collector::ReceiptCollector;
pub use voucher_redeemer::{RedemptionPolicy, VoucherRedeemer};

/// How often the delay queue is polled for elapsed receipt batches.
pub const RECEIPT_COLLECT_INTERVAL: Duration = Duration::from_secs(10);
/// How often the vouchers table is checked for redeemable batches.
pub const VOUCHER_REDEMPTION_INTERVAL: Duration = Duration::from_secs(30);

/// The running collection and redemption loops.
///
/// Dropping the agent stops both loops; the embedding process decides
/// when that happens.
pub struct Agent<S> {
    collector: Arc<ReceiptCollector<S>>,
    collect_loop: JoinHandle<()>,
    redeem_loop: JoinHandle<()>,
}

impl<S: ReceiptStore + 'static> Agent<S> {
    /// Recover pending receipt batches from the database, then start the
    /// collection and redemption loops.
    pub async fn start(
        collector: Arc<ReceiptCollector<S>>,
        redeemer: Arc<VoucherRedeemer<S>>,
    ) -> Result<Self, AgentError> {
        collector.queue_pending_receipts_from_database().await?;

        let collect_loop = tokio::spawn({
            let collector = collector.clone();
            async move {
                let mut interval = time::interval(RECEIPT_COLLECT_INTERVAL);
                interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
                loop {
                    interval.tick().await;
                    collector.collect_pending().await;
                }
            }
        });
        let redeem_loop = tokio::spawn(async move {
            let mut interval = time::interval(VOUCHER_REDEMPTION_INTERVAL);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                redeemer.redeem_vouchers().await;
            }
        });

        Ok(Self {
            collector,
            collect_loop,
            redeem_loop,
        })
    }

    /// The collector, for the close-allocation workflow.
    pub fn collector(&self) -> &Arc<ReceiptCollector<S>> {
        &self.collector
    }

    /// Stop both loops. In-flight handlers are cut at their next await
    /// point; database consistency is carried by the transactions.
    pub fn shutdown(&self) {
        self.collect_loop.abort();
        self.redeem_loop.abort();
    }
}

impl<S> Drop for Agent<S> {
    fn drop(&mut self) {
        self.collect_loop.abort();
        self.redeem_loop.abort();
    }
}
