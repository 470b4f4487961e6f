// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Receipt collection: queueing receipts when allocations close, the
//! delayed gateway exchange, and startup recovery.
//!
//! Closing an allocation loads its receipts and queues them with a
//! settling delay, giving the gateway time to flush receipts still in
//! flight. The collection tick then drains every elapsed batch and runs
//! it through `encoding -> exchanging -> persisting`: small batches are
//! exchanged for a voucher in one shot, large ones in chunks of partial
//! vouchers that a final exchange aggregates. Failed batches stay in the
//! database and are re-queued by recovery or by a later close.

use std::{collections::HashMap, sync::Arc, time::Instant};

use alloy_primitives::Address;
use bigdecimal::ToPrimitive;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::{
    delay_queue::{DelayQueue, ReceiptsBatch},
    metrics,
};
use crate::{
    codec,
    error::AgentError,
    gateway::GatewayClient,
    models::{allocation_key, ReceiptId},
    store::ReceiptStore,
};

/// Receipts per single gateway exchange. Batches larger than this are
/// split into contiguous chunks and aggregated via partial vouchers.
pub const MAX_RECEIPTS_PER_EXCHANGE: usize = 25_000;

/// Settling delay between closing an allocation and collecting its
/// receipts.
pub fn receipt_collect_delay() -> Duration {
    Duration::minutes(20)
}

/// Collects receipts of closed allocations into gateway-signed vouchers.
pub struct ReceiptCollector<S> {
    store: Arc<S>,
    gateway: GatewayClient,
    receipts_to_collect: Mutex<DelayQueue>,
}

impl<S: ReceiptStore> ReceiptCollector<S> {
    /// A collector draining into `store` and exchanging through `gateway`.
    pub fn new(store: Arc<S>, gateway: GatewayClient) -> Self {
        Self {
            store,
            gateway,
            receipts_to_collect: Mutex::new(DelayQueue::new()),
        }
    }

    /// Make sure a summary row exists for every allocation so later fee
    /// bookkeeping has a place to land. Idempotent; errors are logged and
    /// reported as `false` so the caller may retry.
    pub async fn remember_allocations(&self, action_id: u64, allocation_ids: &[Address]) -> bool {
        info!(
            action = action_id,
            allocations = allocation_ids.len(),
            "Remember allocations for collecting receipts later"
        );
        match self.store.ensure_summaries(allocation_ids).await {
            Ok(()) => true,
            Err(err) => {
                let err = AgentError::RememberAllocationsFailed(err);
                error!(
                    action = action_id,
                    code = err.code(),
                    error = %err,
                    "Failed to remember allocations for collecting receipts later"
                );
                false
            }
        }
    }

    /// Close an allocation and queue its receipts for delayed collection.
    ///
    /// Returns `Ok(false)` when the allocation has no receipts; the
    /// summary is still marked closed. Store failures are fatal for the
    /// close action and propagate to the caller.
    pub async fn collect_receipts(
        &self,
        action_id: u64,
        allocation: Address,
    ) -> Result<bool, AgentError> {
        debug!(action = action_id, %allocation, "Queue allocation receipts for collecting");

        let now = Utc::now();
        let receipts = self
            .store
            .close_allocation(allocation, now)
            .await
            .map_err(|err| {
                let err = AgentError::QueueReceiptsFailed(err);
                error!(
                    action = action_id,
                    %allocation,
                    code = err.code(),
                    error = %err,
                    "Failed to queue allocation receipts for collecting"
                );
                err
            })?;

        if receipts.is_empty() {
            debug!(action = action_id, %allocation, "No receipts to collect for allocation");
            return Ok(false);
        }

        let timeout = now + receipt_collect_delay();
        let count = receipts.len();
        self.receipts_to_collect
            .lock()
            .await
            .push(ReceiptsBatch { receipts, timeout });
        metrics::RECEIPTS_TO_COLLECT
            .with_label_values(&[&allocation_key(&allocation)])
            .set(count as f64);
        info!(
            action = action_id,
            %allocation,
            receipts = count,
            timeout = %timeout,
            "Successfully queued allocation receipts for collecting"
        );
        Ok(true)
    }

    /// Drain every batch whose delay has elapsed and exchange each one.
    /// Tick handler: never propagates.
    pub async fn collect_pending(&self) {
        loop {
            let batch = self.receipts_to_collect.lock().await.pop_ready(Utc::now());
            let Some(batch) = batch else { break };
            let allocation = batch.allocation();
            if let Err(err) = self.exchange_batch(&batch).await {
                metrics::RECEIPTS_FAILED
                    .with_label_values(&[&allocation_key(&allocation)])
                    .inc_by(batch.receipts.len() as f64);
                error!(
                    %allocation,
                    code = err.code(),
                    error = %err,
                    receipts = batch.receipts.len(),
                    "Failed to collect receipts for allocation"
                );
            }
        }
    }

    /// `encoding -> exchanging -> persisting` for one batch.
    async fn exchange_batch(&self, batch: &ReceiptsBatch) -> Result<(), AgentError> {
        debug_assert!(!batch.receipts.is_empty(), "empty receipts batch");
        let allocation = batch.allocation();
        let label = allocation_key(&allocation);
        let started = Instant::now();

        let voucher = if batch.receipts.len() <= MAX_RECEIPTS_PER_EXCHANGE {
            let payload = codec::encode_receipt_batch(&allocation, &batch.receipts)
                .map_err(|e| AgentError::CollectExchangeFailed(e.into()))?;
            self.gateway
                .collect_receipts(payload)
                .await
                .map_err(|e| AgentError::CollectExchangeFailed(e.into()))?
        } else {
            let mut partial_vouchers =
                Vec::with_capacity(batch.receipts.len().div_ceil(MAX_RECEIPTS_PER_EXCHANGE));
            for chunk in batch.receipts.chunks(MAX_RECEIPTS_PER_EXCHANGE) {
                let payload = codec::encode_receipt_batch(&allocation, chunk)
                    .map_err(|e| AgentError::CollectExchangeFailed(e.into()))?;
                let partial_voucher = self
                    .gateway
                    .partial_voucher(payload)
                    .await
                    .map_err(|e| AgentError::CollectExchangeFailed(e.into()))?;
                partial_vouchers.push(partial_voucher);
            }
            metrics::VOUCHERS_TO_EXCHANGE
                .with_label_values(&[&label])
                .set(partial_vouchers.len() as f64);
            let payload = codec::encode_partial_voucher_batch(&allocation, &partial_vouchers)
                .map_err(|e| AgentError::CollectExchangeFailed(e.into()))?;
            self.gateway
                .voucher(payload)
                .await
                .map_err(|e| AgentError::CollectExchangeFailed(e.into()))?
        };

        let receipt_ids: Vec<ReceiptId> = batch.receipts.iter().map(|r| r.id).collect();
        let collected_fees = self
            .store
            .store_voucher(&receipt_ids, &voucher)
            .await
            .map_err(|e| AgentError::CollectExchangeFailed(e.into()))?;

        metrics::RECEIPTS_EXCHANGE_DURATION
            .with_label_values(&[&label])
            .observe(started.elapsed().as_secs_f64());
        metrics::VOUCHER_EXCHANGES_OK
            .with_label_values(&[&label])
            .inc();
        metrics::VOUCHERS.with_label_values(&[&label]).inc();
        metrics::RECEIPTS_TO_COLLECT
            .with_label_values(&[&label])
            .set(0.0);
        metrics::VOUCHERS_TO_EXCHANGE
            .with_label_values(&[&label])
            .set(0.0);
        metrics::VOUCHER_COLLECTED_FEES
            .with_label_values(&[&label])
            .set(collected_fees.to_f64().unwrap_or(f64::MAX));

        info!(
            %allocation,
            receipts = batch.receipts.len(),
            amount = %voucher.amount,
            "Successfully collected receipts into a voucher"
        );
        Ok(())
    }

    /// Reconstruct pending batches for allocations that were closed before
    /// a restart: one batch per closed summary, timed out at `closed_at`
    /// plus the settling delay, filled with the allocation's undeleted
    /// receipts. Closed allocations without receipts are skipped.
    pub async fn queue_pending_receipts_from_database(&self) -> Result<(), AgentError> {
        let summaries = self
            .store
            .closed_summaries()
            .await
            .map_err(AgentError::QueueReceiptsFailed)?;

        let mut batches: HashMap<Address, ReceiptsBatch> = summaries
            .iter()
            .filter_map(|summary| {
                let closed_at: DateTime<Utc> = summary.closed_at?;
                Some((
                    summary.allocation,
                    ReceiptsBatch {
                        receipts: Vec::new(),
                        timeout: closed_at + receipt_collect_delay(),
                    },
                ))
            })
            .collect();
        if batches.is_empty() {
            return Ok(());
        }

        let allocations: Vec<Address> = batches.keys().copied().collect();
        let receipts = self
            .store
            .receipts_for_allocations(&allocations)
            .await
            .map_err(AgentError::QueueReceiptsFailed)?;
        for receipt in receipts {
            match batches.get_mut(&receipt.allocation) {
                Some(batch) => batch.receipts.push(receipt),
                None => {
                    debug_assert!(false, "receipt for an allocation without a closed summary");
                    warn!(
                        allocation = %receipt.allocation,
                        "Ignoring receipt for an allocation without a closed summary"
                    );
                }
            }
        }

        let mut queue = self.receipts_to_collect.lock().await;
        let mut queued = 0;
        for batch in batches.into_values() {
            if batch.receipts.is_empty() {
                continue;
            }
            metrics::RECEIPTS_TO_COLLECT
                .with_label_values(&[&allocation_key(&batch.allocation())])
                .set(batch.receipts.len() as f64);
            queue.push(batch);
            queued += 1;
        }
        info!(batches = queued, "Queued pending receipt batches from the database");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use alloy_primitives::Bytes;
    use bigdecimal::num_bigint::BigInt;
    use serde_json::json;
    use url::Url;
    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::test::{receipt, receipts, test_allocation, MemoryStore};

    async fn collector_against(
        mock_server: &MockServer,
        store: Arc<MemoryStore>,
    ) -> ReceiptCollector<MemoryStore> {
        let gateway = GatewayClient::new(&Url::parse(&mock_server.uri()).unwrap()).unwrap();
        ReceiptCollector::new(store, gateway)
    }

    #[tokio::test]
    async fn remember_allocations_is_idempotent() {
        let mock_server = MockServer::start().await;
        let store = Arc::new(MemoryStore::default());
        let collector = collector_against(&mock_server, store.clone()).await;
        let allocations = [test_allocation(0x01), test_allocation(0x02)];

        assert!(collector.remember_allocations(1, &allocations).await);
        let before = store.summaries().await;
        assert!(collector.remember_allocations(2, &allocations).await);
        assert_eq!(store.summaries().await, before);
        assert_eq!(before.len(), 2);
    }

    #[tokio::test]
    async fn collect_receipts_without_receipts_closes_but_queues_nothing() {
        let mock_server = MockServer::start().await;
        let store = Arc::new(MemoryStore::default());
        let collector = collector_against(&mock_server, store.clone()).await;
        let allocation = test_allocation(0x01);
        store.insert_summary(allocation).await;

        assert!(!collector.collect_receipts(1, allocation).await.unwrap());
        assert!(store.summary(allocation).await.unwrap().closed_at.is_some());
        assert!(collector.receipts_to_collect.lock().await.is_empty());
    }

    #[tokio::test]
    async fn collect_receipts_queues_a_delayed_batch() {
        let mock_server = MockServer::start().await;
        let store = Arc::new(MemoryStore::default());
        let collector = collector_against(&mock_server, store.clone()).await;
        let allocation = test_allocation(0x01);
        store
            .insert_receipts(vec![
                receipt(2, allocation, 20),
                receipt(1, allocation, 10),
            ])
            .await;

        let before = Utc::now();
        assert!(collector.collect_receipts(1, allocation).await.unwrap());

        let queue = collector.receipts_to_collect.lock().await;
        let batch = queue.peek().unwrap();
        // loaded in id order, ready only after the settling delay
        assert_eq!(
            batch.receipts.iter().map(|r| r.id[14]).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert!(batch.timeout >= before + receipt_collect_delay());
    }

    /// Three receipts, one shot: a single `collect-receipts` POST, after
    /// which the database holds the voucher instead of the receipts.
    #[test_log::test(tokio::test)]
    async fn small_batch_is_collected_single_shot() {
        let mock_server = MockServer::start().await;
        let allocation = test_allocation(0xaa);
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": allocation,
                "amount": "60",
                "signature": "0x0102",
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let collector = collector_against(&mock_server, store.clone()).await;
        let batch = ReceiptsBatch {
            receipts: vec![
                receipt(1, allocation, 10),
                receipt(2, allocation, 20),
                receipt(3, allocation, 30),
            ],
            timeout: Utc::now(),
        };
        store.insert_receipts(batch.receipts.clone()).await;
        collector.receipts_to_collect.lock().await.push(batch);

        collector.collect_pending().await;

        assert_eq!(store.receipt_count().await, 0);
        let voucher = store.voucher(allocation).await.unwrap();
        assert_eq!(voucher.amount, BigInt::from(60));
        assert_eq!(voucher.signature, Bytes::from(vec![0x01, 0x02]));
        assert_eq!(
            store.summary(allocation).await.unwrap().collected_fees,
            BigInt::from(60)
        );
    }

    /// One receipt over the single-exchange limit: two partial-voucher
    /// POSTs (25 000 and 1 receipts), one final voucher POST.
    #[test_log::test(tokio::test)]
    async fn oversized_batch_is_collected_in_chunks() {
        let mock_server = MockServer::start().await;
        let allocation = test_allocation(0xbb);
        Mock::given(method("POST"))
            .and(path("/partial-voucher"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": allocation,
                "fees": "25000",
                "signature": "0x05",
                "receipt_id_min": "0x01",
                "receipt_id_max": "0x02",
            })))
            .expect(2)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/voucher"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": allocation,
                "amount": "25001",
                "signature": "0x06",
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&mock_server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let collector = collector_against(&mock_server, store.clone()).await;
        let batch = ReceiptsBatch {
            receipts: receipts(allocation, MAX_RECEIPTS_PER_EXCHANGE + 1),
            timeout: Utc::now(),
        };
        store.insert_receipts(batch.receipts.clone()).await;
        collector.receipts_to_collect.lock().await.push(batch);

        collector.collect_pending().await;

        assert_eq!(store.receipt_count().await, 0);
        assert_eq!(
            store.voucher(allocation).await.unwrap().amount,
            BigInt::from(25_001)
        );
    }

    /// A batch of exactly the limit still takes the single-shot path.
    #[tokio::test]
    async fn batch_at_the_limit_is_single_shot() {
        let mock_server = MockServer::start().await;
        let allocation = test_allocation(0xcc);
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": allocation,
                "amount": "25000",
                "signature": "0x07",
            })))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(path("/partial-voucher"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&mock_server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let collector = collector_against(&mock_server, store.clone()).await;
        let batch = ReceiptsBatch {
            receipts: receipts(allocation, MAX_RECEIPTS_PER_EXCHANGE),
            timeout: Utc::now(),
        };
        store.insert_receipts(batch.receipts.clone()).await;
        collector.receipts_to_collect.lock().await.push(batch);

        collector.collect_pending().await;
        assert!(store.voucher(allocation).await.is_some());
    }

    /// A failed exchange leaves the receipts in the database and the
    /// queue empty; only a restart or a later close retries.
    #[test_log::test(tokio::test)]
    async fn failed_exchange_keeps_receipts_in_the_database() {
        let mock_server = MockServer::start().await;
        let allocation = test_allocation(0xdd);
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let store = Arc::new(MemoryStore::default());
        let collector = collector_against(&mock_server, store.clone()).await;
        let batch = ReceiptsBatch {
            receipts: vec![receipt(1, allocation, 10)],
            timeout: Utc::now(),
        };
        store.insert_receipts(batch.receipts.clone()).await;
        collector.receipts_to_collect.lock().await.push(batch);

        collector.collect_pending().await;

        assert_eq!(store.receipt_count().await, 1);
        assert!(store.voucher(allocation).await.is_none());
        assert!(collector.receipts_to_collect.lock().await.is_empty());
    }

    #[tokio::test]
    async fn recovery_requeues_closed_allocations_with_receipts() {
        let mock_server = MockServer::start().await;
        let store = Arc::new(MemoryStore::default());
        let collector = collector_against(&mock_server, store.clone()).await;

        let closed = test_allocation(0x01);
        let closed_empty = test_allocation(0x02);
        let open = test_allocation(0x03);
        let closed_at = Utc::now() - Duration::minutes(5);
        store.insert_closed_summary(closed, closed_at).await;
        store.insert_closed_summary(closed_empty, closed_at).await;
        store.insert_summary(open).await;
        store
            .insert_receipts(vec![
                receipt(2, closed, 20),
                receipt(1, closed, 10),
                receipt(3, open, 30),
            ])
            .await;

        collector.queue_pending_receipts_from_database().await.unwrap();

        let queue = collector.receipts_to_collect.lock().await;
        assert_eq!(queue.len(), 1);
        let batch = queue.peek().unwrap();
        assert_eq!(batch.allocation(), closed);
        assert_eq!(batch.timeout, closed_at + receipt_collect_delay());
        assert_eq!(
            batch.receipts.iter().map(|r| r.id[14]).collect::<Vec<_>>(),
            vec![1, 2]
        );
    }
}
