// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Time-ordered queue of receipt batches awaiting collection.

use std::{cmp::Ordering, collections::BinaryHeap};

use alloy_primitives::Address;
use chrono::{DateTime, Utc};

use crate::models::AllocationReceipt;

/// A closed allocation's receipts, eligible for the gateway exchange once
/// `timeout` has passed.
///
/// Never empty; all receipts share one allocation and are ordered by id
/// ascending, which fixes the canonical batch encoding.
#[derive(Clone, Debug)]
pub struct ReceiptsBatch {
    /// The receipts to exchange, ordered by id ascending.
    pub receipts: Vec<AllocationReceipt>,
    /// When the batch becomes eligible for collection.
    pub timeout: DateTime<Utc>,
}

impl ReceiptsBatch {
    /// The allocation shared by every receipt in the batch.
    pub fn allocation(&self) -> Address {
        debug_assert!(!self.receipts.is_empty(), "empty receipts batch");
        self.receipts[0].allocation
    }
}

// Heap order considers only the timeout; batches with equal timeouts are
// interchangeable.
impl PartialEq for ReceiptsBatch {
    fn eq(&self, other: &Self) -> bool {
        self.timeout == other.timeout
    }
}

impl Eq for ReceiptsBatch {}

impl PartialOrd for ReceiptsBatch {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ReceiptsBatch {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert so the earliest timeout wins.
        other.timeout.cmp(&self.timeout)
    }
}

/// Min-heap of pending batches keyed by their ready-at timestamp.
#[derive(Debug, Default)]
pub struct DelayQueue {
    heap: BinaryHeap<ReceiptsBatch>,
}

impl DelayQueue {
    /// An empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a batch.
    pub fn push(&mut self, batch: ReceiptsBatch) {
        self.heap.push(batch);
    }

    /// The batch with the earliest timeout, if any.
    pub fn peek(&self) -> Option<&ReceiptsBatch> {
        self.heap.peek()
    }

    /// Remove and return the batch with the earliest timeout.
    pub fn pop(&mut self) -> Option<ReceiptsBatch> {
        self.heap.pop()
    }

    /// Remove the earliest batch if its timeout has passed. Draining a
    /// tick means calling this until it returns `None`.
    pub fn pop_ready(&mut self, now: DateTime<Utc>) -> Option<ReceiptsBatch> {
        if self.peek().is_some_and(|batch| batch.timeout <= now) {
            self.heap.pop()
        } else {
            None
        }
    }

    /// Number of pending batches.
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Whether the queue holds no batches.
    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
