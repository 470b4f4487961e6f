// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Receipt collection and voucher redemption for an indexer agent.
//!
//! Off-chain, the agent accumulates signed micropayment receipts from a
//! gateway for queries served under an allocation. When the allocation
//! closes, this crate queues the receipts, exchanges them with the
//! gateway for a signed voucher after a settling delay (in one shot, or
//! chunked through partial vouchers for very large batches), and later
//! redeems collected vouchers on chain in economically sized batches.
//!
//! The crate is embedded by the indexer agent, which supplies the
//! database pool, its transaction manager and the allocation exchange
//! contract handle:
//!
//! ```ignore
//! let store = Arc::new(PgStore::new(pool));
//! let collector = Arc::new(ReceiptCollector::new(store.clone(), gateway));
//! let redeemer = Arc::new(VoucherRedeemer::new(store, tx_manager, exchange, policy));
//! let agent = Agent::start(collector, redeemer).await?;
//! ```

pub mod agent;
pub mod chain;
pub mod codec;
pub mod config;
/// Database connection helper.
pub mod database;
pub mod error;
pub mod gateway;
/// Prometheus metrics endpoint.
pub mod metrics;
pub mod models;
pub mod store;
