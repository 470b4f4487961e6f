// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Interfaces towards the on-chain collaborators.
//!
//! The enclosing agent owns chain connectivity and signing; this crate
//! only drives the allocation exchange contract through these traits.
//! Transactions follow estimate-then-send gas discipline: the
//! transaction manager first calls [`ChainTransaction::estimate_gas`],
//! then caps [`ChainTransaction::send`] with the estimate.

use alloy_primitives::{hex::ToHexExt, Address, B256, U256};
use async_trait::async_trait;

use crate::models::Voucher;

/// One entry of the `redeemMany` call data, all fields 0x-prefixed hex.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RedeemableVoucher {
    /// Allocation id, 0x-prefixed lowercase hex.
    pub allocation_id: String,
    /// Voucher amount in wei, 0x-prefixed hex.
    pub amount: String,
    /// Gateway signature, 0x-prefixed hex.
    pub signature: String,
}

impl From<&Voucher> for RedeemableVoucher {
    fn from(voucher: &Voucher) -> Self {
        Self {
            allocation_id: voucher.allocation.encode_hex_with_prefix(),
            amount: format!("{:#x}", voucher.amount),
            signature: voucher.signature.to_string(),
        }
    }
}

/// Build the `redeemMany` call data for a batch of vouchers.
pub fn redeem_payload(vouchers: &[Voucher]) -> Vec<RedeemableVoucher> {
    vouchers.iter().map(RedeemableVoucher::from).collect()
}

/// Result of running a transaction through the transaction manager.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TransactionOutcome {
    /// The transaction was mined; hash of the chain receipt.
    Confirmed(B256),
    /// The contract is paused; nothing was sent.
    Paused,
    /// The operator is not authorized for this call; nothing was sent.
    Unauthorized,
}

/// An on-chain call under estimate-then-send gas discipline.
#[async_trait]
pub trait ChainTransaction: Send + Sync {
    /// Estimate the gas the call will consume.
    async fn estimate_gas(&self) -> anyhow::Result<U256>;
    /// Send the call with the given gas cap.
    async fn send(&self, gas_limit: U256) -> anyhow::Result<B256>;
}

/// Executes on-chain calls on behalf of the agent.
#[async_trait]
pub trait TransactionManager: Send + Sync {
    /// Execute `transaction`, returning the chain receipt hash or a
    /// sentinel when the contract is paused or the operator unauthorized.
    async fn execute(
        &self,
        description: &str,
        transaction: &dyn ChainTransaction,
    ) -> anyhow::Result<TransactionOutcome>;
}

/// The allocation exchange contract.
#[async_trait]
pub trait AllocationExchange: Send + Sync {
    /// Whether the allocation's voucher has already been redeemed.
    async fn allocations_redeemed(&self, allocation: Address) -> anyhow::Result<bool>;
    /// `estimateGas.redeemMany`.
    async fn estimate_gas_redeem_many(
        &self,
        vouchers: &[RedeemableVoucher],
    ) -> anyhow::Result<U256>;
    /// `redeemMany` with an explicit gas limit.
    async fn redeem_many(
        &self,
        vouchers: &[RedeemableVoucher],
        gas_limit: U256,
    ) -> anyhow::Result<B256>;
}

/// `redeemMany` on the allocation exchange, reified as a transaction the
/// transaction manager can estimate and send.
pub struct RedeemManyTransaction<'a> {
    exchange: &'a dyn AllocationExchange,
    vouchers: &'a [RedeemableVoucher],
}

impl<'a> RedeemManyTransaction<'a> {
    /// Wrap a voucher batch for submission through `exchange`.
    pub fn new(exchange: &'a dyn AllocationExchange, vouchers: &'a [RedeemableVoucher]) -> Self {
        Self { exchange, vouchers }
    }
}

#[async_trait]
impl ChainTransaction for RedeemManyTransaction<'_> {
    async fn estimate_gas(&self) -> anyhow::Result<U256> {
        self.exchange.estimate_gas_redeem_many(self.vouchers).await
    }

    async fn send(&self, gas_limit: U256) -> anyhow::Result<B256> {
        self.exchange.redeem_many(self.vouchers, gas_limit).await
    }
}
