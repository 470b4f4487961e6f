// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Entities of the query-fee bookkeeping: receipts, per-allocation
//! summaries and gateway-signed vouchers.
//!
//! Allocation ids are carried as typed [`Address`] values everywhere;
//! the canonical text form (lowercase hex, `0x`-prefixed) only exists at
//! the database and metrics boundary. Parsing accepts any case, with or
//! without the prefix.

use alloy_primitives::{hex::ToHexExt, Address, Bytes, FixedBytes};
use bigdecimal::num_bigint::BigInt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a single receipt, unique per allocation.
///
/// Receipt ids order the canonical batch encoding: ascending id order in
/// the database equals ascending byte order of this value.
pub type ReceiptId = FixedBytes<15>;

/// Canonical text form of an allocation id, used as a database key and as
/// a metrics label.
pub fn allocation_key(allocation: &Address) -> String {
    allocation.encode_hex_with_prefix()
}

/// A signed micropayment receipt for queries served under an allocation.
///
/// Receipts are created by the query-serving path and destroyed atomically
/// once exchanged for a voucher.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationReceipt {
    /// Receipt identifier.
    pub id: ReceiptId,
    /// The allocation the receipt was issued against.
    pub allocation: Address,
    /// Fee amount in wei. Non-negative, fits in 33 big-endian bytes.
    pub fees: BigInt,
    /// Counterparty signature over the receipt.
    pub signature: FixedBytes<64>,
}

/// Per-allocation bookkeeping row tracking lifecycle timestamps and
/// cumulative fee totals.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocationSummary {
    /// The allocation this summary describes.
    pub allocation: Address,
    /// When the allocation was closed; `None` while it is still open.
    pub closed_at: Option<DateTime<Utc>>,
    /// Total fees collected into vouchers so far. Never decreases.
    pub collected_fees: BigInt,
    /// Total fees redeemed on chain so far. Never decreases.
    pub withdrawn_fees: BigInt,
}

/// A gateway-signed aggregate claim, redeemable on chain for the sum of
/// the receipts it replaced.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Voucher {
    /// The allocation the voucher redeems fees for.
    pub allocation: Address,
    /// Aggregate fee amount in wei.
    #[serde(with = "decimal_string")]
    pub amount: BigInt,
    /// Gateway signature over the claim.
    pub signature: Bytes,
}

/// Serde helpers carrying big integers as decimal strings, the form used
/// by the gateway JSON bodies and the persistence schema.
pub mod decimal_string {
    use std::str::FromStr;

    use bigdecimal::num_bigint::BigInt;
    use serde::{de, Deserialize, Deserializer, Serializer};

    /// Serialize a big integer as its decimal string representation.
    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    /// Deserialize a big integer from a decimal string.
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let value = String::deserialize(deserializer)?;
        BigInt::from_str(&value).map_err(de::Error::custom)
    }
}
