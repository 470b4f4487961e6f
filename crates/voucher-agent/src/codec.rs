// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Deterministic binary encodings for the gateway exchange.
//!
//! A receipt batch encodes to `20 + 112 * n` bytes, a partial-voucher
//! batch to `20 + 128 * n`: the shared allocation id first, then one
//! fixed-width record per entry. Fee amounts are big-endian unsigned
//! integers left-zero-padded to 33 bytes, so the largest encodable fee is
//! `2^264 - 1`.

use alloy_primitives::Address;
use bigdecimal::num_bigint::{BigInt, Sign};
use thiserror::Error;

use crate::{gateway::PartialVoucher, models::AllocationReceipt};

/// Width of the shared allocation id prefix.
const ALLOCATION_WIDTH: usize = 20;
/// Width of a fee amount slot.
const FEES_WIDTH: usize = 33;
/// Bytes occupied by one receipt record: fees, id, signature.
const RECEIPT_WIDTH: usize = FEES_WIDTH + 15 + 64;
/// Bytes occupied by one partial-voucher record: fees, signature, id range.
const PARTIAL_VOUCHER_WIDTH: usize = FEES_WIDTH + 32 + 32 + 32;

/// Rejected field while encoding a batch payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// A field's natural byte length exceeds its slot.
    #[error("value of {len} bytes does not fit a {width} byte field")]
    Overflow {
        /// Natural byte length of the offending value.
        len: usize,
        /// Slot width in bytes.
        width: usize,
    },
    /// Fee amounts are unsigned.
    #[error("fee amounts cannot be negative")]
    NegativeFees,
}

/// Fixed-layout byte stream writer.
///
/// Fields shorter than their slot are left-padded with zeros; fields
/// longer than their slot are rejected.
struct BytesWriter {
    buf: Vec<u8>,
}

impl BytesWriter {
    fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    fn write_address(&mut self, address: &Address) {
        self.buf.extend_from_slice(address.as_slice());
    }

    fn write_padded(&mut self, bytes: &[u8], width: usize) -> Result<(), CodecError> {
        if bytes.len() > width {
            return Err(CodecError::Overflow {
                len: bytes.len(),
                width,
            });
        }
        self.buf.resize(self.buf.len() + (width - bytes.len()), 0);
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Write a non-negative big integer big-endian into a `width`-byte slot.
    fn write_uint(&mut self, value: &BigInt, width: usize) -> Result<(), CodecError> {
        let (sign, bytes) = value.to_bytes_be();
        if sign == Sign::Minus {
            return Err(CodecError::NegativeFees);
        }
        // to_bytes_be() omits leading zero bytes, except for zero itself
        // which encodes as a single 0x00; padding absorbs both.
        self.write_padded(&bytes, width)
    }

    fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Encode a batch of receipts sharing one allocation, in the order given.
///
/// This is the payload for both `collect-receipts` and `partial-voucher`.
/// Callers pass receipts in ascending id order; the encoding preserves it.
pub fn encode_receipt_batch(
    allocation: &Address,
    receipts: &[AllocationReceipt],
) -> Result<Vec<u8>, CodecError> {
    debug_assert!(!receipts.is_empty(), "empty receipt batch");
    let mut writer =
        BytesWriter::with_capacity(ALLOCATION_WIDTH + RECEIPT_WIDTH * receipts.len());
    writer.write_address(allocation);
    for receipt in receipts {
        writer.write_uint(&receipt.fees, FEES_WIDTH)?;
        writer.write_padded(receipt.id.as_slice(), 15)?;
        writer.write_padded(receipt.signature.as_slice(), 64)?;
    }
    Ok(writer.into_bytes())
}

/// Encode a batch of partial vouchers sharing one allocation.
///
/// This is the payload for the final `voucher` exchange of a chunked
/// collection.
pub fn encode_partial_voucher_batch(
    allocation: &Address,
    partial_vouchers: &[PartialVoucher],
) -> Result<Vec<u8>, CodecError> {
    debug_assert!(!partial_vouchers.is_empty(), "empty partial voucher batch");
    let mut writer = BytesWriter::with_capacity(
        ALLOCATION_WIDTH + PARTIAL_VOUCHER_WIDTH * partial_vouchers.len(),
    );
    writer.write_address(allocation);
    for partial_voucher in partial_vouchers {
        writer.write_uint(&partial_voucher.fees, FEES_WIDTH)?;
        writer.write_padded(&partial_voucher.signature, 32)?;
        writer.write_padded(&partial_voucher.receipt_id_min, 32)?;
        writer.write_padded(&partial_voucher.receipt_id_max, 32)?;
    }
    Ok(writer.into_bytes())
}
