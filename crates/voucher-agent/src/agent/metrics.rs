// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Metrics for the collection and redemption pipelines, registered on the
//! default prometheus registry.

use prometheus::{
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram_vec, CounterVec,
    Gauge, GaugeVec, HistogramVec,
};

lazy_static::lazy_static! {
    pub static ref RECEIPTS_TO_COLLECT: GaugeVec = register_gauge_vec!(
        "receipts_to_collect",
        "Receipts queued for collection",
        &["allocation"]
    )
    .unwrap();
    pub static ref RECEIPTS_FAILED: CounterVec = register_counter_vec!(
        "receipts_failed",
        "Receipts that failed the gateway exchange",
        &["allocation"]
    )
    .unwrap();
    pub static ref VOUCHERS_TO_EXCHANGE: GaugeVec = register_gauge_vec!(
        "vouchers_to_exchange",
        "Partial vouchers awaiting the final voucher exchange",
        &["allocation"]
    )
    .unwrap();
    pub static ref RECEIPTS_EXCHANGE_DURATION: HistogramVec = register_histogram_vec!(
        "receipts_exchange_duration",
        "Duration of the receipts-for-voucher exchange in seconds",
        &["allocation"]
    )
    .unwrap();
    pub static ref VOUCHERS: CounterVec = register_counter_vec!(
        "vouchers",
        "Vouchers obtained from the gateway",
        &["allocation"]
    )
    .unwrap();
    pub static ref VOUCHER_EXCHANGES_OK: CounterVec = register_counter_vec!(
        "voucher_exchanges_ok",
        "Successful gateway exchanges",
        &["allocation"]
    )
    .unwrap();
    pub static ref VOUCHER_EXCHANGES_INVALID: CounterVec = register_counter_vec!(
        "voucher_exchanges_invalid",
        "Voucher redemptions refused by the transaction manager",
        &["allocation"]
    )
    .unwrap();
    pub static ref VOUCHER_REDEEMS_FAILED: CounterVec = register_counter_vec!(
        "voucher_redeems_failed",
        "Failed on-chain voucher redemptions",
        &["allocation"]
    )
    .unwrap();
    pub static ref VOUCHERS_REDEEM_DURATION: HistogramVec = register_histogram_vec!(
        "vouchers_redeem_duration",
        "Duration of on-chain voucher redemption in seconds",
        &["allocation"]
    )
    .unwrap();
    pub static ref VOUCHERS_REDEEM: Gauge = register_gauge!(
        "vouchers_redeem",
        "Vouchers in the redemption batch currently being submitted"
    )
    .unwrap();
    pub static ref VOUCHER_COLLECTED_FEES: GaugeVec = register_gauge_vec!(
        "voucher_collected_fees",
        "Total fees collected into vouchers per allocation",
        &["allocation"]
    )
    .unwrap();
}
