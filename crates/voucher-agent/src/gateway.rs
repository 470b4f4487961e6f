// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! HTTP client for the gateway's receipt-exchange endpoints.
//!
//! The three endpoints are derived from a single configured base URL:
//! only its scheme and host (and port) are kept, the path is replaced
//! with `collect-receipts`, `voucher` or `partial-voucher`. Payloads are
//! raw batch encodings, responses are JSON.

use std::time::Duration;

use alloy_primitives::{Address, Bytes};
use bigdecimal::num_bigint::BigInt;
use reqwest::header::CONTENT_TYPE;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::models::{decimal_string, Voucher};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// An interim aggregate over a contiguous range of receipt ids, used to
/// build a full voucher without resending all receipts.
///
/// Partial vouchers are never persisted; they live in memory only while
/// a chunked collection is in flight.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialVoucher {
    /// The allocation the aggregate covers.
    pub allocation: Address,
    /// Aggregate fee amount in wei.
    #[serde(with = "decimal_string")]
    pub fees: BigInt,
    /// Gateway signature over the aggregate.
    pub signature: Bytes,
    /// Smallest receipt id covered by the aggregate.
    pub receipt_id_min: Bytes,
    /// Largest receipt id covered by the aggregate.
    pub receipt_id_max: Bytes,
}

/// Gateway exchange failure. Always retryable: the receipts involved
/// stay in the database and a later cycle repeats the exchange.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// The configured endpoint has no host to derive endpoints from.
    #[error("gateway endpoint {0} is not a valid base URL")]
    InvalidEndpoint(Url),
    /// Transport failure or non-2xx response.
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Client for the gateway's three receipt-exchange endpoints.
#[derive(Clone, Debug)]
pub struct GatewayClient {
    client: reqwest::Client,
    collect_receipts_endpoint: Url,
    voucher_endpoint: Url,
    partial_voucher_endpoint: Url,
}

impl GatewayClient {
    /// Build a client from the configured gateway base URL.
    pub fn new(gateway_endpoint: &Url) -> Result<Self, GatewayError> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
            collect_receipts_endpoint: derive_endpoint(gateway_endpoint, "collect-receipts")?,
            voucher_endpoint: derive_endpoint(gateway_endpoint, "voucher")?,
            partial_voucher_endpoint: derive_endpoint(gateway_endpoint, "partial-voucher")?,
        })
    }

    /// Exchange an entire receipt batch for a final voucher in one shot.
    pub async fn collect_receipts(&self, payload: Vec<u8>) -> Result<Voucher, GatewayError> {
        Ok(self
            .post(&self.collect_receipts_endpoint, payload)
            .await?
            .json()
            .await?)
    }

    /// Exchange one contiguous chunk of receipts for a partial voucher.
    pub async fn partial_voucher(&self, payload: Vec<u8>) -> Result<PartialVoucher, GatewayError> {
        Ok(self
            .post(&self.partial_voucher_endpoint, payload)
            .await?
            .json()
            .await?)
    }

    /// Exchange a batch of partial vouchers for the final voucher.
    pub async fn voucher(&self, payload: Vec<u8>) -> Result<Voucher, GatewayError> {
        Ok(self
            .post(&self.voucher_endpoint, payload)
            .await?
            .json()
            .await?)
    }

    async fn post(&self, endpoint: &Url, payload: Vec<u8>) -> Result<reqwest::Response, GatewayError> {
        let response = self
            .client
            .post(endpoint.clone())
            .header(CONTENT_TYPE, "application/octet-stream")
            .body(payload)
            .send()
            .await?;
        Ok(response.error_for_status()?)
    }
}

/// Keep only scheme and host from the configured URL and set the path.
fn derive_endpoint(base: &Url, path: &str) -> Result<Url, GatewayError> {
    if base.host().is_none() {
        return Err(GatewayError::InvalidEndpoint(base.clone()));
    }
    let mut endpoint = base.clone();
    endpoint.set_path(path);
    endpoint.set_query(None);
    endpoint.set_fragment(None);
    Ok(endpoint)
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{
        matchers::{header, method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::test::test_allocation;

    #[test]
    fn endpoints_keep_only_scheme_and_host() {
        let base = Url::parse("https://gateway.example.com:8030/api/fees?key=abc#frag").unwrap();
        assert_eq!(
            derive_endpoint(&base, "collect-receipts").unwrap().as_str(),
            "https://gateway.example.com:8030/collect-receipts"
        );
        assert_eq!(
            derive_endpoint(&base, "voucher").unwrap().as_str(),
            "https://gateway.example.com:8030/voucher"
        );
        assert_eq!(
            derive_endpoint(&base, "partial-voucher").unwrap().as_str(),
            "https://gateway.example.com:8030/partial-voucher"
        );
    }

    #[tokio::test]
    async fn collect_receipts_posts_payload_and_decodes_voucher() {
        let mock_server = MockServer::start().await;
        let allocation = test_allocation(0xaa);
        Mock::given(method("POST"))
            .and(path("/collect-receipts"))
            .and(header("content-type", "application/octet-stream"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": allocation,
                "amount": "60",
                "signature": "0x0102",
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = GatewayClient::new(&Url::parse(&mock_server.uri()).unwrap()).unwrap();
        let voucher = client.collect_receipts(vec![0u8; 132]).await.unwrap();
        assert_eq!(voucher.allocation, allocation);
        assert_eq!(voucher.amount, BigInt::from(60));
        assert_eq!(voucher.signature, Bytes::from(vec![0x01, 0x02]));
    }

    #[tokio::test]
    async fn partial_voucher_decodes_response() {
        let mock_server = MockServer::start().await;
        let allocation = test_allocation(0xbb);
        Mock::given(method("POST"))
            .and(path("/partial-voucher"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "allocation": allocation,
                "fees": "123456789",
                "signature": "0x03",
                "receipt_id_min": "0x01",
                "receipt_id_max": "0x02",
            })))
            .mount(&mock_server)
            .await;

        let client = GatewayClient::new(&Url::parse(&mock_server.uri()).unwrap()).unwrap();
        let partial = client.partial_voucher(vec![0u8; 132]).await.unwrap();
        assert_eq!(partial.allocation, allocation);
        assert_eq!(partial.fees, BigInt::from(123_456_789));
    }

    #[tokio::test]
    async fn non_2xx_is_a_retryable_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/voucher"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let client = GatewayClient::new(&Url::parse(&mock_server.uri()).unwrap()).unwrap();
        let result = client.voucher(vec![0u8; 148]).await;
        assert!(matches!(result, Err(GatewayError::Request(_))));
    }
}
