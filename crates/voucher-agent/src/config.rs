// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Agent configuration, loaded from a TOML file merged over defaults.
//!
//! Thresholds are given in whole tokens and converted to wei at load
//! time, so the rest of the crate only ever deals in wei.

use std::path::Path;

use anyhow::Result;
use bigdecimal::{num_bigint::BigInt, num_bigint::ToBigInt, BigDecimal};
use figment::{
    providers::{Format, Toml},
    Figment,
};
use serde::{de, Deserialize, Deserializer};
use tracing::subscriber::{set_global_default, SetGlobalDefaultError};
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use url::Url;

/// Top-level agent configuration.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Gateway connectivity.
    pub gateway: Gateway,
    /// Voucher redemption economics.
    pub vouchers: Vouchers,
    /// Database connectivity.
    pub postgres: Postgres,
    /// Observability knobs.
    pub metrics: Metrics,
}

/// Gateway connectivity.
#[derive(Clone, Debug, Deserialize)]
pub struct Gateway {
    /// Base URL of the gateway; only its scheme and host are used.
    pub gateway_endpoint: Url,
}

/// Voucher redemption economics.
#[derive(Clone, Debug, Deserialize)]
pub struct Vouchers {
    /// Minimum per-voucher amount (in tokens) worth redeeming on chain.
    #[serde(deserialize_with = "parse_token_value_to_wei")]
    pub voucher_redemption_threshold: BigInt,
    /// Minimum total batch amount (in tokens) before submitting on chain.
    #[serde(deserialize_with = "parse_token_value_to_wei")]
    pub voucher_redemption_batch_threshold: BigInt,
    /// Hard cap on vouchers per on-chain call and per database load.
    pub voucher_redemption_max_batch_size: usize,
}

/// Database connectivity.
#[derive(Clone, Debug, Deserialize)]
pub struct Postgres {
    /// Database host.
    pub postgres_host: String,
    /// Database port.
    pub postgres_port: u16,
    /// Database name.
    pub postgres_database: String,
    /// Database user.
    pub postgres_username: String,
    /// Database password.
    pub postgres_password: String,
}

/// Observability knobs.
#[derive(Clone, Debug, Deserialize)]
pub struct Metrics {
    /// Port the `/metrics` endpoint is served on.
    pub metrics_port: u16,
    /// Log filter applied when `RUST_LOG` is not set.
    pub log_level: Option<String>,
}

fn parse_token_value_to_wei<'de, D>(deserializer: D) -> Result<BigInt, D::Error>
where
    D: Deserializer<'de>,
{
    let value = BigDecimal::deserialize(deserializer)?;
    if value < BigDecimal::from(0) {
        return Err(de::Error::custom("token value cannot be negative"));
    }
    let wei = value * BigDecimal::from(10u64.pow(18));
    wei.to_bigint()
        .ok_or_else(|| de::Error::custom("token value has more than 18 decimal places"))
}

impl Config {
    /// Load the configuration file, filling unset fields from defaults.
    pub fn load(filename: &Path) -> Result<Self> {
        let config_defaults = r##"
            [vouchers]
            voucher_redemption_threshold = 200
            voucher_redemption_batch_threshold = 2000
            voucher_redemption_max_batch_size = 100

            [postgres]
            postgres_port = 5432

            [metrics]
            metrics_port = 7300
            log_level = "info"
        "##;

        let config_str = std::fs::read_to_string(filename)?;
        let config: Config = Figment::new()
            .merge(Toml::string(config_defaults))
            .merge(Toml::string(&config_str))
            .extract()?;
        Ok(config)
    }
}

/// Set up tracing; `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(format: &str) -> Result<(), SetGlobalDefaultError> {
    let filter = EnvFilter::from_default_env();
    let builder = FmtSubscriber::builder().with_env_filter(filter);
    match format {
        "json" => set_global_default(builder.json().finish()),
        "compact" => set_global_default(builder.compact().finish()),
        _ => set_global_default(builder.finish()),
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use super::*;

    fn parse_wei(input: serde_json::Value) -> Result<BigInt, String> {
        parse_token_value_to_wei(input).map_err(|e: serde_json::Error| e.to_string())
    }

    #[test]
    fn token_values_convert_to_wei() {
        assert_eq!(
            parse_wei(serde_json::json!("1")).unwrap(),
            BigInt::from_str("1000000000000000000").unwrap()
        );
        assert_eq!(
            parse_wei(serde_json::json!("1.1")).unwrap(),
            BigInt::from_str("1100000000000000000").unwrap()
        );
        assert_eq!(
            parse_wei(serde_json::json!("0.000000000000000001")).unwrap(),
            BigInt::from(1)
        );
        assert_eq!(parse_wei(serde_json::json!(200)).unwrap(), BigInt::from(200) * BigInt::from(10u64.pow(18)));
        assert_eq!(parse_wei(serde_json::json!("0")).unwrap(), BigInt::from(0));
        assert!(parse_wei(serde_json::json!("-1")).unwrap_err().contains("negative"));
    }

    #[test]
    fn minimal_config_fills_defaults() {
        let dir = std::env::temp_dir().join("voucher-agent-config-test");
        std::fs::create_dir_all(&dir).unwrap();
        let file = dir.join("minimal.toml");
        std::fs::write(
            &file,
            r#"
                [gateway]
                gateway_endpoint = "https://gateway.example.com/fees"

                [postgres]
                postgres_host = "localhost"
                postgres_database = "indexer"
                postgres_username = "indexer"
                postgres_password = "secret"
            "#,
        )
        .unwrap();

        let config = Config::load(&file).unwrap();
        assert_eq!(config.vouchers.voucher_redemption_max_batch_size, 100);
        assert_eq!(
            config.vouchers.voucher_redemption_threshold,
            BigInt::from_str("200000000000000000000").unwrap()
        );
        assert_eq!(config.postgres.postgres_port, 5432);
        assert_eq!(config.metrics.metrics_port, 7300);
    }
}
