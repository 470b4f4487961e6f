// Copyright 2023-, Edge & Node, GraphOps, and Semiotic Labs.
// SPDX-License-Identifier: Apache-2.0

//! Database connection helper.

use std::time::Duration;

use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::debug;

use crate::config;

/// Open a connection pool against the configured database.
pub async fn connect(config: &config::Postgres) -> Result<PgPool, sqlx::Error> {
    debug!(
        postgres_host = %config.postgres_host,
        postgres_port = config.postgres_port,
        postgres_database = %config.postgres_database,
        "Connecting to database"
    );
    let options = PgConnectOptions::new()
        .host(&config.postgres_host)
        .port(config.postgres_port)
        .database(&config.postgres_database)
        .username(&config.postgres_username)
        .password(&config.postgres_password);
    PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(3))
        .connect_with(options)
        .await
}
