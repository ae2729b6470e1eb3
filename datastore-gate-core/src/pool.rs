//! PostgreSQL connection pools for datastore endpoints.
//!
//! # Security Features
//! - Pools connect to exactly the target the separation check compared
//! - Statement and lock timeouts are applied to every pooled session
//! - Sessions are never forced read-only here: the permission probe has to
//!   observe the credential's real grants, not a session default

use crate::config::PoolConfig;
use crate::endpoint::ConnectionEndpoint;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;

/// Creates a lazily-connecting pool for an endpoint.
///
/// No connection is made until the first query, so a pool for an unreachable
/// database is created successfully and fails on use. The pool connects with
/// the endpoint's resolved options, the same ones its identity came from.
///
/// # Errors
/// Returns error if the pool configuration is invalid.
pub fn open_pool(endpoint: &ConnectionEndpoint, config: &PoolConfig) -> crate::Result<PgPool> {
    use sqlx::Executor;

    config.validate()?;

    let statement_timeout_ms = config.statement_timeout.as_millis();

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections.min(100))
        .min_connections(0)
        .acquire_timeout(config.connect_timeout)
        .idle_timeout(config.idle_timeout)
        .test_before_acquire(true)
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                conn.execute(
                    format!("SET statement_timeout = {}", statement_timeout_ms).as_str(),
                )
                .await?;
                conn.execute("SET lock_timeout = '30s'").await?;

                let app_name = format!("datastore-gate-{}", env!("CARGO_PKG_VERSION"));
                conn.execute(format!("SET application_name = '{}'", app_name).as_str())
                    .await?;

                conn.execute("SET timezone = 'UTC'").await?;
                Ok(())
            })
        })
        .connect_lazy_with(endpoint.connect_options().clone());

    tracing::debug!("Created {} pool for {}", endpoint.role(), endpoint.identity());
    Ok(pool)
}
