//! Startup gate.
//!
//! Runs the safety checks in order and produces a [`Datastore`] only when all
//! of them pass:
//!
//! 1. resolve the control, write, and read endpoints
//! 2. check endpoint separation (skipped in debug mode)
//! 3. probe the read-only credential (never skipped)
//! 4. ensure the alias metadata view exists
//!
//! Any error aborts startup. There is no partially-configured datastore.

use crate::active_flag::ActiveFlagResolver;
use crate::alias_view::{AliasViewStatus, ensure_alias_view};
use crate::config::DatastoreConfig;
use crate::endpoint::{ResolvedEndpoints, resolve_endpoints};
use crate::pool::open_pool;
use crate::probe::{ProbeReport, probe};
use crate::separation::validate_endpoints;
use crate::sql::validate_identifier;
use serde::Serialize;
use sqlx::PgPool;

/// Actions the datastore API layer may expose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DatastoreAction {
    /// Create a datastore table
    DatastoreCreate,
    /// Insert or update rows
    DatastoreUpsert,
    /// Delete rows or a table
    DatastoreDelete,
    /// Structured search
    DatastoreSearch,
    /// Raw read-only SQL search; requires a verified read endpoint
    DatastoreSearchSql,
}

impl DatastoreAction {
    /// Action name as exposed by the API layer.
    pub fn name(self) -> &'static str {
        match self {
            Self::DatastoreCreate => "datastore_create",
            Self::DatastoreUpsert => "datastore_upsert",
            Self::DatastoreDelete => "datastore_delete",
            Self::DatastoreSearch => "datastore_search",
            Self::DatastoreSearchSql => "datastore_search_sql",
        }
    }
}

impl std::fmt::Display for DatastoreAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Actions available for a configuration.
///
/// Raw SQL search is only offered when a read endpoint is configured.
pub fn available_actions(read_configured: bool) -> Vec<DatastoreAction> {
    let mut actions = vec![
        DatastoreAction::DatastoreCreate,
        DatastoreAction::DatastoreUpsert,
        DatastoreAction::DatastoreDelete,
        DatastoreAction::DatastoreSearch,
    ];
    if read_configured {
        actions.push(DatastoreAction::DatastoreSearchSql);
    }
    actions
}

/// A datastore that passed every startup check.
#[derive(Debug)]
pub struct Datastore {
    config: DatastoreConfig,
    endpoints: ResolvedEndpoints,
    write_pool: PgPool,
    probe_report: Option<ProbeReport>,
    alias_view: AliasViewStatus,
}

impl Datastore {
    /// Runs the startup gate.
    ///
    /// # Errors
    /// - `Configuration` for missing or malformed settings and for endpoints
    ///   that are not separated
    /// - `Security` if the read-only credential can write
    /// - `Database` / `Connection` for any unexpected database failure
    pub async fn configure(config: DatastoreConfig) -> crate::Result<Self> {
        validate_identifier("datastore schema", &config.schema)?;
        validate_identifier("probe table", &config.probe_table)?;

        let endpoints = resolve_endpoints(&config)?;
        validate_endpoints(&endpoints, config.debug)?;

        let probe_report = match &endpoints.read {
            Some(read) => {
                let read_pool = open_pool(read, &config.pool)?;
                let report = probe(&read_pool, &config.schema, &config.probe_table).await;
                read_pool.close().await;
                Some(report?)
            }
            None => None,
        };

        let write_pool = open_pool(&endpoints.write, &config.pool)?;
        let alias_view = ensure_alias_view_or_close(&write_pool, &config.schema).await?;

        tracing::info!(
            "Datastore configured: write={}, read={}, alias view {:?}",
            endpoints.write.identity(),
            endpoints
                .read
                .as_ref()
                .map_or_else(|| "none".to_string(), |r| r.identity().to_string()),
            alias_view
        );

        Ok(Self {
            config,
            endpoints,
            write_pool,
            probe_report,
            alias_view,
        })
    }

    /// Configuration the datastore was built from.
    pub fn config(&self) -> &DatastoreConfig {
        &self.config
    }

    /// Resolved endpoints.
    pub fn endpoints(&self) -> &ResolvedEndpoints {
        &self.endpoints
    }

    /// Pool connected as the write credential.
    pub fn write_pool(&self) -> &PgPool {
        &self.write_pool
    }

    /// Probe outcomes, when a read endpoint was probed.
    pub fn probe_report(&self) -> Option<&ProbeReport> {
        self.probe_report.as_ref()
    }

    /// What the alias view step did.
    pub fn alias_view_status(&self) -> AliasViewStatus {
        self.alias_view
    }

    /// True when a verified read endpoint is configured.
    pub fn read_enabled(&self) -> bool {
        self.endpoints.read.is_some()
    }

    /// Actions the API layer may expose for this datastore.
    pub fn available_actions(&self) -> Vec<DatastoreAction> {
        available_actions(self.read_enabled())
    }

    /// Resolver for the per-request activity flag.
    pub fn active_flag_resolver(&self) -> ActiveFlagResolver {
        ActiveFlagResolver::new(self.write_pool.clone(), self.config.schema.clone())
    }

    /// Closes the write pool.
    pub async fn close(&self) {
        self.write_pool.close().await;
    }
}

/// Runs the alias view step, closing `pool` if it fails.
async fn ensure_alias_view_or_close(pool: &PgPool, schema: &str) -> crate::Result<AliasViewStatus> {
    match ensure_alias_view(pool, schema).await {
        Ok(status) => Ok(status),
        Err(e) => {
            pool.close().await;
            Err(e)
        }
    }
}
