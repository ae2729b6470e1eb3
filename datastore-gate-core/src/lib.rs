//! Startup safety gates for an externally readable PostgreSQL datastore.
//!
//! The datastore sits next to the application's own database and is exposed
//! to API consumers through a read-only credential. This crate verifies that
//! arrangement before the service starts and keeps a little catalog metadata
//! available afterwards.
//!
//! # Security Guarantees
//! - The read endpoint never shares a database with the application
//! - The read-only credential is probed with real writes, always rolled back
//! - Any unrecognized failure aborts startup (fail closed)
//! - Connection strings are redacted in every log line and error
//!
//! # Architecture
//! - `config` / `endpoint`: configuration and endpoint identities
//! - `separation`: endpoint separation rules
//! - `probe`: read permission probe
//! - `alias_view`: `_table_metadata` view over the catalogs
//! - `active_flag`: per-request `datastore_active` flag
//! - `gate`: the ordered startup sequence

pub mod active_flag;
pub mod alias_view;
pub mod config;
pub mod endpoint;
pub mod error;
pub mod gate;
pub mod logging;
pub mod pool;
pub mod probe;
pub mod separation;
pub mod sql;

// Re-export commonly used types
pub use active_flag::{ActiveFlagResolver, DescribeError, ResourceDescriber, ResourceDescriptor};
pub use alias_view::{ALIAS_VIEW_NAME, AliasViewStatus, CatalogDependency, ensure_alias_view};
pub use config::{DatastoreConfig, PoolConfig};
pub use endpoint::{ConnectionEndpoint, EndpointIdentity, EndpointRole, resolve_endpoints};
pub use error::{DatastoreError, Result};
pub use gate::{Datastore, DatastoreAction, available_actions};
pub use logging::init_logging;
pub use probe::{ExpectedFailure, ProbeOutcome, ProbeReport, probe};
