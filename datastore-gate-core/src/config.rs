//! Datastore configuration.
//!
//! `DatastoreConfig` is built once, from a flat key/value mapping or through
//! builder methods, and then passed by reference to every gate. Nothing in
//! this crate mutates it afterwards.

use crate::error::DatastoreError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Application (control) database DSN.
pub const CONTROL_URL_KEY: &str = "sqlalchemy.url";
/// Datastore write DSN. Required.
pub const WRITE_URL_KEY: &str = "ckan.datastore_write_url";
/// Datastore read-only DSN.
pub const READ_URL_KEY: &str = "ckan.datastore_read_url";
/// Bypass flag for the separation check.
pub const DEBUG_KEY: &str = "debug";
/// Name of the pre-provisioned probe table.
pub const PROBE_TABLE_KEY: &str = "ckan.datastore.probe_table";
/// Schema holding datastore tables.
pub const SCHEMA_KEY: &str = "ckan.datastore.schema";

/// Probe table created by deployment tooling for the read permission check.
pub const DEFAULT_PROBE_TABLE: &str = "writetest";
/// Default datastore schema.
pub const DEFAULT_SCHEMA: &str = "public";

/// Datastore gate configuration.
///
/// # Security
/// DSNs carry credentials. `Display` never prints them, `Debug` is
/// implemented by hand to redact passwords, and the type is not
/// serializable.
#[derive(Clone)]
pub struct DatastoreConfig {
    /// Control (application) database DSN
    pub control_url: Option<String>,
    /// Write DSN; required at resolution time
    pub write_url: Option<String>,
    /// Read-only DSN
    pub read_url: Option<String>,
    /// Skip the endpoint separation check (never skips the permission probe)
    pub debug: bool,
    /// Probe table used by both probe statements
    pub probe_table: String,
    /// Schema the datastore lives in
    pub schema: String,
    /// Pool settings shared by the write and read pools
    pub pool: PoolConfig,
}

impl Default for DatastoreConfig {
    fn default() -> Self {
        Self {
            control_url: None,
            write_url: None,
            read_url: None,
            debug: false,
            probe_table: DEFAULT_PROBE_TABLE.to_string(),
            schema: DEFAULT_SCHEMA.to_string(),
            pool: PoolConfig::default(),
        }
    }
}

impl std::fmt::Debug for DatastoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let redact = |url: &Option<String>| url.as_deref().map(crate::error::redact_database_url);
        f.debug_struct("DatastoreConfig")
            .field("control_url", &redact(&self.control_url))
            .field("write_url", &redact(&self.write_url))
            .field("read_url", &redact(&self.read_url))
            .field("debug", &self.debug)
            .field("probe_table", &self.probe_table)
            .field("schema", &self.schema)
            .field("pool", &self.pool)
            .finish()
    }
}

impl std::fmt::Display for DatastoreConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "DatastoreConfig(schema={}, probe_table={}, read={}, debug={})",
            self.schema,
            self.probe_table,
            if self.read_url.is_some() { "configured" } else { "none" },
            self.debug
        )
    }
}

impl DatastoreConfig {
    /// Creates a config with only the write DSN set.
    pub fn new(write_url: impl Into<String>) -> Self {
        Self {
            write_url: non_blank(write_url.into()),
            ..Default::default()
        }
    }

    /// Builds a config from a flat settings mapping.
    ///
    /// Blank values are treated as absent, so a read key declared with an
    /// empty value means no read endpoint is configured.
    ///
    /// # Errors
    /// Returns a configuration error if the debug flag is not a boolean.
    ///
    /// # Example
    /// ```rust
    /// use std::collections::HashMap;
    /// use datastore_gate_core::config::{DatastoreConfig, READ_URL_KEY, WRITE_URL_KEY};
    ///
    /// let settings = HashMap::from([
    ///     (WRITE_URL_KEY.to_string(), "postgres://writer@db/datastore".to_string()),
    ///     (READ_URL_KEY.to_string(), "   ".to_string()),
    /// ]);
    /// let config = DatastoreConfig::from_settings(&settings).unwrap();
    /// assert!(config.read_url.is_none());
    /// ```
    pub fn from_settings(settings: &HashMap<String, String>) -> crate::Result<Self> {
        let value = |key: &str| {
            settings
                .get(key)
                .map(|v| v.trim())
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        let debug = match value(DEBUG_KEY) {
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                DatastoreError::configuration(format!(
                    "'{}' must be a boolean, got '{}'",
                    DEBUG_KEY, raw
                ))
            })?,
            None => false,
        };

        Ok(Self {
            control_url: value(CONTROL_URL_KEY),
            write_url: value(WRITE_URL_KEY),
            read_url: value(READ_URL_KEY),
            debug,
            probe_table: value(PROBE_TABLE_KEY).unwrap_or_else(|| DEFAULT_PROBE_TABLE.to_string()),
            schema: value(SCHEMA_KEY).unwrap_or_else(|| DEFAULT_SCHEMA.to_string()),
            pool: PoolConfig::default(),
        })
    }

    /// Builder method to set the control DSN.
    pub fn with_control_url(mut self, url: impl Into<String>) -> Self {
        self.control_url = non_blank(url.into());
        self
    }

    /// Builder method to set the read DSN. Blank values clear it.
    pub fn with_read_url(mut self, url: impl Into<String>) -> Self {
        self.read_url = non_blank(url.into());
        self
    }

    /// Builder method to set the debug bypass flag.
    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }

    /// Builder method to set the probe table name.
    pub fn with_probe_table(mut self, table: impl Into<String>) -> Self {
        self.probe_table = table.into();
        self
    }

    /// Builder method to set the datastore schema.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    /// Builder method to set pool settings.
    pub fn with_pool(mut self, pool: PoolConfig) -> Self {
        self.pool = pool;
        self
    }

    /// Returns true when a read endpoint is actually configured.
    pub fn has_read_url(&self) -> bool {
        self.read_url.as_deref().is_some_and(|u| !u.trim().is_empty())
    }
}

fn non_blank(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Some(true),
        "false" | "0" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// Connection pool settings for datastore endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Connection acquire timeout
    pub connect_timeout: Duration,
    /// Per-statement timeout applied to every session
    pub statement_timeout: Duration,
    /// Maximum number of connections in pool
    pub max_connections: u32,
    /// Idle timeout for pooled connections
    pub idle_timeout: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            statement_timeout: Duration::from_secs(30),
            max_connections: 10,
            idle_timeout: Some(Duration::from_secs(600)),
        }
    }
}

impl PoolConfig {
    /// Validates pool parameters.
    ///
    /// # Errors
    /// Returns error if configuration values are invalid or unsafe
    pub fn validate(&self) -> crate::Result<()> {
        if self.max_connections == 0 {
            return Err(DatastoreError::configuration(
                "max_connections must be greater than 0",
            ));
        }

        if self.max_connections > 100 {
            return Err(DatastoreError::configuration(
                "max_connections should not exceed 100 for safety",
            ));
        }

        if self.connect_timeout.is_zero() {
            return Err(DatastoreError::configuration(
                "connect_timeout must be greater than 0",
            ));
        }

        if self.statement_timeout.as_millis() == 0 {
            return Err(DatastoreError::configuration(
                "statement_timeout must be greater than 0",
            ));
        }

        Ok(())
    }

    /// Builder method to set the maximum pool size.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Builder method to set the acquire timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}
