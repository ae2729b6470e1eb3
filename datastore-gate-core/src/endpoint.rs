//! Endpoint resolution.
//!
//! Turns the configured DSNs into [`ConnectionEndpoint`] values whose
//! [`EndpointIdentity`] says which physical database a DSN targets,
//! independent of the credentials used to reach it.
//!
//! # Security
//! - DSNs are held in `Zeroizing` containers and cleared on drop
//! - `Debug` and `Display` only ever show redacted connection details
//! - Identities come from the driver's own reading of the DSN (environment
//!   defaults, query parameters, percent-decoding), and pools connect with
//!   those same options, so the separation check compares the databases
//!   that are actually reached

use crate::config::{CONTROL_URL_KEY, DatastoreConfig, READ_URL_KEY, WRITE_URL_KEY};
use crate::error::{DatastoreError, redact_database_url};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;
use std::str::FromStr;
use url::Url;
use zeroize::Zeroizing;

/// Logical role of a configured database endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EndpointRole {
    /// The application's own database
    Control,
    /// Datastore connection with write grants
    Write,
    /// Datastore connection for read-only API consumers
    Read,
}

impl EndpointRole {
    /// Configuration key this role is read from.
    pub fn config_key(self) -> &'static str {
        match self {
            Self::Control => CONTROL_URL_KEY,
            Self::Write => WRITE_URL_KEY,
            Self::Read => READ_URL_KEY,
        }
    }
}

impl std::fmt::Display for EndpointRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Control => write!(f, "control"),
            Self::Write => write!(f, "write"),
            Self::Read => write!(f, "read"),
        }
    }
}

/// Canonical "which physical database" for a DSN.
///
/// Two DSNs for different users on the same host, port, and database have
/// equal identities.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointIdentity {
    /// Lowercased host or Unix socket directory; loopback aliases collapse
    /// to `localhost`
    pub host: String,
    /// Port as resolved by the driver
    pub port: u16,
    /// Database name; the user name when the DSN and environment name none
    pub database: String,
}

impl std::fmt::Display for EndpointIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.database)
    }
}

/// A resolved database endpoint.
pub struct ConnectionEndpoint {
    role: EndpointRole,
    identity: EndpointIdentity,
    user: String,
    options: PgConnectOptions,
    dsn: Zeroizing<String>,
}

impl std::fmt::Debug for ConnectionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEndpoint")
            .field("role", &self.role)
            .field("identity", &self.identity)
            .field("dsn", &redact_database_url(&self.dsn))
            .finish()
    }
}

impl std::fmt::Display for ConnectionEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} endpoint {}", self.role, self.identity)
    }
}

impl ConnectionEndpoint {
    /// Parses a DSN into an endpoint for the given role.
    ///
    /// Host, port, user, and database are taken from sqlx's
    /// [`PgConnectOptions`], so `PGHOST`/`PGPORT`/`PGUSER`/`PGDATABASE`
    /// defaults, `host`/`port`/`dbname`/`user` query parameters, and
    /// percent-encoded components resolve exactly as they do on connect.
    ///
    /// # Errors
    /// Returns a configuration error if the DSN is not a valid PostgreSQL
    /// URL. Error messages never contain the DSN's credentials.
    pub fn parse(role: EndpointRole, dsn: &str) -> crate::Result<Self> {
        let url = Url::parse(dsn).map_err(|e| {
            DatastoreError::configuration(format!(
                "Invalid {} connection string format: {}",
                role.config_key(),
                e
            ))
        })?;

        if !matches!(url.scheme(), "postgres" | "postgresql") {
            return Err(DatastoreError::configuration(format!(
                "{} must use postgres:// or postgresql:// scheme",
                role.config_key()
            )));
        }

        let options = PgConnectOptions::from_str(dsn).map_err(|e| {
            DatastoreError::configuration(format!(
                "Invalid {} connection string: {}",
                role.config_key(),
                e
            ))
        })?;

        if options.get_port() == 0 {
            return Err(DatastoreError::configuration(format!(
                "{} has an invalid port: must be greater than 0",
                role.config_key()
            )));
        }

        let host = match options.get_socket() {
            Some(socket) => socket.display().to_string(),
            None => canonical_host(options.get_host()),
        };
        let user = options.get_username().to_string();
        // PostgreSQL connects to a database named after the user by default.
        let database = options.get_database().unwrap_or(&user).to_string();

        Ok(Self {
            role,
            identity: EndpointIdentity {
                host,
                port: options.get_port(),
                database,
            },
            user,
            options,
            dsn: Zeroizing::new(dsn.to_string()),
        })
    }

    /// Endpoint role.
    pub fn role(&self) -> EndpointRole {
        self.role
    }

    /// Physical database identity.
    pub fn identity(&self) -> &EndpointIdentity {
        &self.identity
    }

    /// Connecting user as resolved by the driver.
    pub fn user(&self) -> &str {
        &self.user
    }

    /// Options pools connect with; the identity was computed from these.
    pub fn connect_options(&self) -> &PgConnectOptions {
        &self.options
    }

    /// DSN with the password masked.
    pub fn redacted(&self) -> String {
        redact_database_url(&self.dsn)
    }

    /// True when both endpoints reach the same database as the same user.
    pub fn same_principal(&self, other: &Self) -> bool {
        self.identity == other.identity && self.user == other.user
    }
}

fn canonical_host(host: &str) -> String {
    let host = host.trim_start_matches('[').trim_end_matches(']').to_ascii_lowercase();
    match host.as_str() {
        "127.0.0.1" | "::1" | "localhost" => "localhost".to_string(),
        _ => host,
    }
}

/// The endpoints resolved from one configuration.
#[derive(Debug)]
pub struct ResolvedEndpoints {
    /// Application database, when configured
    pub control: Option<ConnectionEndpoint>,
    /// Datastore write endpoint
    pub write: ConnectionEndpoint,
    /// Datastore read-only endpoint, when configured
    pub read: Option<ConnectionEndpoint>,
}

/// Resolves the control, write, and read endpoints from configuration.
///
/// # Errors
/// Returns a configuration error if the write DSN is absent or any
/// configured DSN is malformed.
///
/// # Example
/// ```rust
/// use datastore_gate_core::config::DatastoreConfig;
/// use datastore_gate_core::endpoint::resolve_endpoints;
///
/// let config = DatastoreConfig::new("postgres://writer:pw@db.internal/datastore")
///     .with_read_url("postgres://reader:pw@db.internal/datastore");
/// let endpoints = resolve_endpoints(&config)?;
/// let read = endpoints.read.as_ref().unwrap();
/// assert_eq!(endpoints.write.identity(), read.identity());
/// assert!(!endpoints.write.same_principal(read));
/// # Ok::<(), datastore_gate_core::DatastoreError>(())
/// ```
pub fn resolve_endpoints(config: &DatastoreConfig) -> crate::Result<ResolvedEndpoints> {
    let write_url = config
        .write_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .ok_or_else(|| {
            DatastoreError::configuration(format!("{} not found in config", WRITE_URL_KEY))
        })?;

    let write = ConnectionEndpoint::parse(EndpointRole::Write, write_url)?;

    let control = config
        .control_url
        .as_deref()
        .filter(|u| !u.trim().is_empty())
        .map(|u| ConnectionEndpoint::parse(EndpointRole::Control, u))
        .transpose()?;

    let read = if config.has_read_url() {
        config
            .read_url
            .as_deref()
            .map(|u| ConnectionEndpoint::parse(EndpointRole::Read, u))
            .transpose()?
    } else {
        None
    };

    tracing::debug!(
        "Resolved datastore endpoints: write={}, control={}, read={}",
        write.identity(),
        control
            .as_ref()
            .map_or_else(|| "none".to_string(), |c| c.identity().to_string()),
        read.as_ref()
            .map_or_else(|| "none".to_string(), |r| r.identity().to_string()),
    );

    Ok(ResolvedEndpoints {
        control,
        write,
        read,
    })
}
