//! Read permission probe.
//!
//! Connects with the read-only credential and deliberately attempts to
//! change the datastore. Every attempt runs in its own transaction, which is
//! rolled back whatever happens. The gate passes only when every attempt is
//! refused for a recognized reason.
//!
//! # Security
//! - A statement that succeeds is a fatal finding; later statements are not run
//! - Unrecognized failures are fatal, never downgraded to a pass
//! - Probes are never retried

use crate::error::DatastoreError;
use crate::sql::{qualified_name, validate_identifier};
use serde::Serialize;
use sqlx::PgPool;

/// SQLSTATE insufficient_privilege.
const INSUFFICIENT_PRIVILEGE: &str = "42501";
/// SQLSTATE read_only_sql_transaction, raised by hot standby replicas.
const READ_ONLY_SQL_TRANSACTION: &str = "25006";
/// SQLSTATE duplicate_table.
const DUPLICATE_TABLE: &str = "42P07";
/// SQLSTATE undefined_table.
const UNDEFINED_TABLE: &str = "42P01";

/// What a probe statement tries to change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ProbeKind {
    /// Schema-altering statement
    Schema,
    /// Data-altering statement
    Data,
}

impl std::fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Schema => write!(f, "schema"),
            Self::Data => write!(f, "data"),
        }
    }
}

/// A deliberately mutating statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeStatement {
    /// What the statement tries to change
    pub kind: ProbeKind,
    /// SQL text
    pub sql: String,
}

/// Recognized reasons for a probe statement to be refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExpectedFailure {
    /// The credential lacks the privilege
    PermissionDenied,
    /// The server is a read-only replica
    ReadOnlyReplica,
}

/// Result of executing one probe statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ProbeOutcome {
    /// The statement ran. The credential can mutate data.
    ///
    /// Never part of a returned [`ProbeReport`]: it ends the run with a
    /// security error naming the statement.
    Succeeded,
    /// The statement was refused for a recognized reason
    ExpectedFailure(ExpectedFailure),
    /// The statement failed for any other reason
    UnexpectedFailure {
        /// SQLSTATE, when the driver reported one
        code: Option<String>,
        /// Driver message
        message: String,
    },
}

impl ProbeOutcome {
    /// Classifies the error raised by a probe statement.
    ///
    /// SQLSTATE codes are authoritative. Message signatures are only
    /// consulted when the driver reports no code.
    pub fn from_error(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::Database(db_err) => {
                let code = db_err.code().map(|c| c.into_owned());
                let kind = match code.as_deref() {
                    Some(INSUFFICIENT_PRIVILEGE) => Some(ExpectedFailure::PermissionDenied),
                    Some(READ_ONLY_SQL_TRANSACTION) => Some(ExpectedFailure::ReadOnlyReplica),
                    Some(_) => None,
                    None => classify_message(db_err.message()),
                };
                match kind {
                    Some(kind) => Self::ExpectedFailure(kind),
                    None => Self::UnexpectedFailure {
                        code,
                        message: db_err.message().to_string(),
                    },
                }
            }
            other => Self::UnexpectedFailure {
                code: None,
                message: other.to_string(),
            },
        }
    }

    /// True for recognized refusals.
    pub fn is_expected(&self) -> bool {
        matches!(self, Self::ExpectedFailure(_))
    }
}

fn classify_message(message: &str) -> Option<ExpectedFailure> {
    let message = message.to_ascii_lowercase();
    if message.contains("permission denied") {
        Some(ExpectedFailure::PermissionDenied)
    } else if message.contains("read-only transaction") {
        Some(ExpectedFailure::ReadOnlyReplica)
    } else {
        None
    }
}

/// One executed probe statement and its outcome.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProbeResult {
    /// Statement executed
    pub statement: ProbeStatement,
    /// How it ended
    pub outcome: ProbeOutcome,
}

/// Outcomes of a passing probe run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProbeReport {
    /// One entry per statement, in execution order
    pub results: Vec<ProbeResult>,
}

impl ProbeReport {
    /// True when the server refused writes because it is a replica.
    pub fn read_only_replica(&self) -> bool {
        self.results
            .iter()
            .any(|r| r.outcome == ProbeOutcome::ExpectedFailure(ExpectedFailure::ReadOnlyReplica))
    }
}

/// Builds the ordered probe statements against one probe table.
///
/// # Errors
/// Returns a configuration error if the schema or table name is not a valid
/// identifier.
pub fn probe_statements(schema: &str, probe_table: &str) -> crate::Result<Vec<ProbeStatement>> {
    validate_identifier("datastore schema", schema)?;
    validate_identifier("probe table", probe_table)?;

    let table = qualified_name(schema, probe_table);
    Ok(vec![
        ProbeStatement {
            kind: ProbeKind::Schema,
            sql: format!("CREATE TABLE {} (id INTEGER NOT NULL, name VARCHAR)", table),
        },
        ProbeStatement {
            kind: ProbeKind::Data,
            sql: format!("INSERT INTO {} VALUES (1, 'probe')", table),
        },
    ])
}

/// Verifies that the read-only credential cannot mutate the datastore.
///
/// The pool must connect as the read-only credential and must not force
/// `default_transaction_read_only`.
///
/// # Errors
/// - `Security` if any probe statement succeeds, or the schema probe is
///   refused only because the probe table already exists
/// - `Database` for any unrecognized failure, including a missing probe table
/// - `Connection` if the read endpoint cannot be reached
pub async fn probe(pool: &PgPool, schema: &str, probe_table: &str) -> crate::Result<ProbeReport> {
    let statements = probe_statements(schema, probe_table)?;

    let mut conn = pool.acquire().await.map_err(|e| {
        DatastoreError::connection("Failed to connect to the read-only endpoint", e)
    })?;

    let mut report = ProbeReport::default();

    for statement in statements {
        let mut tx = sqlx::Connection::begin(&mut *conn).await.map_err(|e| {
            DatastoreError::database("Failed to begin probe transaction", e)
        })?;

        let executed = sqlx::query(&statement.sql).execute(&mut *tx).await;
        let rolled_back = tx.rollback().await;

        let error = match executed {
            Ok(_) => {
                if let Err(e) = rolled_back {
                    tracing::error!("Failed to roll back successful probe statement: {}", e);
                }
                let finding = ProbeResult {
                    statement,
                    outcome: ProbeOutcome::Succeeded,
                };
                tracing::error!(
                    "Read-only credential executed the {} statement on {}.{}: {:?}",
                    finding.statement.kind,
                    schema,
                    probe_table,
                    finding
                );
                return Err(security_finding(&finding, schema, probe_table));
            }
            Err(e) => e,
        };

        if let sqlx::Error::Database(db_err) = &error
            && statement.kind == ProbeKind::Schema
            && db_err.code().as_deref() == Some(DUPLICATE_TABLE)
        {
            tracing::error!("Read-only credential passed the CREATE privilege check on {}", schema);
            return Err(DatastoreError::security(format!(
                "The read-only credential can create tables in schema '{}'",
                schema
            )));
        }

        rolled_back.map_err(|e| {
            DatastoreError::database("Failed to roll back probe transaction", e)
        })?;

        let outcome = ProbeOutcome::from_error(&error);
        tracing::debug!("Probe {:?} statement outcome: {:?}", statement.kind, outcome);

        if !outcome.is_expected() {
            let context = match &error {
                sqlx::Error::Database(db_err)
                    if db_err.code().as_deref() == Some(UNDEFINED_TABLE) =>
                {
                    format!(
                        "Probe table {}.{} is not provisioned",
                        schema, probe_table
                    )
                }
                _ => format!("{:?} probe statement failed unexpectedly", statement.kind),
            };
            return Err(DatastoreError::database(context, error));
        }

        report.results.push(ProbeResult { statement, outcome });
    }

    tracing::info!(
        "Read-only datastore credential verified ({} probe statements refused)",
        report.results.len()
    );
    Ok(report)
}

/// Security error naming the statement that succeeded.
fn security_finding(finding: &ProbeResult, schema: &str, probe_table: &str) -> DatastoreError {
    DatastoreError::security(format!(
        "We have write permissions on the read-only database ({} statement on {}.{} succeeded)",
        finding.statement.kind, schema, probe_table
    ))
}
