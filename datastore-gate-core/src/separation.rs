//! Endpoint separation checks.
//!
//! The read endpoint is granted broad SELECT access. If it shares physical
//! storage with the application database, or is simply the write connection
//! under another name, that access reaches tables the API must never expose.

use crate::endpoint::{ConnectionEndpoint, ResolvedEndpoints};
use crate::error::DatastoreError;

/// Validates that the read endpoint is separate from the control and write
/// endpoints.
///
/// Runs only when a read endpoint is present. `debug` skips the check
/// entirely; it is an explicit caller decision and never inferred.
///
/// # Errors
/// Returns a configuration error if the write and read endpoints are the same
/// user on the same database, or if the control and read endpoints target the
/// same database.
pub fn validate(
    control: Option<&ConnectionEndpoint>,
    write: &ConnectionEndpoint,
    read: Option<&ConnectionEndpoint>,
    debug: bool,
) -> crate::Result<()> {
    let Some(read) = read else {
        tracing::debug!("No read endpoint configured, skipping separation check");
        return Ok(());
    };

    if debug {
        tracing::warn!("Debug mode enabled, skipping datastore separation check");
        return Ok(());
    }

    if write.same_principal(read) {
        return Err(DatastoreError::configuration(
            "The write and read-only database connections are the same",
        ));
    }

    if let Some(control) = control
        && control.identity() == read.identity()
    {
        return Err(DatastoreError::configuration(format!(
            "The application and datastore databases are the same ({})",
            read.identity()
        )));
    }

    tracing::debug!("Datastore endpoints are separated");
    Ok(())
}

/// Convenience wrapper over [`validate`] for resolved endpoints.
///
/// # Errors
/// See [`validate`].
pub fn validate_endpoints(endpoints: &ResolvedEndpoints, debug: bool) -> crate::Result<()> {
    validate(
        endpoints.control.as_ref(),
        &endpoints.write,
        endpoints.read.as_ref(),
        debug,
    )
}
