//! Alias metadata view.
//!
//! Builds `_table_metadata`, a view over the system catalogs that maps every
//! view in the datastore schema to the relations it is built on. Callers look
//! aliases up in the view instead of repeating the catalog join.
//!
//! Creation is idempotent across processes: an existing view is left alone,
//! and losing a creation race to another process counts as success.

use crate::error::DatastoreError;
use crate::sql::{RowExt, qualified_name, quote_literal, validate_identifier};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;

/// Name of the derived metadata view.
pub const ALIAS_VIEW_NAME: &str = "_table_metadata";

/// SQLSTATE duplicate_table (also raised for views).
const DUPLICATE_TABLE: &str = "42P07";
/// SQLSTATE duplicate_object.
const DUPLICATE_OBJECT: &str = "42710";
/// SQLSTATE unique_violation, raised on catalog indexes by concurrent DDL.
const UNIQUE_VIOLATION: &str = "23505";

/// One view-to-relation pair from the alias view.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogDependency {
    /// Base relation the view reads from (`alias_of` column)
    pub dependent_relation: String,
    /// The view (`name` column)
    pub dependee_relation: String,
}

/// What [`ensure_alias_view`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AliasViewStatus {
    /// The view already existed; no DDL was issued
    AlreadyPresent,
    /// This call created the view
    Created,
    /// Another process created the view between the existence check and
    /// this call's `CREATE VIEW`
    CreatedConcurrently,
}

/// Catalog query pairing each view in `schema` with its base relations.
///
/// The schema must already be a validated identifier.
pub(crate) fn introspection_query(schema: &str) -> String {
    format!(
        r#"
        SELECT DISTINCT
            dependee.relname AS name,
            dependent.relname AS alias_of
        FROM pg_attribute AS a
        JOIN pg_depend AS d ON d.refobjid = a.attrelid AND d.refobjsubid = a.attnum
        JOIN pg_rewrite AS r ON d.objid = r.oid
        JOIN pg_class AS dependee ON r.ev_class = dependee.oid
        JOIN pg_class AS dependent ON d.refobjid = dependent.oid
        WHERE dependee.relnamespace = (SELECT oid FROM pg_namespace WHERE nspname = {})
        "#,
        quote_literal(schema)
    )
}

/// DDL creating the alias view in `schema`.
pub(crate) fn create_view_statement(schema: &str) -> String {
    format!(
        "CREATE VIEW {} AS {}",
        qualified_name(schema, ALIAS_VIEW_NAME),
        introspection_query(schema)
    )
}

/// True for errors that mean the view was created by someone else.
fn is_duplicate_object(error: &sqlx::Error) -> bool {
    let sqlx::Error::Database(db_err) = error else {
        return false;
    };
    match db_err.code().as_deref() {
        Some(DUPLICATE_TABLE | DUPLICATE_OBJECT) => true,
        Some(UNIQUE_VIOLATION) => db_err
            .constraint()
            .is_some_and(|constraint| constraint.starts_with("pg_")),
        _ => false,
    }
}

/// Checks whether the alias view exists in `schema`.
///
/// # Errors
/// Returns a database error if the catalog cannot be queried.
pub async fn alias_view_exists(pool: &PgPool, schema: &str) -> crate::Result<bool> {
    let exists: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM pg_views WHERE viewname = $1 AND schemaname = $2")
            .bind(ALIAS_VIEW_NAME)
            .bind(schema)
            .fetch_optional(pool)
            .await
            .map_err(|e| DatastoreError::database("Failed to query pg_views", e))?;
    Ok(exists.is_some())
}

/// Creates the alias view in `schema` unless it already exists.
///
/// The existence check and the `CREATE VIEW` run in one transaction that is
/// committed on success.
///
/// # Errors
/// Returns a configuration error for an invalid schema name and a database
/// error for any failure other than a lost creation race.
pub async fn ensure_alias_view(pool: &PgPool, schema: &str) -> crate::Result<AliasViewStatus> {
    validate_identifier("datastore schema", schema)?;

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DatastoreError::connection("Failed to connect to the write endpoint", e))?;

    let exists: Option<i32> =
        sqlx::query_scalar("SELECT 1 FROM pg_views WHERE viewname = $1 AND schemaname = $2")
            .bind(ALIAS_VIEW_NAME)
            .bind(schema)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| DatastoreError::database("Failed to query pg_views", e))?;

    if exists.is_some() {
        tracing::debug!("Alias view {}.{} already exists", schema, ALIAS_VIEW_NAME);
        tx.rollback()
            .await
            .map_err(|e| DatastoreError::database("Failed to end alias view transaction", e))?;
        return Ok(AliasViewStatus::AlreadyPresent);
    }

    let created = sqlx::query(&create_view_statement(schema))
        .execute(&mut *tx)
        .await;

    match created {
        Ok(_) => {
            tx.commit()
                .await
                .map_err(|e| DatastoreError::database("Failed to commit alias view", e))?;
            tracing::info!("Created alias view {}.{}", schema, ALIAS_VIEW_NAME);
            Ok(AliasViewStatus::Created)
        }
        Err(e) if is_duplicate_object(&e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::warn!("Failed to roll back alias view transaction: {}", rollback_err);
            }
            tracing::info!(
                "Alias view {}.{} was created concurrently by another process",
                schema,
                ALIAS_VIEW_NAME
            );
            Ok(AliasViewStatus::CreatedConcurrently)
        }
        Err(e) => Err(DatastoreError::database(
            format!("Failed to create alias view {}.{}", schema, ALIAS_VIEW_NAME),
            e,
        )),
    }
}

/// Reads every view-to-relation pair from the alias view.
///
/// # Errors
/// Returns a database error if the view is missing or cannot be read.
pub async fn list_aliases(pool: &PgPool, schema: &str) -> crate::Result<Vec<CatalogDependency>> {
    validate_identifier("datastore schema", schema)?;

    let query = format!(
        "SELECT name::text AS name, alias_of::text AS alias_of FROM {} ORDER BY name, alias_of",
        qualified_name(schema, ALIAS_VIEW_NAME)
    );

    let rows = sqlx::query(&query)
        .fetch_all(pool)
        .await
        .map_err(|e| DatastoreError::database("Failed to read alias view", e))?;

    rows.iter()
        .map(|row| {
            Ok(CatalogDependency {
                dependee_relation: row.get_field("name", ALIAS_VIEW_NAME)?,
                dependent_relation: row.get_field("alias_of", ALIAS_VIEW_NAME)?,
            })
        })
        .collect()
}

/// Returns the views built on `relation`, sorted by name.
///
/// # Errors
/// Returns a database error if the view is missing or cannot be read.
pub async fn aliases_of(pool: &PgPool, schema: &str, relation: &str) -> crate::Result<Vec<String>> {
    validate_identifier("datastore schema", schema)?;

    let query = format!(
        "SELECT name::text FROM {} WHERE alias_of = $1 ORDER BY name",
        qualified_name(schema, ALIAS_VIEW_NAME)
    );

    sqlx::query_scalar(&query)
        .bind(relation)
        .fetch_all(pool)
        .await
        .map_err(|e| {
            DatastoreError::database(format!("Failed to look up aliases of '{}'", relation), e)
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_introspection_query_filters_schema() {
        let query = introspection_query("public");

        assert!(query.contains("nspname = 'public'"));
        for catalog in ["pg_attribute", "pg_depend", "pg_rewrite", "pg_class"] {
            assert!(query.contains(catalog), "missing {}", catalog);
        }
        assert!(query.contains("AS alias_of"));
    }

    #[test]
    fn test_create_view_statement() {
        let ddl = create_view_statement("datastore");

        assert!(ddl.starts_with("CREATE VIEW \"datastore\".\"_table_metadata\" AS"));
        assert!(ddl.contains("nspname = 'datastore'"));
    }

    #[test]
    fn test_non_database_errors_are_not_duplicates() {
        assert!(!is_duplicate_object(&sqlx::Error::RowNotFound));
        assert!(!is_duplicate_object(&sqlx::Error::PoolTimedOut));
    }

    #[test]
    fn test_catalog_dependency_serializes() {
        let dependency = CatalogDependency {
            dependent_relation: "abc123".to_string(),
            dependee_relation: "my_alias".to_string(),
        };

        let json = serde_json::to_value(&dependency).unwrap();
        assert_eq!(json["dependent_relation"], "abc123");
        assert_eq!(json["dependee_relation"], "my_alias");
    }
}
