//! Identifier and literal handling for statements that cannot use bind
//! parameters (DDL and the deliberately failing probe statements).

use crate::error::DatastoreError;
use sqlx::Row;
use sqlx::postgres::PgRow;

/// PostgreSQL truncates identifiers longer than this.
const MAX_IDENTIFIER_LEN: usize = 63;

/// Validates a PostgreSQL identifier.
///
/// Identifiers must start with a letter or underscore and contain only ASCII
/// letters, digits, underscores, and dollar signs.
///
/// # Errors
/// Returns a configuration error naming `what` when the identifier is invalid.
pub fn validate_identifier(what: &str, identifier: &str) -> crate::Result<()> {
    if identifier.is_empty() {
        return Err(DatastoreError::configuration(format!(
            "{} cannot be empty",
            what
        )));
    }

    if identifier.len() > MAX_IDENTIFIER_LEN {
        return Err(DatastoreError::configuration(format!(
            "{} too long: maximum {} characters",
            what, MAX_IDENTIFIER_LEN
        )));
    }

    let starts_ok = identifier
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_alphabetic() || c == '_');
    if !starts_ok {
        return Err(DatastoreError::configuration(format!(
            "{} must start with a letter or underscore",
            what
        )));
    }

    if !identifier
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
    {
        return Err(DatastoreError::configuration(format!(
            "{} contains invalid characters (only letters, digits, underscores, and dollar signs allowed)",
            what
        )));
    }

    Ok(())
}

/// Quotes an identifier for interpolation into SQL.
pub fn quote_identifier(identifier: &str) -> String {
    format!("\"{}\"", identifier.replace('"', "\"\""))
}

/// Quotes a string literal for interpolation into SQL.
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Schema-qualified, quoted relation name.
pub fn qualified_name(schema: &str, relation: &str) -> String {
    format!("{}.{}", quote_identifier(schema), quote_identifier(relation))
}

/// Extension trait for extracting typed values from catalog rows with
/// consistent error context.
pub trait RowExt {
    /// Extracts a typed field, naming the relation in the error.
    fn get_field<'r, T>(&'r self, field_name: &str, relation: &str) -> crate::Result<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>;
}

impl RowExt for PgRow {
    fn get_field<'r, T>(&'r self, field_name: &str, relation: &str) -> crate::Result<T>
    where
        T: sqlx::Decode<'r, sqlx::Postgres> + sqlx::Type<sqlx::Postgres>,
    {
        self.try_get(field_name).map_err(|e| {
            DatastoreError::database(
                format!("Failed to read field '{}' from {}", field_name, relation),
                e,
            )
        })
    }
}
