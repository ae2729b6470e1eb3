//! Datastore activity flag for resource descriptors.
//!
//! A resource is "datastore active" when a table named after its id exists in
//! the datastore schema. The flag is computed from the catalog on every call
//! and never cached.

use crate::error::DatastoreError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::PgPool;
use thiserror::Error;

/// Field added to resource descriptors.
pub const DATASTORE_ACTIVE_FIELD: &str = "datastore_active";

/// Externally-owned resource description.
///
/// Wraps a JSON object with at least a string `id`. Only
/// [`DATASTORE_ACTIVE_FIELD`] is ever written by this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Map<String, Value>", into = "Map<String, Value>")]
pub struct ResourceDescriptor {
    fields: Map<String, Value>,
}

impl TryFrom<Map<String, Value>> for ResourceDescriptor {
    type Error = DatastoreError;

    fn try_from(fields: Map<String, Value>) -> Result<Self, Self::Error> {
        match fields.get("id") {
            Some(Value::String(_)) => Ok(Self { fields }),
            _ => Err(DatastoreError::configuration(
                "resource descriptor must have a string 'id' field",
            )),
        }
    }
}

impl From<ResourceDescriptor> for Map<String, Value> {
    fn from(descriptor: ResourceDescriptor) -> Self {
        descriptor.fields
    }
}

impl ResourceDescriptor {
    /// Creates a descriptor holding only an id.
    pub fn with_id(id: impl Into<String>) -> Self {
        let mut fields = Map::new();
        fields.insert("id".to_string(), Value::String(id.into()));
        Self { fields }
    }

    /// Builds a descriptor from a JSON value.
    ///
    /// # Errors
    /// Returns error unless the value is an object with a string `id`.
    pub fn from_value(value: Value) -> crate::Result<Self> {
        match value {
            Value::Object(fields) => Self::try_from(fields),
            _ => Err(DatastoreError::configuration(
                "resource descriptor must be a JSON object",
            )),
        }
    }

    /// Resource id.
    pub fn id(&self) -> &str {
        self.fields.get("id").and_then(Value::as_str).unwrap_or_default()
    }

    /// Any field of the descriptor.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// The activity flag, if it has been computed.
    pub fn datastore_active(&self) -> Option<bool> {
        self.fields.get(DATASTORE_ACTIVE_FIELD).and_then(Value::as_bool)
    }

    /// Returns the descriptor with the activity flag set.
    #[must_use]
    pub fn with_datastore_active(mut self, active: bool) -> Self {
        self.fields
            .insert(DATASTORE_ACTIVE_FIELD.to_string(), Value::Bool(active));
        self
    }

    /// Converts into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

/// The platform's "describe resource by id" operation.
#[async_trait]
pub trait ResourceDescriber: Send + Sync {
    /// Error raised by the describe operation
    type Error: std::error::Error + Send + Sync + 'static;

    /// Describes a resource.
    async fn describe(&self, resource_id: &str) -> Result<ResourceDescriptor, Self::Error>;
}

/// Failure of [`ActiveFlagResolver::describe_with_active_flag`].
#[derive(Debug, Error)]
pub enum DescribeError<E>
where
    E: std::error::Error + 'static,
{
    /// The underlying describe operation failed; passed through unchanged
    #[error(transparent)]
    Describe(E),

    /// The catalog lookup failed
    #[error(transparent)]
    Datastore(#[from] DatastoreError),
}

/// Adds the datastore activity flag to resource descriptors.
///
/// Cheap to clone; every call acquires its own pooled connection, so one
/// resolver can serve concurrent requests.
#[derive(Debug, Clone)]
pub struct ActiveFlagResolver {
    pool: PgPool,
    schema: String,
}

impl ActiveFlagResolver {
    /// Creates a resolver over the write endpoint pool.
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    /// Checks whether a table named `resource_id` exists in the datastore
    /// schema.
    ///
    /// # Errors
    /// Returns error if the write endpoint cannot be reached or the catalog
    /// query fails.
    pub async fn is_active(&self, resource_id: &str) -> crate::Result<bool> {
        let mut conn = self.pool.acquire().await.map_err(|e| {
            DatastoreError::connection("Failed to connect to the write endpoint", e)
        })?;

        let found: Option<i32> =
            sqlx::query_scalar("SELECT 1 FROM pg_tables WHERE tablename = $1 AND schemaname = $2")
                .bind(resource_id)
                .bind(self.schema.as_str())
                .fetch_optional(&mut *conn)
                .await
                .map_err(|e| {
                    DatastoreError::database(
                        format!("Failed to look up datastore table for '{}'", resource_id),
                        e,
                    )
                })?;

        Ok(found.is_some())
    }

    /// Describes a resource and adds its datastore activity flag.
    ///
    /// Errors from `describer` are returned unchanged as
    /// [`DescribeError::Describe`]. Every other field of the descriptor is
    /// passed through untouched.
    ///
    /// # Errors
    /// Returns error if the describe operation or the catalog lookup fails.
    pub async fn describe_with_active_flag<D>(
        &self,
        resource_id: &str,
        describer: &D,
    ) -> Result<ResourceDescriptor, DescribeError<D::Error>>
    where
        D: ResourceDescriber + ?Sized,
    {
        let descriptor = describer
            .describe(resource_id)
            .await
            .map_err(DescribeError::Describe)?;

        let active = self.is_active(resource_id).await?;
        tracing::debug!("Resource '{}' datastore_active={}", resource_id, active);

        Ok(descriptor.with_datastore_active(active))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_descriptor_requires_string_id() {
        assert!(ResourceDescriptor::from_value(json!({"id": "abc123"})).is_ok());
        assert!(ResourceDescriptor::from_value(json!({"id": 7})).is_err());
        assert!(ResourceDescriptor::from_value(json!({"name": "x"})).is_err());
        assert!(ResourceDescriptor::from_value(json!(["abc123"])).is_err());
    }

    #[test]
    fn test_flag_preserves_other_fields() {
        let descriptor = ResourceDescriptor::from_value(json!({
            "id": "abc123",
            "name": "Air quality",
            "format": "CSV",
            "datastore_active": false,
        }))
        .unwrap();

        let updated = descriptor.clone().with_datastore_active(true);

        assert_eq!(updated.id(), "abc123");
        assert_eq!(updated.datastore_active(), Some(true));
        assert_eq!(updated.get("name"), descriptor.get("name"));
        assert_eq!(updated.get("format"), descriptor.get("format"));
    }

    #[test]
    fn test_descriptor_serde_round_trip_keeps_shape() {
        let value = json!({"id": "abc123", "extras": {"a": 1}});
        let descriptor: ResourceDescriptor = serde_json::from_value(value.clone()).unwrap();

        assert_eq!(descriptor.datastore_active(), None);
        assert_eq!(serde_json::to_value(&descriptor).unwrap(), value);

        let bad: Result<ResourceDescriptor, _> = serde_json::from_value(json!({"id": null}));
        assert!(bad.is_err());
    }

    #[derive(Debug, Error)]
    #[error("resource not found: {0}")]
    struct NotFound(String);

    struct Missing;

    #[async_trait]
    impl ResourceDescriber for Missing {
        type Error = NotFound;

        async fn describe(&self, resource_id: &str) -> Result<ResourceDescriptor, NotFound> {
            Err(NotFound(resource_id.to_string()))
        }
    }

    #[tokio::test]
    async fn test_describe_error_passes_through() {
        // The pool is never used: the describe failure short-circuits.
        let pool = sqlx::postgres::PgPoolOptions::new()
            .connect_lazy("postgres://nobody@localhost:1/none")
            .unwrap();
        let resolver = ActiveFlagResolver::new(pool, "public");

        let err = resolver
            .describe_with_active_flag("abc123", &Missing)
            .await
            .unwrap_err();

        assert!(
            matches!(&err, DescribeError::Describe(NotFound(id)) if id == "abc123"),
            "expected describe error, got {:?}",
            err
        );
    }
}
