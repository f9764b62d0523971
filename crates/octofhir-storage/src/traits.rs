//! Data-access traits.

use async_trait::async_trait;
use octofhir_core::{FhirReference, ResourceType};
use serde_json::Value;

use crate::error::StorageError;
use crate::types::{SearchParams, SearchResult, StoredResource};

/// Data-access object for a single resource type.
///
/// Implementations must be thread-safe (`Send + Sync`). Every method operates
/// on the type returned by [`ResourceDao::resource_type`]; resources of any
/// other type are rejected with `StorageError::InvalidResource`.
#[async_trait]
pub trait ResourceDao: Send + Sync {
    /// The resource type this DAO serves.
    fn resource_type(&self) -> ResourceType;

    /// Creates a new resource. A missing `id` is generated by the backend.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::AlreadyExists` if the id is taken.
    async fn create(&self, resource: Value) -> Result<StoredResource, StorageError>;

    /// Reads a resource by id. Returns `None` if it does not exist.
    async fn read(&self, id: &str) -> Result<Option<StoredResource>, StorageError>;

    /// Creates or replaces the resource identified by its `id` element.
    async fn update(&self, resource: Value) -> Result<StoredResource, StorageError>;

    /// Deletes a resource by id.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::NotFound` if the resource does not exist.
    async fn delete(&self, id: &str) -> Result<(), StorageError>;

    /// Searches resources of this type.
    async fn search(&self, params: &SearchParams) -> Result<SearchResult, StorageError>;

    /// Reads a resource, failing with `NotFound` if it does not exist.
    async fn read_required(&self, id: &str) -> Result<StoredResource, StorageError> {
        self.read(id)
            .await?
            .ok_or_else(|| StorageError::not_found(self.resource_type(), id))
    }
}

/// Cross-type data-access object.
#[async_trait]
pub trait SystemDao: Send + Sync {
    /// Reads a resource addressed by a typed reference.
    async fn read(&self, reference: &FhirReference) -> Result<Option<StoredResource>, StorageError>;

    /// Creates or replaces each resource, returning the stored versions in order.
    ///
    /// Resources are validated up front; if any is malformed nothing is written.
    async fn upsert_all(&self, resources: Vec<Value>) -> Result<Vec<StoredResource>, StorageError>;

    /// Number of stored resources per type.
    async fn counts(&self) -> Result<Vec<(ResourceType, usize)>, StorageError>;
}
