//! Generic CRUD resource provider.

use octofhir_core::ResourceType;
use octofhir_storage::{DynResourceDao, SearchParams, SearchResult, StoredResource};
use serde_json::Value;

use crate::operations::OperationError;

/// CRUD over one resource type, backed by that type's DAO.
#[derive(Clone)]
pub struct ResourceProvider {
    dao: DynResourceDao,
}

impl ResourceProvider {
    pub fn new(dao: DynResourceDao) -> Self {
        Self { dao }
    }

    pub fn resource_type(&self) -> ResourceType {
        self.dao.resource_type()
    }

    pub fn dao(&self) -> DynResourceDao {
        self.dao.clone()
    }

    pub async fn read(&self, id: &str) -> Result<StoredResource, OperationError> {
        Ok(self.dao.read_required(id).await?)
    }

    pub async fn create(&self, resource: Value) -> Result<StoredResource, OperationError> {
        self.check_type(&resource)?;
        Ok(self.dao.create(resource).await?)
    }

    /// Creates or replaces the resource at `id`. A body id, when present,
    /// must match.
    pub async fn update(&self, id: &str, mut resource: Value) -> Result<StoredResource, OperationError> {
        self.check_type(&resource)?;
        match resource.get("id").and_then(Value::as_str) {
            Some(body_id) if body_id != id => {
                return Err(OperationError::InvalidParameters(format!(
                    "resource id '{body_id}' does not match URL id '{id}'"
                )));
            }
            Some(_) => {}
            None => {
                if let Some(obj) = resource.as_object_mut() {
                    obj.insert("id".into(), Value::String(id.to_string()));
                }
            }
        }
        Ok(self.dao.update(resource).await?)
    }

    pub async fn delete(&self, id: &str) -> Result<(), OperationError> {
        Ok(self.dao.delete(id).await?)
    }

    pub async fn search(&self, params: &SearchParams) -> Result<SearchResult, OperationError> {
        Ok(self.dao.search(params).await?)
    }

    /// Finds a resource by canonical url (`url|version` allowed), falling
    /// back to a `Type/id` reference or the id in the last path segment.
    pub async fn resolve_canonical(&self, canonical: &str) -> Result<StoredResource, OperationError> {
        let (url, version) = octofhir_core::split_canonical(canonical);
        let mut params = SearchParams::new().with_param("url", url).with_count(1);
        if let Some(v) = version {
            params = params.with_param("version", v);
        }
        if let Some(found) = self.dao.search(&params).await?.entries.into_iter().next() {
            return Ok(found);
        }
        let id = octofhir_core::canonical_tail(canonical);
        self.dao.read(id).await?.ok_or_else(|| {
            OperationError::NotFound(format!("{} {canonical} not found", self.resource_type()))
        })
    }

    fn check_type(&self, resource: &Value) -> Result<(), OperationError> {
        let actual = ResourceType::of(resource)
            .map_err(|e| OperationError::InvalidParameters(e.to_string()))?;
        if actual != self.resource_type() {
            return Err(OperationError::InvalidParameters(format!(
                "expected a {} resource but got {actual}",
                self.resource_type()
            )));
        }
        Ok(())
    }
}

impl std::fmt::Debug for ResourceProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceProvider")
            .field("resource_type", &self.resource_type())
            .finish()
    }
}
