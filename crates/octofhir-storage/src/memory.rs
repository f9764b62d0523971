//! In-memory storage backend.
//!
//! Backs every per-type DAO with one shared [`InMemoryStore`] so that the
//! [`InMemorySystemDao`] sees writes made through any of them.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use octofhir_core::{FhirReference, ResourceType, generate_id, now_utc, validate_id};
use serde_json::{Value, json};

use crate::error::StorageError;
use crate::traits::{ResourceDao, SystemDao};
use crate::types::{SearchParams, SearchResult, StoredResource};

type StorageKey = (ResourceType, String);

/// Shared resource store keyed by `(type, id)`.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    data: DashMap<StorageKey, StoredResource>,
    version_counter: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        (self.version_counter.fetch_add(1, Ordering::SeqCst) + 1).to_string()
    }

    /// Stamps `id` and `meta` onto the resource and stores it.
    fn put(&self, resource_type: ResourceType, id: String, mut resource: Value) -> StoredResource {
        let version_id = self.next_version();
        let last_updated = now_utc();
        if let Some(obj) = resource.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.clone()));
            let meta = obj.entry("meta").or_insert_with(|| json!({}));
            if let Some(meta) = meta.as_object_mut() {
                meta.insert("versionId".to_string(), Value::String(version_id.clone()));
                meta.insert(
                    "lastUpdated".to_string(),
                    Value::String(last_updated.to_string()),
                );
            }
        }
        let stored = StoredResource {
            id: id.clone(),
            version_id,
            resource_type,
            resource,
            last_updated,
        };
        self.data.insert((resource_type, id), stored.clone());
        stored
    }

    fn get(&self, resource_type: ResourceType, id: &str) -> Option<StoredResource> {
        self.data
            .get(&(resource_type, id.to_string()))
            .map(|entry| entry.value().clone())
    }

    fn all_of(&self, resource_type: ResourceType) -> Vec<StoredResource> {
        let mut entries: Vec<StoredResource> = self
            .data
            .iter()
            .filter(|entry| entry.key().0 == resource_type)
            .map(|entry| entry.value().clone())
            .collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        entries
    }
}

/// Checks type and id of an incoming resource, returning the id if present.
fn check_resource(
    expected: ResourceType,
    resource: &Value,
) -> Result<Option<String>, StorageError> {
    if !resource.is_object() {
        return Err(StorageError::invalid_resource("resource must be a JSON object"));
    }
    let actual = ResourceType::of(resource)?;
    if actual != expected {
        return Err(StorageError::invalid_resource(format!(
            "expected {expected} but got {actual}"
        )));
    }
    match resource.get("id").and_then(Value::as_str) {
        Some(id) => {
            validate_id(id).map_err(|e| StorageError::invalid_resource(e.to_string()))?;
            Ok(Some(id.to_string()))
        }
        None => Ok(None),
    }
}

/// Per-type DAO over a shared [`InMemoryStore`].
#[derive(Debug, Clone)]
pub struct InMemoryResourceDao {
    store: Arc<InMemoryStore>,
    resource_type: ResourceType,
}

impl InMemoryResourceDao {
    pub fn new(store: Arc<InMemoryStore>, resource_type: ResourceType) -> Self {
        Self {
            store,
            resource_type,
        }
    }
}

#[async_trait]
impl ResourceDao for InMemoryResourceDao {
    fn resource_type(&self) -> ResourceType {
        self.resource_type
    }

    async fn create(&self, resource: Value) -> Result<StoredResource, StorageError> {
        let id = check_resource(self.resource_type, &resource)?.unwrap_or_else(generate_id);
        if self.store.get(self.resource_type, &id).is_some() {
            return Err(StorageError::already_exists(self.resource_type, id));
        }
        tracing::debug!(resource_type = %self.resource_type, id = %id, "create");
        Ok(self.store.put(self.resource_type, id, resource))
    }

    async fn read(&self, id: &str) -> Result<Option<StoredResource>, StorageError> {
        Ok(self.store.get(self.resource_type, id))
    }

    async fn update(&self, resource: Value) -> Result<StoredResource, StorageError> {
        let id = check_resource(self.resource_type, &resource)?
            .ok_or_else(|| StorageError::invalid_resource("update requires an id"))?;
        tracing::debug!(resource_type = %self.resource_type, id = %id, "update");
        Ok(self.store.put(self.resource_type, id, resource))
    }

    async fn delete(&self, id: &str) -> Result<(), StorageError> {
        self.store
            .data
            .remove(&(self.resource_type, id.to_string()))
            .map(|_| ())
            .ok_or_else(|| StorageError::not_found(self.resource_type, id))
    }

    async fn search(&self, params: &SearchParams) -> Result<SearchResult, StorageError> {
        let matching: Vec<StoredResource> = self
            .store
            .all_of(self.resource_type)
            .into_iter()
            .filter(|stored| {
                params
                    .parameters
                    .iter()
                    .all(|(name, values)| matches_any(&stored.resource, name, values))
            })
            .collect();
        let total = matching.len();
        let entries = match params.count {
            Some(count) => matching.into_iter().take(count).collect(),
            None => matching,
        };
        Ok(SearchResult::with_entries(entries, total))
    }
}

/// Cross-type DAO over a shared [`InMemoryStore`].
#[derive(Debug, Clone)]
pub struct InMemorySystemDao {
    store: Arc<InMemoryStore>,
}

impl InMemorySystemDao {
    pub fn new(store: Arc<InMemoryStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl SystemDao for InMemorySystemDao {
    async fn read(&self, reference: &FhirReference) -> Result<Option<StoredResource>, StorageError> {
        Ok(self.store.get(reference.resource_type, &reference.id))
    }

    async fn upsert_all(&self, resources: Vec<Value>) -> Result<Vec<StoredResource>, StorageError> {
        let mut checked = Vec::with_capacity(resources.len());
        for resource in resources {
            let resource_type = ResourceType::of(&resource)?;
            let id = check_resource(resource_type, &resource)?.unwrap_or_else(generate_id);
            checked.push((resource_type, id, resource));
        }
        Ok(checked
            .into_iter()
            .map(|(resource_type, id, resource)| self.store.put(resource_type, id, resource))
            .collect())
    }

    async fn counts(&self) -> Result<Vec<(ResourceType, usize)>, StorageError> {
        let mut counts = std::collections::BTreeMap::new();
        for entry in self.store.data.iter() {
            *counts.entry(entry.key().0).or_insert(0usize) += 1;
        }
        Ok(counts.into_iter().collect())
    }
}

// =============================================================================
// Search matching
// =============================================================================

fn matches_any(resource: &Value, name: &str, values: &[String]) -> bool {
    values.iter().any(|value| matches_param(resource, name, value))
}

fn matches_param(resource: &Value, name: &str, value: &str) -> bool {
    match name {
        "_id" => resource.get("id").and_then(Value::as_str) == Some(value),
        "identifier" => matches_identifier(resource.get("identifier"), value),
        "family" => resource
            .get("name")
            .and_then(Value::as_array)
            .is_some_and(|names| {
                names.iter().any(|n| {
                    n.get("family")
                        .and_then(Value::as_str)
                        .is_some_and(|f| f.eq_ignore_ascii_case(value))
                })
            }),
        "subject" | "patient" | "beneficiary" | "request" => resource
            .get(name)
            .and_then(|r| r.get("reference"))
            .and_then(Value::as_str)
            .is_some_and(|r| r == value || r.ends_with(&format!("/{value}"))),
        "birthdate" => resource.get("birthDate").and_then(Value::as_str) == Some(value),
        _ => match resource.get(name) {
            Some(Value::String(s)) => s == value,
            Some(Value::Bool(b)) => b.to_string() == value,
            _ => false,
        },
    }
}

fn matches_identifier(identifiers: Option<&Value>, value: &str) -> bool {
    let (system, code) = match value.split_once('|') {
        Some((system, code)) => (Some(system), code),
        None => (None, value),
    };
    let check = |identifier: &Value| {
        identifier.get("value").and_then(Value::as_str) == Some(code)
            && system.is_none_or(|s| {
                s.is_empty() || identifier.get("system").and_then(Value::as_str) == Some(s)
            })
    };
    match identifiers {
        Some(Value::Array(items)) => items.iter().any(check),
        Some(single @ Value::Object(_)) => check(single),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn dao(rt: ResourceType) -> InMemoryResourceDao {
        InMemoryResourceDao::new(Arc::new(InMemoryStore::new()), rt)
    }

    #[tokio::test]
    async fn test_create_read_update_delete() {
        let dao = dao(ResourceType::Library);
        let created = dao
            .create(json!({"resourceType": "Library", "name": "Common"}))
            .await
            .unwrap();
        assert_eq!(created.version_id, "1");
        assert_eq!(created.resource["meta"]["versionId"], "1");

        let read = dao.read(&created.id).await.unwrap().unwrap();
        assert_eq!(read.resource["name"], "Common");

        let mut body = read.resource.clone();
        body["version"] = json!("2.0.0");
        let updated = dao.update(body).await.unwrap();
        assert_eq!(updated.version_id, "2");

        dao.delete(&created.id).await.unwrap();
        assert!(dao.read(&created.id).await.unwrap().is_none());
        assert!(matches!(
            dao.delete(&created.id).await,
            Err(StorageError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_create_rejects_wrong_type_and_duplicates() {
        let dao = dao(ResourceType::Measure);
        let err = dao
            .create(json!({"resourceType": "Library"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidResource { .. }));

        dao.create(json!({"resourceType": "Measure", "id": "m1"}))
            .await
            .unwrap();
        let err = dao
            .create(json!({"resourceType": "Measure", "id": "m1"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::AlreadyExists { .. }));
    }

    #[tokio::test]
    async fn test_search_parameters() {
        let dao = dao(ResourceType::Patient);
        dao.create(json!({
            "resourceType": "Patient",
            "id": "p1",
            "birthDate": "1980-01-01",
            "name": [{"family": "Smith"}],
            "identifier": [{"system": "urn:mrn", "value": "123"}]
        }))
        .await
        .unwrap();
        dao.create(json!({"resourceType": "Patient", "id": "p2", "name": [{"family": "Jones"}]}))
            .await
            .unwrap();

        let by_family = dao
            .search(&SearchParams::new().with_param("family", "smith"))
            .await
            .unwrap();
        assert_eq!(by_family.len(), 1);

        let by_identifier = dao
            .search(&SearchParams::new().with_param("identifier", "urn:mrn|123"))
            .await
            .unwrap();
        assert_eq!(by_identifier.entries[0].id, "p1");

        let wrong_system = dao
            .search(&SearchParams::new().with_param("identifier", "urn:other|123"))
            .await
            .unwrap();
        assert!(wrong_system.is_empty());

        let limited = dao.search(&SearchParams::new().with_count(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited.total, 2);
    }

    #[tokio::test]
    async fn test_reference_search() {
        let dao = dao(ResourceType::Coverage);
        dao.create(json!({
            "resourceType": "Coverage",
            "id": "c1",
            "beneficiary": {"reference": "Patient/p1"}
        }))
        .await
        .unwrap();
        for value in ["Patient/p1", "p1"] {
            let result = dao
                .search(&SearchParams::new().with_param("beneficiary", value))
                .await
                .unwrap();
            assert_eq!(result.len(), 1);
        }
    }

    #[tokio::test]
    async fn test_system_dao_shares_store() {
        let store = Arc::new(InMemoryStore::new());
        let system = InMemorySystemDao::new(store.clone());
        let claims = InMemoryResourceDao::new(store, ResourceType::Claim);

        let stored = system
            .upsert_all(vec![
                json!({"resourceType": "Claim", "id": "c1"}),
                json!({"resourceType": "Patient"}),
            ])
            .await
            .unwrap();
        assert_eq!(stored.len(), 2);
        assert!(claims.read("c1").await.unwrap().is_some());

        let counts = system.counts().await.unwrap();
        assert!(counts.contains(&(ResourceType::Claim, 1)));
        assert!(counts.contains(&(ResourceType::Patient, 1)));
    }

    #[tokio::test]
    async fn test_upsert_all_is_all_or_nothing() {
        let store = Arc::new(InMemoryStore::new());
        let system = InMemorySystemDao::new(store);
        let err = system
            .upsert_all(vec![
                json!({"resourceType": "Claim", "id": "c1"}),
                json!({"resourceType": "Unicorn"}),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidResource { .. }));
        assert!(system.counts().await.unwrap().is_empty());
    }
}
