//! Registry of data-access objects keyed by resource type.

use std::collections::BTreeMap;
use std::sync::Arc;

use octofhir_core::ResourceType;

use crate::error::StorageError;
use crate::memory::{InMemoryResourceDao, InMemoryStore, InMemorySystemDao};
use crate::{DynResourceDao, DynSystemDao};

/// Maps each supported [`ResourceType`] to its DAO and carries the system DAO.
#[derive(Clone)]
pub struct DaoRegistry {
    daos: BTreeMap<ResourceType, DynResourceDao>,
    system: DynSystemDao,
}

impl DaoRegistry {
    pub fn new(system: DynSystemDao) -> Self {
        Self {
            daos: BTreeMap::new(),
            system,
        }
    }

    /// Builds a registry backed by one shared in-memory store.
    pub fn in_memory(types: impl IntoIterator<Item = ResourceType>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let mut registry = Self::new(Arc::new(InMemorySystemDao::new(store.clone())));
        for rt in types {
            registry.register(Arc::new(InMemoryResourceDao::new(store.clone(), rt)));
        }
        registry
    }

    /// Adds (or replaces) the DAO for its resource type.
    pub fn register(&mut self, dao: DynResourceDao) {
        self.daos.insert(dao.resource_type(), dao);
    }

    /// Returns the DAO for a resource type.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::UnsupportedType` if no DAO is registered.
    pub fn resource_dao(&self, resource_type: ResourceType) -> Result<DynResourceDao, StorageError> {
        self.daos
            .get(&resource_type)
            .cloned()
            .ok_or(StorageError::UnsupportedType(resource_type))
    }

    pub fn system_dao(&self) -> DynSystemDao {
        self.system.clone()
    }

    pub fn is_supported(&self, resource_type: ResourceType) -> bool {
        self.daos.contains_key(&resource_type)
    }

    /// Supported resource types in stable order.
    pub fn supported_types(&self) -> impl Iterator<Item = ResourceType> + '_ {
        self.daos.keys().copied()
    }
}

impl std::fmt::Debug for DaoRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaoRegistry")
            .field("types", &self.daos.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_lookup_supported_and_unsupported() {
        let registry = DaoRegistry::in_memory([ResourceType::Library, ResourceType::Measure]);
        assert!(registry.is_supported(ResourceType::Library));
        assert_eq!(
            registry.supported_types().collect::<Vec<_>>(),
            vec![ResourceType::Library, ResourceType::Measure]
        );

        let err = registry.resource_dao(ResourceType::Claim).err().unwrap();
        assert!(matches!(err, StorageError::UnsupportedType(ResourceType::Claim)));
    }

    #[tokio::test]
    async fn test_daos_share_the_store() {
        let registry = DaoRegistry::in_memory([ResourceType::Library]);
        let dao = registry.resource_dao(ResourceType::Library).unwrap();
        let stored = dao
            .create(json!({"resourceType": "Library", "id": "lib"}))
            .await
            .unwrap();
        let reference = octofhir_core::FhirReference::new(ResourceType::Library, stored.id);
        assert!(registry.system_dao().read(&reference).await.unwrap().is_some());
    }
}
