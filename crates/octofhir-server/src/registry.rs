//! Provider registry (the dispatch table).
//!
//! Built once by the bootstrapper and then shared read-only with the HTTP
//! layer. Resource providers are keyed by [`ResourceType`]; operation
//! providers keep their registration order and every operation they expose is
//! indexed by [`OperationKey`].

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use octofhir_core::ResourceType;

use crate::error::BootstrapError;
use crate::operations::{
    DynOperationProvider, OperationDefinition, OperationKey, OperationLevel,
};
use crate::providers::ResourceProvider;

/// A resolved operation binding.
#[derive(Clone)]
pub struct OperationRoute {
    pub provider: DynOperationProvider,
    pub definition: OperationDefinition,
}

#[derive(Default)]
pub struct ProviderRegistry {
    resource_providers: BTreeMap<ResourceType, Arc<ResourceProvider>>,
    providers: Vec<DynOperationProvider>,
    operations: HashMap<OperationKey, (usize, OperationDefinition)>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the CRUD provider for its resource type.
    pub fn register_resource_provider(
        &mut self,
        provider: Arc<ResourceProvider>,
    ) -> Result<(), BootstrapError> {
        let rt = provider.resource_type();
        if self.resource_providers.contains_key(&rt) {
            return Err(BootstrapError::DuplicateProvider(format!("{rt} resource provider")));
        }
        self.resource_providers.insert(rt, provider);
        Ok(())
    }

    /// Registers an operation provider, its operations and (when it has one)
    /// its CRUD provider.
    ///
    /// All checks run before anything is inserted, so a rejected provider
    /// leaves the registry unchanged.
    pub fn register(&mut self, provider: DynOperationProvider) -> Result<(), BootstrapError> {
        let name = provider.name();
        if self.providers.iter().any(|p| p.name() == name) {
            return Err(BootstrapError::DuplicateProvider(name.to_string()));
        }

        let resource_provider = provider.resource_provider();
        if let Some(rp) = &resource_provider {
            if self.resource_providers.contains_key(&rp.resource_type()) {
                return Err(BootstrapError::DuplicateProvider(format!(
                    "{} resource provider",
                    rp.resource_type()
                )));
            }
        }

        let mut bindings = Vec::new();
        for definition in provider.operations() {
            for key in definition.keys() {
                if let Some((existing, _)) = self.operations.get(&key) {
                    return Err(BootstrapError::DuplicateOperation {
                        code: key.code,
                        level: key.level,
                        resource_type: key.resource_type,
                        existing: self.providers[*existing].name().to_string(),
                    });
                }
                if bindings.iter().any(|(k, _): &(OperationKey, _)| *k == key) {
                    return Err(BootstrapError::DuplicateOperation {
                        code: key.code,
                        level: key.level,
                        resource_type: key.resource_type,
                        existing: name.to_string(),
                    });
                }
                bindings.push((key, definition.clone()));
            }
        }

        let index = self.providers.len();
        for (key, definition) in bindings {
            self.operations.insert(key, (index, definition));
        }
        if let Some(rp) = resource_provider {
            self.resource_providers.insert(rp.resource_type(), rp);
        }
        self.providers.push(provider);
        Ok(())
    }

    /// The CRUD provider for a type.
    pub fn resource_provider(
        &self,
        resource_type: ResourceType,
    ) -> Result<Arc<ResourceProvider>, BootstrapError> {
        self.resource_providers
            .get(&resource_type)
            .cloned()
            .ok_or(BootstrapError::ResourceProviderNotFound(resource_type))
    }

    pub fn resource_types(&self) -> impl Iterator<Item = ResourceType> + '_ {
        self.resource_providers.keys().copied()
    }

    pub fn provider_named(&self, name: &str) -> Option<DynOperationProvider> {
        self.providers.iter().find(|p| p.name() == name).cloned()
    }

    /// The first registered operation provider bound to a type.
    pub fn provider_for(&self, resource_type: ResourceType) -> Option<DynOperationProvider> {
        self.providers
            .iter()
            .find(|p| p.resource_type() == Some(resource_type))
            .cloned()
    }

    pub fn find_operation(
        &self,
        level: OperationLevel,
        resource_type: Option<ResourceType>,
        code: &str,
    ) -> Option<OperationRoute> {
        let key = OperationKey::new(level, resource_type, code);
        self.operations.get(&key).map(|(index, definition)| OperationRoute {
            provider: self.providers[*index].clone(),
            definition: definition.clone(),
        })
    }

    /// Names of the registered operation providers, in registration order.
    pub fn registrations(&self) -> Vec<&'static str> {
        self.providers.iter().map(|p| p.name()).collect()
    }

    pub fn operation_providers(&self) -> &[DynOperationProvider] {
        &self.providers
    }

    /// Every operation binding, sorted by key.
    pub fn operations(&self) -> Vec<(OperationKey, OperationDefinition)> {
        let mut all: Vec<_> = self
            .operations
            .iter()
            .map(|(key, (_, def))| (key.clone(), def.clone()))
            .collect();
        all.sort_by(|a, b| a.0.cmp(&b.0));
        all
    }
}

impl std::fmt::Debug for ProviderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderRegistry")
            .field("resource_providers", &self.resource_providers.keys().collect::<Vec<_>>())
            .field("providers", &self.registrations())
            .field("operations", &self.operations.len())
            .finish()
    }
}
