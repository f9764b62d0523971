//! Application context: the beans the bootstrapper wires providers from.
//!
//! The DAO registry and the terminology read service are required; a missing
//! one fails startup with [`BootstrapError::MissingBean`]. The CQL engine and
//! the outbound HTTP client are optional and fall back to
//! [`UnavailableEngine`] and a client built with the configured terminology
//! timeout.

use std::sync::Arc;
use std::time::Duration;

use octofhir_core::ResourceType;
use octofhir_cql_service::{
    DynCqlEngine, DynTerminologyReadService, StoredTerminologyService, UnavailableEngine,
};
use octofhir_storage::DaoRegistry;

use crate::config::AppConfig;
use crate::error::BootstrapError;

pub const DAO_REGISTRY_BEAN: &str = "daoRegistry";
pub const TERMINOLOGY_SERVICE_BEAN: &str = "terminologyService";

#[derive(Clone, Default)]
pub struct ApplicationContext {
    dao_registry: Option<DaoRegistry>,
    terminology_service: Option<DynTerminologyReadService>,
    /// Set once the terminology bean was supplied (or removed) explicitly;
    /// otherwise it follows the DAO registry.
    terminology_supplied: bool,
    cql_engine: Option<DynCqlEngine>,
    http_client: Option<reqwest::Client>,
}

impl ApplicationContext {
    /// An empty context; add beans with the `with_*` methods.
    pub fn new() -> Self {
        Self::default()
    }

    /// Context backed by the in-memory store for every configured type.
    ///
    /// The terminology read service is only present when CodeSystem is one
    /// of the configured types.
    pub fn in_memory(config: &AppConfig) -> Self {
        let registry = DaoRegistry::in_memory(config.fhir.resource_types.iter().copied());
        Self::new().with_dao_registry(registry)
    }

    /// Replaces the DAO registry. Unless a terminology service was supplied
    /// explicitly, the bean is rebuilt over the new registry's CodeSystems.
    pub fn with_dao_registry(mut self, registry: DaoRegistry) -> Self {
        if !self.terminology_supplied {
            self.terminology_service = stored_terminology(&registry);
        }
        self.dao_registry = Some(registry);
        self
    }

    pub fn with_terminology_service(mut self, service: DynTerminologyReadService) -> Self {
        self.terminology_service = Some(service);
        self.terminology_supplied = true;
        self
    }

    pub fn without_terminology_service(mut self) -> Self {
        self.terminology_service = None;
        self.terminology_supplied = true;
        self
    }

    pub fn with_cql_engine(mut self, engine: DynCqlEngine) -> Self {
        self.cql_engine = Some(engine);
        self
    }

    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http_client = Some(client);
        self
    }

    pub fn dao_registry(&self) -> Result<DaoRegistry, BootstrapError> {
        self.dao_registry
            .clone()
            .ok_or(BootstrapError::MissingBean(DAO_REGISTRY_BEAN))
    }

    pub fn terminology_service(&self) -> Result<DynTerminologyReadService, BootstrapError> {
        self.terminology_service
            .clone()
            .ok_or(BootstrapError::MissingBean(TERMINOLOGY_SERVICE_BEAN))
    }

    pub fn cql_engine(&self) -> DynCqlEngine {
        self.cql_engine
            .clone()
            .unwrap_or_else(|| Arc::new(UnavailableEngine))
    }

    pub fn http_client(&self, timeout: Duration) -> Result<reqwest::Client, BootstrapError> {
        match &self.http_client {
            Some(client) => Ok(client.clone()),
            None => Ok(reqwest::Client::builder().timeout(timeout).build()?),
        }
    }
}

fn stored_terminology(registry: &DaoRegistry) -> Option<DynTerminologyReadService> {
    registry
        .resource_dao(ResourceType::CodeSystem)
        .ok()
        .map(|dao| Arc::new(StoredTerminologyService::new(dao)) as DynTerminologyReadService)
}

impl std::fmt::Debug for ApplicationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApplicationContext")
            .field("dao_registry", &self.dao_registry)
            .field("terminology_service", &self.terminology_service.is_some())
            .field(
                "cql_engine",
                &self.cql_engine.as_ref().map(|e| e.name().to_string()),
            )
            .field("http_client", &self.http_client.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_cql_service::TerminologyReadService;

    #[test]
    fn test_empty_context_reports_missing_beans() {
        let ctx = ApplicationContext::new();
        assert!(matches!(
            ctx.dao_registry(),
            Err(BootstrapError::MissingBean(DAO_REGISTRY_BEAN))
        ));
        assert!(matches!(
            ctx.terminology_service(),
            Err(BootstrapError::MissingBean(TERMINOLOGY_SERVICE_BEAN))
        ));
        assert_eq!(ctx.cql_engine().name(), "unavailable");
    }

    #[test]
    fn test_in_memory_context() {
        let ctx = ApplicationContext::in_memory(&AppConfig::default());
        assert!(ctx.dao_registry().is_ok());
        assert!(ctx.terminology_service().is_ok());
        assert!(ctx.http_client(Duration::from_secs(1)).is_ok());
    }

    #[tokio::test]
    async fn test_swapped_registry_rebinds_terminology() {
        let daos = DaoRegistry::in_memory([ResourceType::CodeSystem, ResourceType::ValueSet]);
        daos.resource_dao(ResourceType::CodeSystem)
            .unwrap()
            .create(serde_json::json!({
                "resourceType": "CodeSystem",
                "url": "http://example.org/cs",
                "concept": [{"code": "a"}]
            }))
            .await
            .unwrap();

        let ctx = ApplicationContext::in_memory(&AppConfig::default()).with_dao_registry(daos);
        let found = ctx
            .terminology_service()
            .unwrap()
            .lookup("http://example.org/cs", "a")
            .await
            .unwrap();
        assert_eq!(found.map(|c| c.code).as_deref(), Some("a"));

        let without = ApplicationContext::in_memory(&AppConfig::default())
            .without_terminology_service()
            .with_dao_registry(DaoRegistry::in_memory(ResourceType::ALL.iter().copied()));
        assert!(without.terminology_service().is_err());
        let narrowed = ApplicationContext::in_memory(&AppConfig::default())
            .with_dao_registry(DaoRegistry::in_memory([ResourceType::Library]));
        assert!(narrowed.terminology_service().is_err());
    }

    #[test]
    fn test_terminology_requires_code_systems() {
        let mut cfg = AppConfig::default();
        cfg.fhir.resource_types = vec![ResourceType::Library, ResourceType::ValueSet];
        let ctx = ApplicationContext::in_memory(&cfg);
        assert!(ctx.terminology_service().is_err());
    }
}
