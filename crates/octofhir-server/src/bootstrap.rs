//! Server bootstrap: wires the clinical-reasoning providers into a
//! [`ProviderRegistry`].
//!
//! Runs once per process, before the listener binds. Steps run in a fixed
//! order because later providers are built from earlier ones (cql-execution
//! needs library-operations, plan-definition-apply needs
//! activity-definition-apply). The first failure aborts startup; nothing
//! already registered is rolled back.

use std::sync::Arc;

use octofhir_core::ResourceType;
use octofhir_cql_service::{EvaluationProviderFactory, LibrarySourceCache, LocalTerminologyProvider};
use tracing::{debug, info};

use crate::config::AppConfig;
use crate::context::ApplicationContext;
use crate::error::BootstrapError;
use crate::operations::DynOperationProvider;
use crate::providers::{
    ActivityDefinitionApplyProvider, BundleApplyProvider, CacheValueSetsProvider, ClaimProvider,
    CodeSystemUpdateProvider, CqlExecutionProvider, HqmfGenerator, LibraryOperationsProvider,
    MeasureOperationsProvider, NarrativeGenerator, PatientProvider, PlanDefinitionApplyProvider,
    ResourceProvider,
};
use crate::registry::ProviderRegistry;

/// Builds a fresh registry from the context.
pub fn bootstrap(
    config: &AppConfig,
    context: &ApplicationContext,
) -> Result<ProviderRegistry, BootstrapError> {
    let mut registry = ProviderRegistry::new();
    bootstrap_into(config, context, &mut registry)?;
    Ok(registry)
}

/// Registers every provider into `registry`.
///
/// Running it twice against the same registry fails with a duplicate
/// registration error.
pub fn bootstrap_into(
    config: &AppConfig,
    context: &ApplicationContext,
    registry: &mut ProviderRegistry,
) -> Result<(), BootstrapError> {
    // Beans first: a missing bean must fail before anything is registered.
    let daos = context.dao_registry()?;
    let terminology_service = context.terminology_service()?;
    let engine = context.cql_engine();
    let http_client = context.http_client(config.terminology_timeout())?;
    info!(
        fhir_version = %config.fhir.version,
        engine = engine.name(),
        resource_types = daos.supported_types().count(),
        "Bootstrapping providers"
    );

    for resource_type in daos.supported_types().filter(|rt| !rt.has_dedicated_provider()) {
        let dao = daos.resource_dao(resource_type)?;
        registry.register_resource_provider(Arc::new(ResourceProvider::new(dao)))?;
        debug!(resource_type = %resource_type, "Registered resource provider");
    }

    // 1. terminology provider over the stored ValueSets
    let value_sets = registry.resource_provider(ResourceType::ValueSet)?;
    let terminology = Arc::new(LocalTerminologyProvider::new(
        terminology_service,
        value_sets.dao(),
    ));
    debug!(step = 1, "Terminology provider ready");

    // 2. shared evaluation factory
    let factory = EvaluationProviderFactory::new(
        config.fhir.version,
        daos.clone(),
        terminology,
        engine,
        config.cql.clone(),
    );
    debug!(step = 2, engine = factory.engine_name(), "Evaluation provider factory ready");

    // 3. helpers (not registered) and the terminology operations
    let narrative = NarrativeGenerator::new();
    let hqmf = HqmfGenerator::new();
    let code_systems = registry.resource_provider(ResourceType::CodeSystem)?;
    register(
        registry,
        3,
        Arc::new(CodeSystemUpdateProvider::new(value_sets.dao(), code_systems.dao())),
    )?;
    let endpoints = registry.resource_provider(ResourceType::Endpoint)?;
    register(
        registry,
        3,
        Arc::new(CacheValueSetsProvider::new(
            daos.system_dao(),
            endpoints.dao(),
            http_client,
            config.terminology_timeout(),
        )),
    )?;

    // 4. library operations; their source cache is shared with measures
    let library_cache = Arc::new(LibrarySourceCache::new(config.cql.cache_capacity));
    let libraries = registry.resource_provider(ResourceType::Library)?;
    let library_operations = Arc::new(
        LibraryOperationsProvider::new(libraries.clone(), narrative)
            .with_cache(library_cache.clone()),
    );
    register(registry, 4, library_operations.clone())?;

    // 5. cql execution
    let cql_execution = Arc::new(CqlExecutionProvider::new(
        library_operations,
        factory.clone(),
    ));
    register(registry, 5, cql_execution.clone())?;

    // 6. bundle apply
    let bundles = registry.resource_provider(ResourceType::Bundle)?;
    register(
        registry,
        6,
        Arc::new(BundleApplyProvider::new(factory.clone(), bundles.dao())),
    )?;

    // 7. measure operations
    let measures = registry.resource_provider(ResourceType::Measure)?;
    register(
        registry,
        7,
        Arc::new(
            MeasureOperationsProvider::new(
                daos.clone(),
                factory,
                narrative,
                hqmf,
                libraries,
                measures,
            )
            .with_cache(library_cache),
        ),
    )?;

    // 8. patient and claim, each serving CRUD through its own DAO
    let patient = PatientProvider::new(daos.system_dao(), daos.resource_dao(ResourceType::Coverage)?)
        .with_dao(daos.resource_dao(ResourceType::Patient)?);
    register_with_dao(registry, 8, Arc::new(patient))?;
    let claim = ClaimProvider::new(daos.system_dao())
        .with_dao(daos.resource_dao(ResourceType::Claim)?);
    register_with_dao(registry, 8, Arc::new(claim))?;

    // 9. activity definition apply
    let activity_definitions = registry.resource_provider(ResourceType::ActivityDefinition)?;
    let activity_apply = Arc::new(ActivityDefinitionApplyProvider::new(
        cql_execution.clone(),
        activity_definitions.dao(),
    ));
    register(registry, 9, activity_apply.clone())?;

    // 10. plan definition apply
    let plans = registry.resource_provider(ResourceType::PlanDefinition)?;
    register(
        registry,
        10,
        Arc::new(PlanDefinitionApplyProvider::new(
            activity_apply,
            plans.dao(),
            activity_definitions.dao(),
            cql_execution,
        )),
    )?;

    info!(
        providers = registry.registrations().len(),
        operations = registry.operations().len(),
        "Bootstrap complete"
    );
    Ok(())
}

fn register(
    registry: &mut ProviderRegistry,
    step: u8,
    provider: DynOperationProvider,
) -> Result<(), BootstrapError> {
    let name = provider.name();
    let operations = provider.operations().len();
    registry.register(provider)?;
    info!(step, provider = name, operations, "Registered provider");
    Ok(())
}

/// Registers a provider that must serve CRUD for its type.
fn register_with_dao(
    registry: &mut ProviderRegistry,
    step: u8,
    provider: DynOperationProvider,
) -> Result<(), BootstrapError> {
    if provider.resource_provider().is_none() {
        return Err(BootstrapError::MissingDao(provider.name()));
    }
    register(registry, step, provider)
}
